use regex::Regex;
use std::sync::LazyLock;

use crate::{ConfigError, models::Config};

/// Matches a safe, bare SQL identifier. Table names are interpolated
/// directly into query text (Postgres has no bind-parameter form for
/// identifiers), so every table name reaching a worker must pass this
/// check at config-load time rather than being escaped ad hoc at query time.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid"));

fn check_identifier(errors: &mut Vec<String>, field: &str, value: &str) {
    if !IDENTIFIER.is_match(value) {
        errors.push(format!(
            "{field} '{value}' is not a safe SQL identifier (must match [A-Za-z_][A-Za-z0-9_]*)"
        ));
    }
}

/// Guard-rail validation: collects every problem in one pass instead of
/// stopping at the first, mirroring `ferrex-config::validation`'s report
/// style. Returns non-fatal warnings on success.
pub fn validate(config: &Config) -> Result<Vec<String>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.destination.host.trim().is_empty() {
        errors.push("destination.host must not be empty".to_string());
    }
    if config.destination.database.trim().is_empty() {
        errors.push("destination.database must not be empty".to_string());
    }
    if config.sync_interval_secs == 0 {
        errors.push("sync_interval_secs must be positive".to_string());
    }
    if config.notification_timeout_secs == 0 {
        errors.push("notification_timeout_secs must be positive".to_string());
    }
    if config.chat.bot_token.trim().is_empty() {
        errors.push("chat.bot_token must not be empty".to_string());
    }
    if config.chat.chat_id.trim().is_empty() {
        errors.push("chat.chat_id must not be empty".to_string());
    }
    if config.chat.rate_limit_messages == 0 {
        errors.push("chat.rate_limit_messages must be positive".to_string());
    }

    for job in &config.db_to_db_jobs {
        match &job.source.table {
            Some(table) => check_identifier(&mut errors, &format!("db_to_db job '{}' source.table", job.name), table),
            None => errors.push(format!("db_to_db job '{}' must set source.table", job.name)),
        }
        if job.destination_table.trim().is_empty() {
            errors.push(format!(
                "db_to_db job '{}' must set destination_table",
                job.name
            ));
        } else {
            check_identifier(
                &mut errors,
                &format!("db_to_db job '{}' destination_table", job.name),
                &job.destination_table,
            );
        }
    }

    for job in &config.foreign_jobs {
        match &job.foreign.table {
            Some(table) => check_identifier(&mut errors, &format!("foreign job '{}' foreign.table", job.name), table),
            None => errors.push(format!("foreign job '{}' must set foreign.table", job.name)),
        }
        if job.object_filter_id.trim().is_empty() {
            errors.push(format!(
                "foreign job '{}' must set object_filter_id",
                job.name
            ));
        }
        if !job.destination_table.trim().is_empty() {
            check_identifier(
                &mut errors,
                &format!("foreign job '{}' destination_table", job.name),
                &job.destination_table,
            );
        }
    }

    if let Some(ingest) = &config.file_ingest {
        if ingest.enabled && ingest.files_directory.trim().is_empty() {
            errors.push("file_ingest.files_directory must not be empty when enabled".to_string());
        }
        if ingest.enabled && ingest.target_table.trim().is_empty() {
            errors.push("file_ingest.target_table must not be empty when enabled".to_string());
        } else if ingest.enabled {
            check_identifier(&mut errors, "file_ingest.target_table", &ingest.target_table);
        }
    } else {
        warnings.push("no file_ingest block configured; file-directory ingest is disabled".to_string());
    }

    if config.db_to_db_jobs.is_empty() && config.foreign_jobs.is_empty() {
        warnings.push("no db_to_db_jobs or foreign_jobs configured; only file ingest (if any) will run".to_string());
    }

    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors));
    }

    Ok(warnings)
}
