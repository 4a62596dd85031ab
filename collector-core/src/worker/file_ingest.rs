//! Sync Worker (File Directory → DB), spec.md §4.3.
//!
//! The only worker kind touching the filesystem directly; directory
//! listing, temp-file snapshotting, and xlsx parsing all run on
//! [`crate::blocking::BlockingPool`] (spec.md §5: "file-system traversal,
//! temp-file copy" are blocking work).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use calamine::{open_workbook, Reader, Xlsx};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use sqlx::PgPool;
use tracing::{error, info, warn};

use collector_config::{DatabaseEndpoint, FileIngestConfig, NetworkServiceConfig};

use crate::error::{CollectorError, Result};
use crate::pool::PoolSettings;
use crate::types::Record;
use crate::worker::backoff::Backoff;
use crate::worker::{
    destination_key, insert_batch_with_fallback, postgres_connection_string, WorkerServices,
};

const FILE_CHECK_FLOOR: Duration = Duration::from_secs(5 * 60);
const SAME_DATE_FRESHNESS: chrono::Duration = chrono::Duration::hours(2);

/// Per-file bookkeeping the worker keeps across cycles; not shared with
/// any other worker, so a plain `HashMap` behind `&mut self` suffices.
#[derive(Debug, Clone, Default)]
struct FileCheckState {
    last_checked: Option<Instant>,
}

pub struct FileIngestWorker {
    name: String,
    config: FileIngestConfig,
    destination: DatabaseEndpoint,
    services: WorkerServices,
    filename_pattern: Regex,
    checks: HashMap<String, FileCheckState>,
    /// Last time the share's mount was actually probed, throttled by
    /// `network_check_interval_secs` so a healthy mount isn't re-checked
    /// every `monitor_interval_secs` cycle (spec.md §6).
    last_network_check: Option<Instant>,
}

impl FileIngestWorker {
    pub fn new(
        name: impl Into<String>,
        config: FileIngestConfig,
        destination: DatabaseEndpoint,
        services: WorkerServices,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            destination,
            services,
            filename_pattern: Regex::new(r"^(\d{4}-\d{2}-\d{2})_TC-2\.xlsx$")
                .expect("filename pattern is a valid regex"),
            checks: HashMap::new(),
            last_network_check: None,
        }
    }

    pub async fn run(mut self) {
        if !self.config.enabled {
            info!(worker = %self.name, "file ingest worker disabled by config");
            return;
        }

        let mut backoff = Backoff::default();
        let monitor_interval = Duration::from_secs(self.config.monitor_interval_secs);

        loop {
            if self.services.shutdown.is_shutdown() {
                return;
            }
            match self.cycle().await {
                Ok(()) => {
                    backoff.reset();
                    self.services.status.mark_healthy(&self.name, Utc::now());
                }
                Err(err) => {
                    error!(worker = %self.name, error = %err, "file ingest cycle failed");
                    self.services.status.mark_unhealthy(&self.name, err.to_string());
                    let delay = backoff.fail();
                    if self.services.shutdown.sleep_or_stop(delay).await {
                        return;
                    }
                    continue;
                }
            }

            if self.services.shutdown.sleep_or_stop(monitor_interval).await {
                return;
            }
        }
    }

    async fn cycle(&mut self) -> Result<()> {
        let destination_pool = self
            .services
            .destination_pool
            .get_or_create(
                &destination_key(&self.destination),
                &postgres_connection_string(&self.destination),
                &PoolSettings::default(),
            )
            .await?;

        let watermark = crate::worker::read_watermark(
            &self.services.watermark,
            &destination_pool,
            &self.config.target_table,
        )
        .await?;

        let candidates = self.discover_candidates(watermark).await?;
        let mut total_inserted = 0usize;

        for candidate in candidates {
            let should_process = self.should_process(&candidate, watermark);
            self.mark_checked(&candidate.path);
            if !should_process {
                continue;
            }

            let inserted = self.process_file(&destination_pool, &candidate, watermark).await?;
            total_inserted += inserted;

            if candidate.is_today && candidate.modified > watermark && inserted == 0 {
                warn!(
                    worker = %self.name,
                    file = %candidate.path.display(),
                    "current-day file modified after watermark but yielded zero new rows \
                     (file still being written, not stale)"
                );
            }
        }

        // Re-read the destination's current max, bypassing the cache, to pick up
        // out-of-band writes (spec.md §4.3 "Watermark update").
        let fresh_max: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "SELECT MAX(RECTIME) FROM {}",
            self.config.target_table
        ))
        .fetch_one(&destination_pool)
        .await?;
        if let Some(fresh_max) = fresh_max {
            if fresh_max > watermark {
                self.services.watermark.set(&self.config.target_table, fresh_max);
            }
        }

        if total_inserted > 0 {
            info!(worker = %self.name, inserted = total_inserted, "file ingest cycle complete");
        }
        Ok(())
    }

    async fn discover_candidates(&mut self, watermark: DateTime<Utc>) -> Result<Vec<FileCandidate>> {
        let dir = PathBuf::from(&self.config.files_directory);
        let pattern = self.filename_pattern.clone();
        let lookback_days = self.config.days_to_search;
        let today = watermark.date_naive().max(Utc::now().date_naive());
        let service = self.config.service.clone();

        let network_check_interval = Duration::from_secs(self.config.network_check_interval_secs);
        let should_check_mount = self
            .last_network_check
            .map(|t| t.elapsed() >= network_check_interval)
            .unwrap_or(true);

        let blocking = Arc::clone(&self.services.blocking);
        let candidates = blocking
            .spawn(move || {
                if should_check_mount {
                    ensure_mounted(&dir, &service)?;
                }
                list_candidates(&dir, &pattern, lookback_days, today)
            })
            .await?;

        if should_check_mount {
            self.last_network_check = Some(Instant::now());
        }
        Ok(candidates)
    }

    /// Decides whether `candidate` should be processed this cycle (spec.md
    /// §4.3 "File discovery", Open Question 1 resolved as a logical OR of
    /// the today-file conditions — see DESIGN.md).
    fn should_process(&self, candidate: &FileCandidate, watermark: DateTime<Utc>) -> bool {
        let watermark_date = watermark.date_naive();

        if candidate.is_today {
            let state = self.checks.get(&candidate.key());
            let never_checked = state.map(|s| s.last_checked.is_none()).unwrap_or(true);
            let elapsed_since_check = state
                .and_then(|s| s.last_checked)
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);

            let interval_elapsed =
                elapsed_since_check >= Duration::from_secs(self.config.file_check_interval_secs);
            let modified_after_watermark_and_floor_elapsed =
                candidate.modified > watermark && elapsed_since_check >= FILE_CHECK_FLOOR;

            return never_checked || interval_elapsed || modified_after_watermark_and_floor_elapsed;
        }

        if candidate.file_date > watermark_date {
            return true;
        }

        if candidate.file_date == watermark_date {
            let age = Utc::now().signed_duration_since(candidate.modified);
            return age <= SAME_DATE_FRESHNESS;
        }

        false
    }

    fn mark_checked(&mut self, path: &Path) {
        self.checks
            .entry(path.display().to_string())
            .or_default()
            .last_checked = Some(Instant::now());
    }

    async fn process_file(
        &self,
        destination_pool: &PgPool,
        candidate: &FileCandidate,
        watermark: DateTime<Utc>,
    ) -> Result<usize> {
        let source_path = candidate.path.clone();
        let skip_footer = self.config.skip_footer_rows;
        let blocking = Arc::clone(&self.services.blocking);

        let parsed_rows: Vec<ParsedRow> = blocking
            .spawn(move || snapshot_and_parse(&source_path, skip_footer))
            .await?;

        let object_id = self.config.object_id.clone();
        let id_value = self.config.id_value.clone();
        let objid_value = self.config.objid_value.clone();

        let records: Vec<Record> = parsed_rows
            .into_iter()
            .filter(|row| row.timestamp > watermark)
            .map(|row| row.into_record(&object_id, &id_value, &objid_value))
            .collect();

        if records.is_empty() {
            return Ok(0);
        }

        let outcome =
            insert_batch_with_fallback(destination_pool, &self.config.target_table, &records).await?;
        let new_watermark = records.iter().map(|r| r.timestamp).max().unwrap_or(watermark);
        self.services.watermark.set(&self.config.target_table, new_watermark);
        Ok(outcome.inserted)
    }
}

struct FileCandidate {
    path: PathBuf,
    file_date: NaiveDate,
    is_today: bool,
    modified: DateTime<Utc>,
}

impl FileCandidate {
    fn key(&self) -> String {
        self.path.display().to_string()
    }
}

/// Confirms the watched directory is reachable before listing it. A
/// missing mount point surfaces as `ResourceUnavailable` (spec.md §7:
/// "network share not mountable ... re-mount attempt with stored
/// credentials"); actually invoking a platform mount command is left to
/// deployment tooling, this only distinguishes the failure so the caller
/// retries with backoff instead of treating it as a fatal data error.
fn ensure_mounted(dir: &Path, service: &NetworkServiceConfig) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    Err(CollectorError::ResourceUnavailable(format!(
        "{} is not mounted (expected credentials for user {})",
        dir.display(),
        service.run_as_user
    )))
}

fn list_candidates(
    dir: &Path,
    pattern: &Regex,
    lookback_days: u32,
    today: NaiveDate,
) -> Result<Vec<FileCandidate>> {
    let mut candidates = Vec::new();
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(captures) = pattern.captures(file_name) else {
            continue;
        };
        let Ok(file_date) = NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d") else {
            continue;
        };

        let age_days = (today - file_date).num_days();
        if age_days < 0 || age_days as u32 > lookback_days {
            continue;
        }

        let metadata = entry.metadata()?;
        let modified: DateTime<Utc> = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();

        candidates.push(FileCandidate {
            path: entry.path(),
            file_date,
            is_today: file_date == today,
            modified,
        });
    }
    Ok(candidates)
}

struct ParsedRow {
    timestamp: DateTime<Utc>,
    t1: Option<f64>,
    t2: Option<f64>,
    t3: Option<f64>,
    v1: Option<f64>,
    v2: Option<f64>,
    v3: Option<f64>,
    p1: Option<f64>,
    p2: Option<f64>,
    h1: Option<f64>,
    h2: Option<f64>,
}

impl ParsedRow {
    fn into_record(self, object_id: &str, id_value: &str, objid_value: &str) -> Record {
        Record {
            object_id: object_id.to_string(),
            id: id_value.to_string(),
            objid: objid_value.to_string(),
            timestamp: self.timestamp,
            t1: self.t1,
            t2: self.t2,
            t3: self.t3,
            t4: None,
            t5: None,
            t6: None,
            t7: None,
            t8: None,
            v1: self.v1,
            v2: self.v2,
            v3: self.v3,
            v4: None,
            v5: None,
            p1: self.p1,
            p2: self.p2,
            p3: None,
            p4: None,
            h1: self.h1,
            h2: self.h2,
            h3: None,
            h4: None,
        }
    }
}

/// Snapshots `source` into a temp file (to avoid lock contention with the
/// writer still appending to it), parses the snapshot with `calamine`, and
/// deletes the temp copy. Runs entirely on the blocking pool.
fn snapshot_and_parse(source: &Path, skip_footer_rows: usize) -> Result<Vec<ParsedRow>> {
    let snapshot = tempfile::Builder::new()
        .prefix("collector-tc2-")
        .suffix(".xlsx")
        .tempfile()?;
    std::fs::copy(source, snapshot.path())?;

    let mut workbook: Xlsx<_> = open_workbook(snapshot.path())
        .map_err(|e| CollectorError::DataFormat(format!("failed to open workbook: {e}")))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| CollectorError::DataFormat("workbook has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| CollectorError::DataFormat(format!("failed to read sheet: {e}")))?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| CollectorError::DataFormat("workbook has no header row".into()))?;
    let columns = normalize_headers(header);
    let timestamp_idx = locate_timestamp_column(&columns)
        .ok_or_else(|| CollectorError::DataFormat("could not locate timestamp column".into()))?;

    let body: Vec<_> = rows.collect();
    let body_len = body.len().saturating_sub(skip_footer_rows);

    let mut parsed = Vec::new();
    for row in body.into_iter().take(body_len) {
        let Some(timestamp) = row.get(timestamp_idx).and_then(parse_timestamp_cell) else {
            continue;
        };
        parsed.push(ParsedRow {
            timestamp,
            t1: column_value(&columns, row, "T1"),
            t2: column_value(&columns, row, "T2"),
            t3: column_value(&columns, row, "T3"),
            v1: column_value(&columns, row, "V1"),
            v2: column_value(&columns, row, "V2"),
            v3: column_value(&columns, row, "V3"),
            p1: column_value(&columns, row, "P1"),
            p2: column_value(&columns, row, "P2"),
            h1: column_value(&columns, row, "H1"),
            h2: column_value(&columns, row, "H2"),
        });
    }
    Ok(parsed)
}

/// Localized (Russian) header prefixes recognized ahead of the generic
/// strip-and-uppercase fallback, paired with the canonical field letter
/// they map to (spec.md §4.3 "Normalization"; localized vocabulary grounded
/// in `examples/original_source/check_tc2_data.py`'s `'дата' in col.lower()`
/// substring matching).
const LOCALIZED_PREFIXES: [(&str, &str); 4] = [
    ("темп", "T"),  // температура — temperature
    ("влаж", "H"),  // влажность — humidity
    ("давл", "P"),  // давление — pressure
    ("напряж", "V"), // напряжение — voltage
];

/// Canonicalizes a (possibly multi-line, unit-annotated) header cell to a
/// short field name, e.g. `"Темп.1\n(°C)"` → `"T1"` (spec.md §4.3
/// "Normalization"). A recognized localized prefix combined with the
/// cell's first digit produces the canonical name directly, since a plain
/// strip-and-uppercase pass leaves Cyrillic words untranslated; anything
/// else falls back to stripping non-alphanumeric characters (including the
/// embedded newline between the name and its unit annotation) and
/// uppercasing what remains.
fn canonical_header(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if let Some((_, letter)) = LOCALIZED_PREFIXES.iter().find(|(prefix, _)| lower.contains(prefix)) {
        if let Some(digit) = raw.chars().find(|c| c.is_ascii_digit()) {
            return format!("{letter}{digit}");
        }
    }

    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn normalize_headers(header: &[calamine::Data]) -> Vec<String> {
    header
        .iter()
        .map(|cell| canonical_header(&cell.to_string()))
        .collect()
}

/// Locates the timestamp column by canonical name, falling back to the
/// localized substring match demonstrated in production (spec.md §4.3,
/// SPEC_FULL.md §4.3: `"дата"`/`"время"` alongside `"date"`/`"time"`).
fn locate_timestamp_column(columns: &[String]) -> Option<usize> {
    columns.iter().position(|c| c == "RECTIME" || c == "TIMESTAMP").or_else(|| {
        columns.iter().position(|c| {
            let lower = c.to_lowercase();
            lower.contains("date") || lower.contains("time") || lower.contains("дата") || lower.contains("время")
        })
    })
}

fn column_value(columns: &[String], row: &[calamine::Data], canonical: &str) -> Option<f64> {
    let idx = columns.iter().position(|c| c == canonical)?;
    let raw = row.get(idx)?.to_string();
    parse_numeric(&raw)
}

/// Normalizes the decimal separator (comma→period) before parsing; an
/// unparseable value becomes null, never an error (spec.md §4.3).
fn parse_numeric(raw: &str) -> Option<f64> {
    let normalized = raw.trim().replace(',', ".");
    if normalized.is_empty() {
        return None;
    }
    normalized.parse().ok()
}

fn parse_timestamp_cell(cell: &calamine::Data) -> Option<DateTime<Utc>> {
    use calamine::Data;
    match cell {
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc)),
        Data::String(s) => parse_timestamp_string(s),
        _ => None,
    }
}

fn parse_timestamp_string(raw: &str) -> Option<DateTime<Utc>> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%d.%m.%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
    for format in FORMATS {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw.trim(), format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_worker(file_check_interval_secs: u64) -> FileIngestWorker {
        let services = WorkerServices {
            watermark: Arc::new(crate::watermark::WatermarkCache::new()),
            destination_pool: Arc::new(crate::pool::ConnectionPool::new()),
            notification_gate: Arc::new(crate::notify::NotificationGate::new(
                5,
                Duration::from_secs(60),
                Duration::from_secs(300),
            )),
            staleness: Arc::new(crate::notify::StalenessTracker::new()),
            chat: Arc::new(crate::notify::ChatNotifier::new("test-token", "test-chat")),
            status: Arc::new(crate::status::TaskStatusRegistry::new()),
            shutdown: crate::shutdown::ShutdownCoordinator::new(),
            blocking: Arc::new(crate::blocking::BlockingPool::new(1).expect("blocking pool builds")),
            notification_timeout: Duration::from_secs(2 * 3600),
        };
        let config = FileIngestConfig {
            enabled: true,
            files_directory: "/tmp/does-not-matter".into(),
            monitor_interval_secs: 60,
            days_to_search: 7,
            skip_footer_rows: 1,
            target_table: "Dynamic_TC2".into(),
            network_check_interval_secs: 300,
            file_check_interval_secs,
            object_id: "OBJ".into(),
            id_value: "1".into(),
            objid_value: "1".into(),
            service: NetworkServiceConfig {
                run_as_user: "svc".into(),
                run_as_password: "secret".into(),
            },
        };
        let destination = DatabaseEndpoint {
            host: "db.internal".into(),
            port: 5432,
            database: "metering".into(),
            user: "svc".into(),
            password: "secret".into(),
            table: None,
        };
        FileIngestWorker::new("file-ingest", config, destination, services)
    }

    /// Scenario D (current-day file throttle): a file modified at `T` is
    /// processed on the first scan, skipped on a scan two minutes later,
    /// then processed again once five minutes have elapsed since the last
    /// check and the file is still newer than the watermark.
    #[test]
    fn scenario_d_current_day_file_throttle() {
        let mut worker = test_worker(600);
        let modified = Utc::now();
        let watermark = modified - chrono::Duration::minutes(1);
        let candidate = FileCandidate {
            path: PathBuf::from("2025-12-23_TC-2.xlsx"),
            file_date: modified.date_naive(),
            is_today: true,
            modified,
        };

        // T+1min: never checked before, always processed.
        assert!(worker.should_process(&candidate, watermark));
        worker.checks.insert(
            candidate.key(),
            FileCheckState {
                last_checked: Some(Instant::now()),
            },
        );

        // T+2min: less than five minutes since the last check, skipped.
        worker.checks.insert(
            candidate.key(),
            FileCheckState {
                last_checked: Some(Instant::now() - Duration::from_secs(60)),
            },
        );
        assert!(!worker.should_process(&candidate, watermark));

        // T+7min: five minutes have elapsed since the last real check and
        // the file is still newer than the watermark, so it processes again.
        worker.checks.insert(
            candidate.key(),
            FileCheckState {
                last_checked: Some(Instant::now() - Duration::from_secs(6 * 60)),
            },
        );
        assert!(worker.should_process(&candidate, watermark));
    }

    #[test]
    fn canonical_header_strips_units_and_newlines() {
        assert_eq!(canonical_header("T1\n(°C)"), "T1C");
    }

    #[test]
    fn canonical_header_maps_localized_prefix() {
        assert_eq!(canonical_header("Темп.1\n(°C)"), "T1");
        assert_eq!(canonical_header("Влажность 2"), "H2");
    }

    /// `network_check_interval_secs` throttles the mount probe: once a
    /// check has just run, a second discovery within the interval skips
    /// `ensure_mounted` entirely, so a directory that stops being a
    /// directory between calls only surfaces as a plain I/O error from
    /// `list_candidates`, never as `ResourceUnavailable`.
    #[tokio::test]
    async fn network_check_interval_throttles_mount_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut worker = test_worker(600);
        worker.config.files_directory = dir.path().display().to_string();
        worker.config.network_check_interval_secs = 3600;
        let watermark = Utc::now() - chrono::Duration::days(1);

        worker
            .discover_candidates(watermark)
            .await
            .expect("first discovery mounts and lists successfully");
        assert!(worker.last_network_check.is_some());

        let dir_path = dir.path().to_path_buf();
        std::fs::remove_dir(&dir_path).expect("remove directory");
        std::fs::write(&dir_path, b"not a directory").expect("replace with a plain file");

        let result = worker.discover_candidates(watermark).await;
        assert!(matches!(result, Err(CollectorError::Io(_))));
    }

    #[test]
    fn locate_timestamp_column_matches_localized_substring() {
        let columns = vec!["ДАТА\nВРЕМЯ".to_string(), "T1".to_string()];
        let canon: Vec<String> = columns.iter().map(|c| canonical_header(c)).collect();
        assert_eq!(locate_timestamp_column(&canon), Some(0));
    }

    #[test]
    fn parse_numeric_normalizes_comma_separator() {
        assert_eq!(parse_numeric("12,5"), Some(12.5));
        assert_eq!(parse_numeric("n/a"), None);
        assert_eq!(parse_numeric(""), None);
    }

    #[test]
    fn parse_timestamp_string_accepts_iso_and_dotted_formats() {
        assert!(parse_timestamp_string("2025-01-01 00:00:05").is_some());
        assert!(parse_timestamp_string("01.01.2025 00:00:05").is_some());
        assert!(parse_timestamp_string("not a date").is_none());
    }

    #[test]
    fn filename_pattern_extracts_iso_date() {
        let worker_pattern = Regex::new(r"^(\d{4}-\d{2}-\d{2})_TC-2\.xlsx$").unwrap();
        let caps = worker_pattern.captures("2025-12-23_TC-2.xlsx").unwrap();
        assert_eq!(&caps[1], "2025-12-23");
    }
}
