use std::path::Path;

use crate::{ConfigError, models::Config, validation};

/// Load and validate configuration from a TOML file at `path`.
///
/// Returns [`ConfigError::Invalid`] with the full list of problems found if
/// validation fails, so the caller can print a single human-readable report
/// and exit rather than looping on one error at a time. On success, also
/// returns any non-fatal warnings (e.g. a job referencing an unnamed table)
/// for the caller to log through its own tracing setup.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<(Config, Vec<String>), ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let warnings = validation::validate(&config)?;
    Ok((config, warnings))
}
