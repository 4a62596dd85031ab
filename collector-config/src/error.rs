use thiserror::Error;

/// Startup-phase configuration failures. Fatal: the process exits non-zero
/// with the full list rendered for a human (spec.md §7's `ConfigInvalid`).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}
