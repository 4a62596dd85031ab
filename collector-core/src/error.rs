use thiserror::Error;

/// Error taxonomy for the synchronization engine (spec.md §7).
///
/// `ConfigInvalid` lives in `collector_config::ConfigError` — it is a
/// startup-only concern and never crosses into a running worker. Everything
/// here is handled locally by the worker that produced it; a worker marking
/// itself unhealthy through [`crate::status::TaskStatusRegistry`] is the
/// only thing that ever surfaces one of these outside its own loop.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transient connectivity failure: {0}")]
    TransientConnectivity(String),

    #[error("duplicate-key integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("unparseable data: {0}")]
    DataFormat(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Foreign(#[from] mysql::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected fatal error: {0}")]
    UnexpectedFatal(#[from] anyhow::Error),
}

impl CollectorError {
    /// True when `self` is a duplicate-key failure from a batch insert,
    /// the trigger for the per-row fallback insert path (spec.md §4.1).
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            CollectorError::IntegrityViolation(_) => true,
            CollectorError::Database(sqlx::Error::Database(db_err)) => {
                db_err.is_unique_violation()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
