//! Configuration model, loading, and validation for the collector daemon.
//!
//! Mirrors the shape of `ferrex-config`: a typed model, a file-backed loader,
//! and a guard-rail validation pass that collects every problem instead of
//! failing on the first one, so a misconfigured deployment gets one
//! actionable error report instead of a trial-and-error loop.

pub mod error;
pub mod loader;
pub mod models;
pub mod validation;

pub use error::ConfigError;
pub use loader::load_from_path;
pub use models::{
    ChatConfig, Config, DatabaseEndpoint, DbToDbJobConfig, FileIngestConfig,
    ForeignJobConfig, NetworkServiceConfig, ServerConfig,
};
pub use validation::validate;
