//! The incremental synchronization engine.
//!
//! Every long-lived service here is a plain value constructed once at
//! startup and passed explicitly to the workers and the dashboard that need
//! it — there is no process-wide mutable singleton. Each shared structure
//! guards its own state behind one mutex (or a sharded map, for
//! [`dashmap::DashMap`]-backed ones); no worker ever holds two of these
//! locks at once.

pub mod blocking;
pub mod dashboard;
pub mod error;
pub mod notify;
pub mod pool;
pub mod shutdown;
pub mod status;
pub mod types;
pub mod watermark;
pub mod worker;

pub use error::{CollectorError, Result};
pub use shutdown::ShutdownCoordinator;
pub use status::TaskStatusRegistry;
pub use watermark::WatermarkCache;
