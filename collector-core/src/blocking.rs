//! Bridge from async workers to the blocking work that can't be `.await`ed:
//! the self-pooling `mysql` client and `calamine`'s synchronous xlsx reader
//! (spec.md §4.2, §4.3).
//!
//! A dedicated [`rayon::ThreadPool`] rather than `tokio::task::spawn_blocking`
//! keeps this crate's blocking concurrency bounded independently of the
//! tokio runtime's own blocking pool, and gives the foreign-DB and
//! file-ingest workers a single named pool to reason about sizing for.

use std::future::Future;

use rayon::ThreadPool;
use tokio::sync::oneshot;

use crate::error::{CollectorError, Result};

/// Default worker count when configuration doesn't specify one (spec.md
/// §4.2: "sized generously — the foreign driver and xlsx parser are the
/// only consumers").
pub const DEFAULT_BLOCKING_THREADS: usize = 12;

pub struct BlockingPool {
    pool: ThreadPool,
}

impl BlockingPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("collector-blocking-{i}"))
            .build()
            .map_err(|e| CollectorError::UnexpectedFatal(e.into()))?;
        Ok(Self { pool })
    }

    /// Run `work` on the blocking pool and await its result from async
    /// context. If the blocking closure panics, the oneshot sender is
    /// dropped and the awaiting side gets a `ResourceUnavailable` error
    /// rather than a propagated panic.
    pub fn spawn<F, T>(&self, work: F) -> impl Future<Output = Result<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(work());
        });
        async move {
            rx.await.map_err(|_| {
                CollectorError::ResourceUnavailable(
                    "blocking task dropped its result, the worker thread likely panicked".into(),
                )
            })?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_closure_and_returns_its_result() {
        let pool = BlockingPool::new(2).unwrap();
        let result = pool.spawn(|| Ok(2 + 2)).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn spawn_propagates_error_from_closure() {
        let pool = BlockingPool::new(2).unwrap();
        let result: Result<()> = pool
            .spawn(|| Err(CollectorError::DataFormat("bad row".into())))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn panicking_closure_surfaces_as_resource_unavailable() {
        let pool = BlockingPool::new(2).unwrap();
        let result: Result<()> = pool.spawn(|| panic!("boom")).await;
        assert!(matches!(result, Err(CollectorError::ResourceUnavailable(_))));
    }
}
