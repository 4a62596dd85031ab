//! The process-wide shutdown signal, observed by every blocking wait and
//! every backoff sleep (spec.md §2 component 6, §5).
//!
//! Grounded in `ferrex-core`'s `OrchestratorRuntime`, which hands a clone of
//! one `tokio_util::sync::CancellationToken` to every spawned worker and
//! races it against each worker's own wait point with `tokio::select!`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Signal every worker and sleeper to stop.
    pub fn signal(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration`, or return early if shutdown is signaled.
    /// Returns `true` if shutdown fired during the sleep, `false` if the
    /// full duration elapsed. Every inter-cycle sleep and backoff wait in
    /// this crate goes through this so shutdown latency is bounded by the
    /// longest in-flight I/O timeout, never by a fixed sleep (spec.md §5).
    pub async fn sleep_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// A future that resolves when shutdown is signaled; for use directly
    /// inside a caller's own `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sleep_or_stop_returns_false_when_not_signaled() {
        let shutdown = ShutdownCoordinator::new();
        let fired = shutdown.sleep_or_stop(Duration::from_millis(10)).await;
        assert!(!fired);
    }

    /// Scenario F (shutdown): a signal arriving while a worker is asleep
    /// between cycles wakes it within the outer `timeout`, well under the
    /// full remaining sleep duration.
    #[tokio::test]
    async fn sleep_or_stop_returns_true_promptly_when_signaled() {
        let shutdown = ShutdownCoordinator::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.sleep_or_stop(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.signal();

        let fired = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("should not time out")
            .expect("task should not panic");
        assert!(fired);
    }
}
