//! Task Status Registry (spec.md §2 component 4, §4.7).

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub healthy: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            last_sync: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
}

/// A concurrency-safe map from worker name to its last-known status,
/// written by workers and read (read-only) by the dashboard's `/health`
/// handler.
#[derive(Debug, Default)]
pub struct TaskStatusRegistry {
    tasks: DashMap<String, TaskStatus>,
}

impl TaskStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&self, worker: &str, last_sync: DateTime<Utc>) {
        self.tasks.insert(
            worker.to_string(),
            TaskStatus {
                healthy: true,
                last_sync: Some(last_sync),
                last_error: None,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn mark_unhealthy(&self, worker: &str, error: impl Into<String>) {
        let last_sync = self.tasks.get(worker).and_then(|s| s.last_sync);
        self.tasks.insert(
            worker.to_string(),
            TaskStatus {
                healthy: false,
                last_sync,
                last_error: Some(error.into()),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<(String, TaskStatus)> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// `starting` (empty), `healthy` (all healthy), `degraded` (at least one
    /// healthy), `unhealthy` (none healthy) — spec.md §4.7.
    pub fn overall_status(&self) -> OverallStatus {
        if self.tasks.is_empty() {
            return OverallStatus::Starting;
        }
        let total = self.tasks.len();
        let healthy_count = self.tasks.iter().filter(|e| e.healthy).count();
        if healthy_count == total {
            OverallStatus::Healthy
        } else if healthy_count > 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_starting() {
        let registry = TaskStatusRegistry::new();
        assert_eq!(registry.overall_status(), OverallStatus::Starting);
    }

    #[test]
    fn all_healthy_is_healthy() {
        let registry = TaskStatusRegistry::new();
        registry.mark_healthy("job-a", Utc::now());
        registry.mark_healthy("job-b", Utc::now());
        assert_eq!(registry.overall_status(), OverallStatus::Healthy);
    }

    #[test]
    fn mixed_health_is_degraded() {
        let registry = TaskStatusRegistry::new();
        registry.mark_healthy("job-a", Utc::now());
        registry.mark_unhealthy("job-b", "boom");
        assert_eq!(registry.overall_status(), OverallStatus::Degraded);
    }

    #[test]
    fn all_unhealthy_is_unhealthy() {
        let registry = TaskStatusRegistry::new();
        registry.mark_unhealthy("job-a", "boom");
        assert_eq!(registry.overall_status(), OverallStatus::Unhealthy);
    }

    #[test]
    fn mark_unhealthy_preserves_last_sync() {
        let registry = TaskStatusRegistry::new();
        let ts = Utc::now();
        registry.mark_healthy("job-a", ts);
        registry.mark_unhealthy("job-a", "boom");
        let snapshot = registry.snapshot();
        let (_, status) = snapshot.iter().find(|(name, _)| name == "job-a").unwrap();
        assert_eq!(status.last_sync, Some(ts));
    }
}
