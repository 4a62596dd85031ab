//! Watermark Cache (spec.md §2 component 1, §4.6).
//!
//! A concurrency-safe map from destination table id to the greatest
//! timestamp known to be persisted there. Purely an optimization: every
//! caller is expected to fall back to `SELECT MAX(timestamp)` when the
//! cache is absent, so correctness never depends on this structure being
//! populated or fresh.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct WatermarkEntry {
    pub timestamp: DateTime<Utc>,
    pub updated_at: Instant,
}

#[derive(Debug, Default)]
pub struct WatermarkCache {
    entries: DashMap<String, WatermarkEntry>,
}

impl WatermarkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached watermark for `table`, if any. A miss means the
    /// caller must re-read from the destination, not that the watermark is
    /// unset.
    pub fn get(&self, table: &str) -> Option<DateTime<Utc>> {
        self.entries.get(table).map(|entry| entry.timestamp)
    }

    /// Store `timestamp` for `table` unconditionally. Callers are
    /// responsible for monotonicity — this is a cache, not a ledger.
    pub fn set(&self, table: &str, timestamp: DateTime<Utc>) {
        self.entries.insert(
            table.to_string(),
            WatermarkEntry {
                timestamp,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
