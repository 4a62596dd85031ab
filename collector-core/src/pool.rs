//! Keyed connection pool registry (spec.md §2 component 2, §4.4).
//!
//! Grounded in `ferrex-core::database::postgres::PostgresDatabase::new`'s
//! `PgPoolOptions` builder. The teacher owns exactly one pool for the one
//! database it talks to; this rewrite's destinations are only known at
//! config-load time and several jobs can share a destination, so the single
//! `PgPool` field becomes a [`dashmap::DashMap`] keyed on
//! [`crate::types::PoolKey`], built lazily the first time a worker asks for
//! that `(server, database, user)` triple.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;
use crate::types::PoolKey;

/// Per-key snapshot for the dashboard's `/health` endpoint (spec.md §4.4:
/// "per-key: size, idle, in-use, overflow, invalid").
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
    pub overflow: u32,
    pub invalid: u32,
}

/// Connection settings shared by every pool this registry creates
/// (spec.md §4.4: "pool_size=5 base + overflow=10"). Per-job overrides are
/// applied at `get_or_create` time.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout: Duration::from_secs(30),
            // "each checked-in connection older than 1 hour is recycled" (spec.md §4.4).
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolSettings {
    fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

struct PoolEntry {
    pool: PgPool,
    pool_size: u32,
}

/// Lazily-built, keyed registry of destination-database pools. Two jobs
/// configured against the same `(server, database, user)` triple share one
/// pool rather than each opening their own.
#[derive(Default)]
pub struct ConnectionPool {
    pools: DashMap<PoolKey, PoolEntry>,
    /// Connection-establishment failures observed per key, surfaced as
    /// `PoolStats::invalid` — sqlx itself gives no per-connection validity
    /// count, so this counts reconnect attempts that failed instead.
    invalid_counts: DashMap<PoolKey, AtomicU32>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for `key`, connecting and registering one first if
    /// this is the first request for that key.
    pub async fn get_or_create(
        &self,
        key: &PoolKey,
        connection_string: &str,
        settings: &PoolSettings,
    ) -> Result<PgPool> {
        if let Some(entry) = self.pools.get(key) {
            return Ok(entry.pool.clone());
        }

        let pool = self
            .connect(key, connection_string, settings)
            .await
            .inspect_err(|_| {
                self.invalid_counts
                    .entry(key.clone())
                    .or_insert_with(|| AtomicU32::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            })?;

        info!(
            server = %key.server,
            database = %key.database,
            pool_size = settings.pool_size,
            max_overflow = settings.max_overflow,
            "opened destination connection pool"
        );

        let entry = PoolEntry {
            pool: pool.clone(),
            pool_size: settings.pool_size,
        };
        // Another worker may have raced us to the same key; keep whichever
        // pool landed first and let this one drop.
        if let Some(existing) = self.pools.get(key) {
            return Ok(existing.pool.clone());
        }
        self.pools.insert(key.clone(), entry);
        Ok(pool)
    }

    async fn connect(
        &self,
        _key: &PoolKey,
        connection_string: &str,
        settings: &PoolSettings,
    ) -> Result<PgPool> {
        let connect_options: PgConnectOptions = connection_string.parse()?;
        let connect_options = connect_options.ssl_mode(PgSslMode::Prefer);

        Ok(PgPoolOptions::new()
            .max_connections(settings.max_connections())
            .min_connections(settings.pool_size)
            .acquire_timeout(settings.acquire_timeout)
            .max_lifetime(settings.max_lifetime)
            .idle_timeout(settings.idle_timeout)
            .test_before_acquire(true)
            .connect_with(connect_options)
            .await?)
    }

    fn invalid_count(&self, key: &PoolKey) -> u32 {
        self.invalid_counts
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn stats(&self, key: &PoolKey) -> Option<PoolStats> {
        self.pools.get(key).map(|entry| {
            let size = entry.pool.size();
            let idle = entry.pool.num_idle() as u32;
            PoolStats {
                size,
                idle,
                in_use: size.saturating_sub(idle),
                overflow: size.saturating_sub(entry.pool_size),
                invalid: self.invalid_count(key),
            }
        })
    }

    pub fn snapshot(&self) -> Vec<(PoolKey, PoolStats)> {
        self.pools
            .iter()
            .map(|entry| {
                let size = entry.pool.size();
                let idle = entry.pool.num_idle() as u32;
                let stats = PoolStats {
                    size,
                    idle,
                    in_use: size.saturating_sub(idle),
                    overflow: size.saturating_sub(entry.pool_size),
                    invalid: self.invalid_count(entry.key()),
                };
                (entry.key().clone(), stats)
            })
            .collect()
    }

    /// Close every pool this registry owns. Called once from the shutdown
    /// path after every worker has finished its in-flight cycle.
    pub async fn dispose_all(&self) {
        let keys: Vec<PoolKey> = self.pools.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pools.remove(&key) {
                entry.pool.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_absent_before_creation() {
        let registry = ConnectionPool::new();
        let key = PoolKey::new("db.example.com", "metering", "collector");
        assert!(registry.stats(&key).is_none());
    }

    #[test]
    fn default_settings_are_sane() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections(), 15);
        assert!(settings.acquire_timeout > Duration::from_secs(0));
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
    }
}
