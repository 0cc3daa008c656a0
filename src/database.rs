//! Shared persistence layer: a fail-fast connection pool behind an optional
//! probabilistic cache.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::models::DatabaseConfig;

struct PoolState {
    pool_size: u32,
    leased: u32,
    epoch: u64,
    rng: StdRng,
    total_queries: u64,
    cache_hits: u64,
    cache_misses: u64,
    exhausted: u64,
}

impl PoolState {
    fn available(&self) -> u32 {
        self.pool_size.saturating_sub(self.leased)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatabaseSnapshot {
    pub pool_size: u32,
    pub available_connections: u32,
    pub cache_enabled: bool,
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pool_exhausted: u64,
    pub cache_hit_rate: f64,
}

pub enum QueryOutcome {
    CacheHit,
    Leased(ConnectionLease),
    PoolExhausted,
}

impl QueryOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, QueryOutcome::PoolExhausted)
    }
}

pub struct DatabaseLayer {
    configured_pool: u32,
    cache_enabled: bool,
    cache_hit_rate: f64,
    query_latency_ms: f64,
    state: Arc<Mutex<PoolState>>,
}

impl DatabaseLayer {
    pub fn new(config: &DatabaseConfig, seed: u64) -> Result<Self> {
        if config.connection_pool == 0 {
            return Err(Error::config(
                "database.connection_pool",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&config.cache_hit_rate) {
            return Err(Error::config(
                "database.cache_hit_rate",
                "must be between 0 and 1",
            ));
        }
        if !config.query_latency.is_finite() || config.query_latency < 0.0 {
            return Err(Error::config(
                "database.query_latency",
                "must be non-negative",
            ));
        }

        Ok(Self {
            configured_pool: config.connection_pool,
            cache_enabled: config.cache_enabled,
            cache_hit_rate: config.cache_hit_rate,
            query_latency_ms: config.query_latency * 1000.0,
            state: Arc::new(Mutex::new(PoolState {
                pool_size: config.connection_pool,
                leased: 0,
                epoch: 0,
                rng: StdRng::seed_from_u64(seed),
                total_queries: 0,
                cache_hits: 0,
                cache_misses: 0,
                exhausted: 0,
            })),
        })
    }

    pub fn query_latency_ms(&self) -> f64 {
        self.query_latency_ms
    }

    /// Serves a query from cache or a pooled connection. Never blocks: an
    /// empty pool is reported as [`QueryOutcome::PoolExhausted`].
    pub fn query(&self, key: &str) -> QueryOutcome {
        let mut state = self.state.lock();
        state.total_queries += 1;

        if self.cache_enabled && state.rng.gen_bool(self.cache_hit_rate) {
            state.cache_hits += 1;
            trace!(key, "cache hit");
            return QueryOutcome::CacheHit;
        }
        state.cache_misses += 1;

        if state.available() == 0 {
            state.exhausted += 1;
            trace!(key, "pool exhausted");
            return QueryOutcome::PoolExhausted;
        }
        state.leased += 1;

        QueryOutcome::Leased(ConnectionLease {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
        })
    }

    pub fn available_connections(&self) -> u32 {
        self.state.lock().available()
    }

    pub fn pool_size(&self) -> u32 {
        self.state.lock().pool_size
    }

    /// Shrinks the effective pool, never below one connection.
    pub fn shrink_pool(&self, by: u32) {
        let mut state = self.state.lock();
        state.pool_size = state.pool_size.saturating_sub(by).max(1);
        debug!(pool_size = state.pool_size, "pool shrunk");
    }

    pub fn restore_pool(&self) {
        let mut state = self.state.lock();
        state.pool_size = self.configured_pool;
    }

    /// Returns every leased connection to the pool. Outstanding leases become
    /// no-ops when dropped.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        state.leased = 0;
        state.epoch += 1;
    }

    pub fn snapshot(&self) -> DatabaseSnapshot {
        let state = self.state.lock();
        let cache_hit_rate = if state.total_queries == 0 {
            0.0
        } else {
            state.cache_hits as f64 / state.total_queries as f64
        };
        DatabaseSnapshot {
            pool_size: state.pool_size,
            available_connections: state.available(),
            cache_enabled: self.cache_enabled,
            total_queries: state.total_queries,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            pool_exhausted: state.exhausted,
            cache_hit_rate,
        }
    }
}

/// A pooled connection, returned to the pool on drop.
pub struct ConnectionLease {
    state: Arc<Mutex<PoolState>>,
    epoch: u64,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.epoch == self.epoch {
            state.leased = state.leased.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(pool: u32, cache_enabled: bool) -> DatabaseLayer {
        DatabaseLayer::new(
            &DatabaseConfig {
                connection_pool: pool,
                cache_enabled,
                ..DatabaseConfig::default()
            },
            11,
        )
        .unwrap()
    }

    #[test]
    fn third_concurrent_miss_exhausts_pool_of_two() {
        let db = layer(2, false);
        let first = db.query("a");
        let second = db.query("b");
        assert!(matches!(first, QueryOutcome::Leased(_)));
        assert!(matches!(second, QueryOutcome::Leased(_)));
        assert!(db.query("c").is_exhausted());
        assert_eq!(db.available_connections(), 0);

        drop(first);
        assert_eq!(db.available_connections(), 1);
        assert!(matches!(db.query("d"), QueryOutcome::Leased(_)));

        let snapshot = db.snapshot();
        assert_eq!(snapshot.pool_exhausted, 1);
        assert_eq!(snapshot.cache_misses, snapshot.total_queries);
    }

    #[test]
    fn hits_plus_misses_equal_total_queries() {
        let db = layer(4, true);
        let mut held = Vec::new();
        for idx in 0..500 {
            let outcome = db.query(&format!("k{}", idx));
            if idx % 3 == 0 {
                held.push(outcome);
            }
            let snapshot = db.snapshot();
            assert!(snapshot.available_connections <= snapshot.pool_size);
        }
        let snapshot = db.snapshot();
        assert_eq!(snapshot.total_queries, 500);
        assert_eq!(snapshot.cache_hits + snapshot.cache_misses, 500);
        assert!(snapshot.cache_hit_rate > 0.6 && snapshot.cache_hit_rate < 0.8);
    }

    #[test]
    fn cache_hits_do_not_touch_the_pool() {
        let db = DatabaseLayer::new(
            &DatabaseConfig {
                connection_pool: 1,
                cache_enabled: true,
                cache_hit_rate: 1.0,
                ..DatabaseConfig::default()
            },
            0,
        )
        .unwrap();
        for key in ["a", "b", "c"] {
            assert!(matches!(db.query(key), QueryOutcome::CacheHit));
        }
        assert_eq!(db.available_connections(), 1);
    }

    #[test]
    fn shrink_keeps_available_within_pool_size() {
        let db = layer(6, false);
        let leases: Vec<_> = (0..4).map(|idx| db.query(&idx.to_string())).collect();
        db.shrink_pool(4);
        assert_eq!(db.pool_size(), 2);
        assert_eq!(db.available_connections(), 0);
        assert!(db.query("x").is_exhausted());

        db.shrink_pool(100);
        assert_eq!(db.pool_size(), 1);

        drop(leases);
        assert_eq!(db.available_connections(), 1);
        db.restore_pool();
        assert_eq!(db.available_connections(), 6);
    }

    #[test]
    fn release_all_reclaims_outstanding_leases() {
        let db = layer(3, false);
        let leases: Vec<_> = (0..3).map(|idx| db.query(&idx.to_string())).collect();
        assert_eq!(db.available_connections(), 0);
        db.release_all();
        assert_eq!(db.available_connections(), 3);
        drop(leases);
        assert_eq!(db.available_connections(), 3);
    }

    #[test]
    fn rejects_empty_pool() {
        let err = DatabaseLayer::new(
            &DatabaseConfig {
                connection_pool: 0,
                ..DatabaseConfig::default()
            },
            0,
        )
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "invalid config field 'database.connection_pool': must be greater than 0"
        );
    }
}
