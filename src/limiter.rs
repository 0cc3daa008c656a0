//! Hard caps every run is validated against before it starts.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{ClusterConfig, RunParams};

pub const MAX_THREADS: usize = 1_000;
pub const MAX_SIMULATION_SECS: u64 = 3_600;
pub const MAX_EVENTS_PER_SECOND: u64 = 1_000_000;
pub const MAX_BACKENDS: usize = 128;
pub const MAX_DB_POOL: u32 = 50_000;
pub const MAX_TICKS: u64 = 10_000;
pub const MIN_TICK_MS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SafetyLimits {
    pub max_threads: usize,
    pub max_duration_secs: u64,
    pub max_events_per_second: u64,
    pub max_backends: usize,
    pub max_db_pool: u32,
    pub max_ticks: u64,
    pub min_tick_ms: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_threads: MAX_THREADS,
            max_duration_secs: MAX_SIMULATION_SECS,
            max_events_per_second: MAX_EVENTS_PER_SECOND,
            max_backends: MAX_BACKENDS,
            max_db_pool: MAX_DB_POOL,
            max_ticks: MAX_TICKS,
            min_tick_ms: MIN_TICK_MS,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SafetyLimiter {
    limits: SafetyLimits,
}

impl SafetyLimiter {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn check_run(&self, params: &RunParams) -> Result<()> {
        if params.workers == 0 {
            return Err(Error::config("workers", "must be greater than 0"));
        }
        exceeds("workers", params.workers as u64, self.limits.max_threads as u64)?;

        if params.duration_secs == 0 {
            return Err(Error::config("duration", "must be greater than 0"));
        }
        exceeds(
            "duration",
            params.duration_secs,
            self.limits.max_duration_secs,
        )?;

        if params.rate == 0 {
            return Err(Error::config("rate", "must be greater than 0"));
        }
        exceeds("rate", params.rate, self.limits.max_events_per_second)?;

        if params.tick_ms < self.limits.min_tick_ms {
            return Err(Error::config(
                "tick_ms",
                format!("must be at least {}", self.limits.min_tick_ms),
            ));
        }
        if params.tick_ms > params.duration_secs * 1000 {
            return Err(Error::config("tick_ms", "must not exceed the run duration"));
        }
        exceeds("ticks", params.total_ticks(), self.limits.max_ticks)?;

        if !(0.0..1.0).contains(&params.jitter) {
            return Err(Error::config("jitter", "must be within [0, 1)"));
        }
        let fault_rate = params.fault_rate();
        if !(0.0..=1.0).contains(&fault_rate) {
            return Err(Error::config("chaos_rate", "must be within [0, 1]"));
        }

        Ok(())
    }

    pub fn check_cluster(&self, config: &ClusterConfig) -> Result<()> {
        self.check_backend_count(config.backends.len())?;
        exceeds(
            "database.connection_pool",
            config.database.connection_pool as u64,
            self.limits.max_db_pool as u64,
        )?;
        for backend in &config.backends {
            exceeds(
                "workers",
                backend.workers as u64,
                self.limits.max_threads as u64,
            )?;
            exceeds(
                "max_queue",
                backend.max_queue as u64,
                self.limits.max_events_per_second,
            )?;
        }
        Ok(())
    }

    pub fn check_backend_count(&self, count: usize) -> Result<()> {
        exceeds("backends", count as u64, self.limits.max_backends as u64)
    }

    /// Largest number of requests a single tick may generate.
    pub fn events_per_tick(&self, tick_ms: u64) -> u64 {
        (self.limits.max_events_per_second * tick_ms / 1000).max(1)
    }

    /// Caps a tick's request count, returning `(allowed, dropped)`.
    pub fn cap_events(&self, requested: u64, tick_ms: u64) -> (u64, u64) {
        let ceiling = self.events_per_tick(tick_ms);
        let allowed = requested.min(ceiling);
        (allowed, requested - allowed)
    }
}

fn exceeds(field: &'static str, requested: u64, limit: u64) -> Result<()> {
    if requested > limit {
        return Err(Error::SafetyLimitExceeded {
            field,
            requested,
            limit,
        });
    }
    Ok(())
}
