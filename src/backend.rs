//! Single-server queueing and degradation model.
//!
//! A backend admits a request unless its load factor (queue depth over
//! `max_queue`) has reached the refuse threshold. Admitted requests hold a
//! queue slot for their simulated processing time; latency and failure odds
//! grow with the load factor observed at admission.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::events::{FailureKind, Outcome, RefusalReason, Request};
use crate::models::BackendConfig;

/// Load classification derived from the current load factor. Never stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendHealth {
    Accepting,
    Degraded,
    Critical,
    Refusing,
}

/// Validated, immutable parameters of one backend. Latencies are in ms.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendProfile {
    pub name: String,
    pub workers: u32,
    pub max_queue: u32,
    pub base_latency_ms: f64,
    pub max_latency_ms: f64,
    pub error_threshold: f64,
    pub timeout_threshold: f64,
    pub refuse_threshold: f64,
    pub max_error_probability: f64,
    pub max_timeout_probability: f64,
}

impl BackendProfile {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(Error::config("name", "must not be empty"));
        }
        if config.workers == 0 {
            return Err(field_error(config, "workers", "must be greater than 0"));
        }
        if config.max_queue == 0 {
            return Err(field_error(config, "max_queue", "must be greater than 0"));
        }
        if !config.base_latency.is_finite() || config.base_latency < 0.0 {
            return Err(field_error(config, "base_latency", "must be non-negative"));
        }
        if !config.max_latency.is_finite() || config.max_latency < config.base_latency {
            return Err(field_error(config, "max_latency", "must be >= base_latency"));
        }
        for (field, value) in [
            ("error_threshold", config.error_threshold),
            ("timeout_threshold", config.timeout_threshold),
            ("refuse_threshold", config.refuse_threshold),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(field_error(config, field, "must be between 0 and 2.0"));
            }
        }
        if config.error_threshold > config.timeout_threshold {
            return Err(field_error(
                config,
                "error_threshold",
                "must not exceed timeout_threshold",
            ));
        }
        if config.timeout_threshold > config.refuse_threshold {
            return Err(field_error(
                config,
                "timeout_threshold",
                "must not exceed refuse_threshold",
            ));
        }
        for (field, value) in [
            ("max_error_probability", config.max_error_probability),
            ("max_timeout_probability", config.max_timeout_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(field_error(config, field, "must be between 0 and 1"));
            }
        }
        if config.max_error_probability + config.max_timeout_probability > 1.0 {
            return Err(field_error(
                config,
                "max_error_probability",
                "plus max_timeout_probability must not exceed 1",
            ));
        }

        Ok(Self {
            name: config.name.clone(),
            workers: config.workers,
            max_queue: config.max_queue,
            base_latency_ms: config.base_latency * 1000.0,
            max_latency_ms: config.max_latency * 1000.0,
            error_threshold: config.error_threshold,
            timeout_threshold: config.timeout_threshold,
            refuse_threshold: config.refuse_threshold,
            max_error_probability: config.max_error_probability,
            max_timeout_probability: config.max_timeout_probability,
        })
    }

    pub fn load_factor(&self, queue_depth: u32) -> f64 {
        queue_depth as f64 / self.max_queue as f64
    }

    /// Upper bound on queue depth: the first depth whose load factor reaches
    /// the refuse threshold. At most `max_queue` unless the refuse threshold
    /// is above 1.0, which lets the queue run past `max_queue`.
    pub fn queue_capacity(&self) -> u32 {
        let mut capacity = (self.max_queue as f64 * self.refuse_threshold).floor() as u32;
        while self.load_factor(capacity) < self.refuse_threshold {
            capacity += 1;
        }
        while capacity > 0 && self.load_factor(capacity - 1) >= self.refuse_threshold {
            capacity -= 1;
        }
        capacity
    }

    pub fn health(&self, load_factor: f64) -> BackendHealth {
        if load_factor >= self.refuse_threshold {
            BackendHealth::Refusing
        } else if load_factor >= self.timeout_threshold {
            BackendHealth::Critical
        } else if load_factor >= self.error_threshold {
            BackendHealth::Degraded
        } else {
            BackendHealth::Accepting
        }
    }

    pub fn latency_ms(&self, load_factor: f64) -> f64 {
        self.base_latency_ms + (self.max_latency_ms - self.base_latency_ms) * growth(load_factor)
    }

    pub fn error_probability(&self, load_factor: f64) -> f64 {
        ramp_probability(
            load_factor,
            self.error_threshold,
            self.refuse_threshold,
            self.max_error_probability,
        )
    }

    pub fn timeout_probability(&self, load_factor: f64) -> f64 {
        ramp_probability(
            load_factor,
            self.timeout_threshold,
            self.refuse_threshold,
            self.max_timeout_probability,
        )
    }
}

fn field_error(config: &BackendConfig, field: &str, reason: &str) -> Error {
    Error::config(format!("backends.{}.{}", config.name, field), reason)
}

/// Latency growth curve: quadratic in the clamped load factor.
fn growth(load_factor: f64) -> f64 {
    let x = load_factor.clamp(0.0, 1.0);
    x * x
}

fn ramp_probability(load_factor: f64, start: f64, end: f64, max: f64) -> f64 {
    if load_factor < start {
        return 0.0;
    }
    if end <= start || load_factor >= end {
        return max;
    }
    max * (load_factor - start) / (end - start)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackendCounters {
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub timed_out: u64,
    pub refused: u64,
    pub latency_ms_total: f64,
}

impl BackendCounters {
    pub fn avg_latency_ms(&self) -> f64 {
        let served = self.completed + self.errors + self.timed_out;
        if served == 0 {
            0.0
        } else {
            self.latency_ms_total / served as f64
        }
    }
}

struct BackendState {
    queue_depth: u32,
    active_workers: u32,
    running: bool,
    paused: bool,
    forced_refusals: u32,
    epoch: u64,
    rng: StdRng,
    counters: BackendCounters,
}

impl BackendState {
    fn release_slot(&mut self, workers: u32) {
        self.queue_depth = self.queue_depth.saturating_sub(1);
        self.active_workers = self.queue_depth.min(workers);
    }
}

/// Read-only copy of a backend's state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub workers: u32,
    pub max_queue: u32,
    pub queue_depth: u32,
    pub active_workers: u32,
    pub load_factor: f64,
    pub health: BackendHealth,
    pub running: bool,
    pub paused: bool,
    pub counters: BackendCounters,
}

pub struct BackendServer {
    profile: BackendProfile,
    state: Arc<Mutex<BackendState>>,
}

pub enum Submission {
    Refused(RefusalReason),
    Admitted(InFlight),
}

impl Submission {
    pub fn outcome(&self) -> Outcome {
        match self {
            Submission::Refused(reason) => Outcome::Refused(*reason),
            Submission::Admitted(in_flight) => in_flight.outcome(),
        }
    }
}

impl BackendServer {
    pub fn new(config: &BackendConfig, seed: u64) -> Result<Self> {
        let profile = BackendProfile::from_config(config)?;
        Ok(Self::from_profile(profile, seed))
    }

    pub fn from_profile(profile: BackendProfile, seed: u64) -> Self {
        let state = BackendState {
            queue_depth: 0,
            active_workers: 0,
            running: true,
            paused: false,
            forced_refusals: 0,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
            counters: BackendCounters::default(),
        };
        Self {
            profile,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    /// Decides admission and outcome for one request. An admitted request
    /// keeps its queue slot until the returned hold is finished or dropped.
    pub fn submit(&self, request: &Request) -> Submission {
        let mut state = self.state.lock();
        state.counters.submitted += 1;

        let refusal = if !state.running {
            Some(RefusalReason::Stopped)
        } else if state.paused {
            Some(RefusalReason::Paused)
        } else if state.forced_refusals > 0 {
            state.forced_refusals -= 1;
            Some(RefusalReason::Forced)
        } else if self.profile.load_factor(state.queue_depth) >= self.profile.refuse_threshold {
            Some(RefusalReason::Overloaded)
        } else {
            None
        };
        if let Some(reason) = refusal {
            state.counters.refused += 1;
            trace!(backend = %self.profile.name, request = request.id, %reason, "refused");
            return Submission::Refused(reason);
        }

        let load_factor = self.profile.load_factor(state.queue_depth);
        state.queue_depth += 1;
        state.active_workers = state.queue_depth.min(self.profile.workers);

        let p_timeout = self.profile.timeout_probability(load_factor);
        let p_error = self.profile.error_probability(load_factor);
        let draw: f64 = state.rng.gen();
        let (outcome, latency_ms) = if draw < p_timeout {
            state.counters.timed_out += 1;
            (Outcome::TimedOut, self.profile.max_latency_ms)
        } else if draw < p_timeout + p_error {
            state.counters.errors += 1;
            (
                Outcome::Error(FailureKind::Backend),
                self.profile.latency_ms(load_factor),
            )
        } else {
            state.counters.completed += 1;
            (Outcome::Completed, self.profile.latency_ms(load_factor))
        };
        state.counters.latency_ms_total += latency_ms;

        trace!(
            backend = %self.profile.name,
            request = request.id,
            load_factor,
            %outcome,
            "admitted"
        );

        Submission::Admitted(InFlight {
            state: Arc::clone(&self.state),
            workers: self.profile.workers,
            epoch: state.epoch,
            outcome,
            latency_ms,
            released: false,
        })
    }

    /// Submits and immediately finishes the request.
    pub fn process(&self, request: &Request) -> (Outcome, f64) {
        match self.submit(request) {
            Submission::Refused(reason) => (Outcome::Refused(reason), 0.0),
            Submission::Admitted(in_flight) => {
                let latency_ms = in_flight.latency_ms();
                (in_flight.finish(), latency_ms)
            }
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.state.lock().queue_depth
    }

    pub fn health(&self) -> BackendHealth {
        let depth = self.queue_depth();
        self.profile.health(self.profile.load_factor(depth))
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let state = self.state.lock();
        let load_factor = self.profile.load_factor(state.queue_depth);
        BackendSnapshot {
            name: self.profile.name.clone(),
            workers: self.profile.workers,
            max_queue: self.profile.max_queue,
            queue_depth: state.queue_depth,
            active_workers: state.active_workers,
            load_factor,
            health: self.profile.health(load_factor),
            running: state.running,
            paused: state.paused,
            counters: state.counters.clone(),
        }
    }

    pub fn start(&self) {
        self.state.lock().running = true;
    }

    /// Stops admission, releases every slot held by in-flight requests and
    /// drops pending forced refusals. Holds issued before the stop become
    /// no-ops when they are released.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.queue_depth = 0;
        state.active_workers = 0;
        state.forced_refusals = 0;
        state.epoch += 1;
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    pub fn force_refusals(&self, count: u32) {
        let mut state = self.state.lock();
        state.forced_refusals = state.forced_refusals.saturating_add(count);
    }

    pub fn clear_forced_refusals(&self) {
        self.state.lock().forced_refusals = 0;
    }

    pub fn pending_forced_refusals(&self) -> u32 {
        self.state.lock().forced_refusals
    }
}

/// Queue slot held by an admitted request.
pub struct InFlight {
    state: Arc<Mutex<BackendState>>,
    workers: u32,
    epoch: u64,
    outcome: Outcome,
    latency_ms: f64,
    released: bool,
}

impl InFlight {
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    /// Re-books a completed request as failed after admission, when a
    /// downstream dependency rejected it. The slot stays held.
    pub fn fail(&mut self, kind: FailureKind) {
        if !self.outcome.is_completed() {
            return;
        }
        let mut state = self.state.lock();
        state.counters.completed = state.counters.completed.saturating_sub(1);
        state.counters.errors += 1;
        self.outcome = Outcome::Error(kind);
    }

    pub fn finish(mut self) -> Outcome {
        self.release();
        self.outcome
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.state.lock();
        if state.epoch == self.epoch {
            state.release_slot(self.workers);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.release();
    }
}
