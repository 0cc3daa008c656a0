//! The seam the engine drives: one backend or a whole cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{BackendServer, InFlight, Submission};
use crate::chaos::FaultEvent;
use crate::cluster::ServerCluster;
use crate::database::ConnectionLease;
use crate::error::Result;
use crate::events::{Outcome, Request};
use crate::limiter::SafetyLimits;
use crate::models::{BackendConfig, ClusterConfig};

/// Resources an admitted request keeps until its simulated completion.
/// Dropping the hold returns the queue slot and pool connection.
#[derive(Default)]
pub struct Hold {
    slot: Option<InFlight>,
    lease: Option<ConnectionLease>,
}

impl Hold {
    pub fn new(slot: Option<InFlight>, lease: Option<ConnectionLease>) -> Self {
        Self { slot, lease }
    }

    pub fn release(self) {
        if let Some(slot) = self.slot {
            slot.finish();
        }
        drop(self.lease);
    }
}

pub struct Dispatch {
    pub outcome: Outcome,
    pub latency_ms: f64,
    /// Index of the backend that handled the request.
    pub backend: Option<usize>,
    pub hold: Option<Hold>,
}

impl Dispatch {
    pub fn refused(outcome: Outcome, backend: Option<usize>) -> Self {
        Self {
            outcome,
            latency_ms: 0.0,
            backend,
            hold: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetSample {
    pub queue_depth: u32,
    pub active_workers: u32,
    pub worker_capacity: u32,
    pub queue_capacity: u32,
}

pub trait LoadTarget: Send + Sync {
    fn dispatch(&self, request: &Request) -> Dispatch;

    fn sample(&self) -> TargetSample;

    fn backend_count(&self) -> usize;

    fn pool_size(&self) -> Option<u32> {
        None
    }

    fn apply_fault(&self, event: &FaultEvent);

    fn revert_fault(&self, event: &FaultEvent);

    fn start(&self);

    fn stop(&self);

    /// Metric name to value, read without mutating the target.
    fn summary(&self) -> BTreeMap<String, f64>;
}

impl LoadTarget for BackendServer {
    fn dispatch(&self, request: &Request) -> Dispatch {
        match self.submit(request) {
            Submission::Refused(reason) => Dispatch::refused(Outcome::Refused(reason), Some(0)),
            Submission::Admitted(in_flight) => Dispatch {
                outcome: in_flight.outcome(),
                latency_ms: in_flight.latency_ms(),
                backend: Some(0),
                hold: Some(Hold::new(Some(in_flight), None)),
            },
        }
    }

    fn sample(&self) -> TargetSample {
        let snapshot = self.snapshot();
        TargetSample {
            queue_depth: snapshot.queue_depth,
            active_workers: snapshot.active_workers,
            worker_capacity: snapshot.workers,
            queue_capacity: self.profile().queue_capacity(),
        }
    }

    fn backend_count(&self) -> usize {
        1
    }

    fn apply_fault(&self, event: &FaultEvent) {
        match event {
            FaultEvent::PauseBackend { .. } => self.pause(),
            FaultEvent::ForceRefuse { count, .. } => self.force_refusals(*count),
            FaultEvent::ShrinkPool { .. } => {}
        }
    }

    fn revert_fault(&self, event: &FaultEvent) {
        match event {
            FaultEvent::PauseBackend { .. } => self.resume(),
            FaultEvent::ForceRefuse { .. } => self.clear_forced_refusals(),
            FaultEvent::ShrinkPool { .. } => {}
        }
    }

    fn start(&self) {
        BackendServer::start(self);
    }

    fn stop(&self) {
        BackendServer::stop(self);
    }

    fn summary(&self) -> BTreeMap<String, f64> {
        let snapshot = self.snapshot();
        let counters = &snapshot.counters;
        let mut map = BTreeMap::new();
        map.insert("total_requests".to_string(), counters.submitted as f64);
        map.insert("completed".to_string(), counters.completed as f64);
        map.insert("errors".to_string(), counters.errors as f64);
        map.insert("timed_out".to_string(), counters.timed_out as f64);
        map.insert("refused".to_string(), counters.refused as f64);
        map.insert("avg_latency_ms".to_string(), counters.avg_latency_ms());
        map.insert("queue_depth".to_string(), snapshot.queue_depth as f64);
        map.insert("load_factor".to_string(), snapshot.load_factor);
        map
    }
}

/// Builds a cluster from `config`, or a single default backend when no
/// cluster is configured.
pub fn build_target(
    config: Option<&ClusterConfig>,
    seed: u64,
    limits: &SafetyLimits,
) -> Result<Arc<dyn LoadTarget>> {
    match config {
        Some(config) => Ok(Arc::new(ServerCluster::with_limits(config, seed, limits)?)),
        None => Ok(Arc::new(BackendServer::new(&BackendConfig::default(), seed)?)),
    }
}
