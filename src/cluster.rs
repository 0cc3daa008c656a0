//! Balancer, backend fleet and shared database composed into one target.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::backend::{BackendServer, BackendSnapshot, Submission};
use crate::balancer::LoadBalancer;
use crate::chaos::FaultEvent;
use crate::database::{DatabaseLayer, DatabaseSnapshot, QueryOutcome};
use crate::error::{Error, Result};
use crate::events::{FailureKind, Outcome, Request};
use crate::limiter::{SafetyLimiter, SafetyLimits};
use crate::models::{AlgoConfig, ClusterConfig};
use crate::target::{Dispatch, Hold, LoadTarget, TargetSample};

const DATABASE_SEED_OFFSET: u64 = 0xD8;
const BALANCER_SEED_OFFSET: u64 = 0xBA;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterCounters {
    pub total: u64,
    pub completed: u64,
    pub errors: u64,
    pub timed_out: u64,
    pub refused: u64,
    pub pool_exhausted: u64,
    pub cache_hits: u64,
    pub routed: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub algorithm: AlgoConfig,
    pub counters: ClusterCounters,
    pub backends: Vec<BackendSnapshot>,
    pub database: DatabaseSnapshot,
}

impl ClusterSummary {
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        let counters = &self.counters;
        let mut map = BTreeMap::new();
        map.insert("total_requests".to_string(), counters.total as f64);
        map.insert("completed".to_string(), counters.completed as f64);
        map.insert("errors".to_string(), counters.errors as f64);
        map.insert("timed_out".to_string(), counters.timed_out as f64);
        map.insert("refused".to_string(), counters.refused as f64);
        map.insert("pool_exhausted".to_string(), counters.pool_exhausted as f64);
        map.insert("cache_hits".to_string(), counters.cache_hits as f64);
        map.insert("db_total_queries".to_string(), self.database.total_queries as f64);
        map.insert("db_cache_hit_rate".to_string(), self.database.cache_hit_rate);
        map.insert(
            "db_available_connections".to_string(),
            self.database.available_connections as f64,
        );
        for (backend, routed) in self.backends.iter().zip(&counters.routed) {
            map.insert(format!("backend.{}.routed", backend.name), *routed as f64);
            map.insert(
                format!("backend.{}.queue_depth", backend.name),
                backend.queue_depth as f64,
            );
        }
        map
    }
}

pub struct ServerCluster {
    backends: Vec<BackendServer>,
    balancer: LoadBalancer,
    database: DatabaseLayer,
    counters: Mutex<ClusterCounters>,
    next_id: AtomicU64,
}

impl ServerCluster {
    pub fn new(config: &ClusterConfig, seed: u64) -> Result<Self> {
        Self::with_limits(config, seed, &SafetyLimits::default())
    }

    pub fn with_limits(config: &ClusterConfig, seed: u64, limits: &SafetyLimits) -> Result<Self> {
        if config.backends.is_empty() {
            return Err(Error::EmptyBackends);
        }
        SafetyLimiter::new(*limits).check_cluster(config)?;

        let mut names = HashSet::new();
        let mut backends = Vec::with_capacity(config.backends.len());
        for (idx, backend) in config.backends.iter().enumerate() {
            if !names.insert(backend.name.as_str()) {
                return Err(Error::DuplicateBackendName(backend.name.clone()));
            }
            backends.push(BackendServer::new(backend, seed.wrapping_add(idx as u64))?);
        }

        let weights: Vec<u32> = config.backends.iter().map(|backend| backend.workers).collect();
        let balancer = LoadBalancer::new(
            config.algorithm,
            &weights,
            seed.wrapping_add(BALANCER_SEED_OFFSET),
        )?;
        let database =
            DatabaseLayer::new(&config.database, seed.wrapping_add(DATABASE_SEED_OFFSET))?;

        info!(
            backends = backends.len(),
            algorithm = %config.algorithm,
            pool = config.database.connection_pool,
            "cluster ready"
        );

        Ok(Self {
            counters: Mutex::new(ClusterCounters {
                routed: vec![0; backends.len()],
                ..ClusterCounters::default()
            }),
            backends,
            balancer,
            database,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn backends(&self) -> &[BackendServer] {
        &self.backends
    }

    pub fn backend(&self, name: &str) -> Option<&BackendServer> {
        self.backends.iter().find(|backend| backend.name() == name)
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn database(&self) -> &DatabaseLayer {
        &self.database
    }

    /// Routes a request for `client_key` through the cluster.
    pub fn submit_request(&self, client_key: &str) -> Dispatch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.route(&Request::new(id, client_key))
    }

    pub fn route(&self, request: &Request) -> Dispatch {
        let loads: Vec<u32> = if self.balancer.needs_loads() {
            self.backends.iter().map(BackendServer::queue_depth).collect()
        } else {
            Vec::new()
        };
        let idx = self.balancer.select(&request.client_key, &loads);
        let backend = &self.backends[idx];

        let mut cache_hit = false;
        let dispatch = match backend.submit(request) {
            Submission::Refused(reason) => Dispatch::refused(Outcome::Refused(reason), Some(idx)),
            Submission::Admitted(in_flight) if !in_flight.outcome().is_completed() => Dispatch {
                outcome: in_flight.outcome(),
                latency_ms: in_flight.latency_ms(),
                backend: Some(idx),
                hold: Some(Hold::new(Some(in_flight), None)),
            },
            Submission::Admitted(mut in_flight) => {
                let backend_latency = in_flight.latency_ms();
                let (outcome, latency_ms, lease) = match self.database.query(&request.client_key) {
                    QueryOutcome::CacheHit => {
                        cache_hit = true;
                        (Outcome::Completed, backend_latency, None)
                    }
                    QueryOutcome::Leased(lease) => (
                        Outcome::Completed,
                        backend_latency + self.database.query_latency_ms(),
                        Some(lease),
                    ),
                    QueryOutcome::PoolExhausted => {
                        in_flight.fail(FailureKind::PoolExhausted);
                        (in_flight.outcome(), backend_latency, None)
                    }
                };
                Dispatch {
                    outcome,
                    latency_ms,
                    backend: Some(idx),
                    hold: Some(Hold::new(Some(in_flight), lease)),
                }
            }
        };

        self.record(idx, dispatch.outcome, cache_hit);
        dispatch
    }

    fn record(&self, idx: usize, outcome: Outcome, cache_hit: bool) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        counters.routed[idx] += 1;
        if cache_hit {
            counters.cache_hits += 1;
        }
        match outcome {
            Outcome::Completed => counters.completed += 1,
            Outcome::Error(FailureKind::PoolExhausted) => {
                counters.errors += 1;
                counters.pool_exhausted += 1;
            }
            Outcome::Error(FailureKind::Backend) => counters.errors += 1,
            Outcome::TimedOut => counters.timed_out += 1,
            Outcome::Refused(_) => counters.refused += 1,
        }
    }

    pub fn start_all(&self) {
        for backend in &self.backends {
            backend.start();
        }
    }

    /// Stops admission everywhere and reclaims every slot and connection,
    /// including those held by in-flight requests.
    pub fn stop_all(&self) {
        for backend in &self.backends {
            backend.stop();
        }
        self.database.release_all();
        debug!("cluster stopped");
    }

    pub fn summary(&self) -> ClusterSummary {
        let counters = self.counters.lock().clone();
        ClusterSummary {
            algorithm: self.balancer.algorithm(),
            counters,
            backends: self.backends.iter().map(BackendServer::snapshot).collect(),
            database: self.database.snapshot(),
        }
    }
}

impl LoadTarget for ServerCluster {
    fn dispatch(&self, request: &Request) -> Dispatch {
        self.route(request)
    }

    fn sample(&self) -> TargetSample {
        self.backends
            .iter()
            .fold(TargetSample::default(), |mut acc, backend| {
                let snapshot = backend.snapshot();
                acc.queue_depth += snapshot.queue_depth;
                acc.active_workers += snapshot.active_workers;
                acc.worker_capacity += snapshot.workers;
                acc.queue_capacity += backend.profile().queue_capacity();
                acc
            })
    }

    fn backend_count(&self) -> usize {
        self.backends.len()
    }

    fn pool_size(&self) -> Option<u32> {
        Some(self.database.pool_size())
    }

    fn apply_fault(&self, event: &FaultEvent) {
        match event {
            FaultEvent::PauseBackend { backend, .. } => {
                if let Some(server) = self.backends.get(*backend) {
                    server.pause();
                }
            }
            FaultEvent::ForceRefuse { backend, count } => {
                if let Some(server) = self.backends.get(*backend) {
                    server.force_refusals(*count);
                }
            }
            FaultEvent::ShrinkPool { by, .. } => self.database.shrink_pool(*by),
        }
    }

    fn revert_fault(&self, event: &FaultEvent) {
        match event {
            FaultEvent::PauseBackend { backend, .. } => {
                if let Some(server) = self.backends.get(*backend) {
                    server.resume();
                }
            }
            FaultEvent::ForceRefuse { backend, .. } => {
                if let Some(server) = self.backends.get(*backend) {
                    server.clear_forced_refusals();
                }
            }
            FaultEvent::ShrinkPool { .. } => self.database.restore_pool(),
        }
    }

    fn start(&self) {
        self.start_all();
    }

    fn stop(&self) {
        self.stop_all();
    }

    fn summary(&self) -> BTreeMap<String, f64> {
        ServerCluster::summary(self).to_metrics()
    }
}
