use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chaos::{build_chaos, ChaosContext, ChaosStrategy, FaultEvent};
use crate::error::Result;
use crate::extensions::ExtensionPipeline;
use crate::limiter::{SafetyLimiter, SafetyLimits};
use crate::metrics::{AggregateStats, MetricField, MetricsCollector, MetricsSnapshot, TickRecord};
use crate::models::{ProfileKind, RunParams};
use crate::profile::{AttackProfile, TickPacer};
use crate::target::LoadTarget;
use crate::workers::{WorkOrder, WorkerPool};

const CHAOS_SEED_SALT: u64 = 0xC4A0_5EED;

/// Cloneable handle that asks a running engine to stop after the current
/// submission.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppliedFault {
    pub tick: u64,
    pub event: FaultEvent,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub profile: ProfileKind,
    pub workers: usize,
    pub duration_secs: u64,
    pub tick_ms: u64,
    pub rate: u64,
    pub seed: u64,
    pub total_ticks: u64,
    pub ticks_run: u64,
    pub stopped_early: bool,
    pub dropped: u64,
    pub faults: Vec<AppliedFault>,
    pub latency: Option<AggregateStats>,
    pub queue_depth: Option<AggregateStats>,
    pub summary: BTreeMap<String, f64>,
    pub target: BTreeMap<String, f64>,
    pub series: Vec<TickRecord>,
}

pub struct SimulationEngine {
    target: Arc<dyn LoadTarget>,
    limiter: SafetyLimiter,
    metrics: MetricsCollector,
    stop: StopHandle,
    chaos: Option<Box<dyn ChaosStrategy>>,
}

struct TickLoop {
    ticks_run: u64,
    stopped_early: bool,
    dropped: u64,
    faults: Vec<AppliedFault>,
}

impl SimulationEngine {
    pub fn new(target: Arc<dyn LoadTarget>, limits: SafetyLimits) -> Self {
        Self {
            target,
            limiter: SafetyLimiter::new(limits),
            metrics: MetricsCollector::new(),
            stop: StopHandle::default(),
            chaos: None,
        }
    }

    /// Replaces the fault source derived from the run's fault rate for the
    /// next run.
    pub fn with_chaos(mut self, chaos: Box<dyn ChaosStrategy>) -> Self {
        self.chaos = Some(chaos);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn target(&self) -> &Arc<dyn LoadTarget> {
        &self.target
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn series(&self) -> Vec<MetricsSnapshot> {
        self.metrics.series()
    }

    /// Collector figures plus the target's own counters under `target.`.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        let mut summary = self.metrics.summary();
        for (key, value) in self.target.summary() {
            summary.insert(format!("target.{}", key), value);
        }
        summary
    }

    /// Validates `params`, then drives the target tick by tick until the
    /// duration elapses or a stop is requested.
    pub fn start(&mut self, params: &RunParams) -> Result<RunReport> {
        self.limiter.check_run(params)?;
        self.limiter.check_backend_count(self.target.backend_count())?;
        let mut pipeline = ExtensionPipeline::from_names(&params.plugins, &params.filters)?;

        self.stop.0.store(false, Ordering::SeqCst);
        self.metrics.clear();

        let total_ticks = params.total_ticks();
        let ticks_per_sec = (1000 / params.tick_ms).max(1);
        let fault_rate = params.fault_rate();
        let profile = AttackProfile::build(
            params.profile,
            params.rate,
            total_ticks,
            params.tick_ms,
            fault_rate,
        );
        let mut chaos = match self.chaos.take() {
            Some(chaos) => chaos,
            None => build_chaos(fault_rate, params.seed ^ CHAOS_SEED_SALT, ticks_per_sec),
        };

        info!(
            profile = %params.profile,
            workers = params.workers,
            duration_secs = params.duration_secs,
            rate = params.rate,
            seed = params.seed,
            total_ticks,
            extensions = ?pipeline.names(),
            "simulation starting"
        );

        self.target.start();
        let mut pool = WorkerPool::spawn(
            params.workers,
            Arc::clone(&self.target),
            params.seed,
            Arc::clone(&self.stop.0),
        )?;
        let mut active = Vec::new();
        let outcome = self.run_ticks(
            params,
            &profile,
            chaos.as_mut(),
            &mut pipeline,
            &pool,
            &mut active,
        );

        let joined = pool.shutdown();
        revert_all(self.target.as_ref(), &active);
        self.target.stop();
        let run = outcome?;
        joined?;

        let report = RunReport {
            profile: params.profile,
            workers: params.workers,
            duration_secs: params.duration_secs,
            tick_ms: params.tick_ms,
            rate: params.rate,
            seed: params.seed,
            total_ticks,
            ticks_run: run.ticks_run,
            stopped_early: run.stopped_early,
            dropped: run.dropped,
            faults: run.faults,
            latency: self.metrics.aggregate(MetricField::LatencyMs),
            queue_depth: self.metrics.aggregate(MetricField::QueueDepth),
            summary: self.metrics.summary(),
            target: self.target.summary(),
            series: self.metrics.tick_records(),
        };
        info!(
            ticks = report.ticks_run,
            stopped_early = report.stopped_early,
            faults = report.faults.len(),
            dropped = report.dropped,
            "simulation finished"
        );
        Ok(report)
    }

    fn run_ticks(
        &self,
        params: &RunParams,
        profile: &AttackProfile,
        chaos: &mut dyn ChaosStrategy,
        pipeline: &mut ExtensionPipeline,
        pool: &WorkerPool,
        active: &mut Vec<(u64, FaultEvent)>,
    ) -> Result<TickLoop> {
        let mut run = TickLoop {
            ticks_run: 0,
            stopped_early: false,
            dropped: 0,
            faults: Vec::new(),
        };
        let mut pacer = TickPacer::default();
        let mut rng = StdRng::seed_from_u64(params.seed);

        for tick in 0..params.total_ticks() {
            if self.stop.is_stopped() {
                run.stopped_early = true;
                break;
            }
            let now_ms = tick * params.tick_ms;
            expire_faults(self.target.as_ref(), active, tick);

            let rate = profile.rate_at(tick);
            let requested = pacer.requests_for(rate, params.tick_ms);
            let (allowed, dropped) = self.limiter.cap_events(requested, params.tick_ms);
            run.dropped += dropped;

            let ctx = ChaosContext {
                tick,
                backend_count: self.target.backend_count(),
                pool_size: self.target.pool_size(),
            };
            if let Some(event) = chaos.next_event(&ctx) {
                warn!(tick, fault = %event, "fault injected");
                self.target.apply_fault(&event);
                // One-shot faults stay pending until the run ends.
                let expires_at = event
                    .duration_ticks()
                    .map_or(u64::MAX, |ticks| tick.saturating_add(ticks));
                active.push((expires_at, event.clone()));
                run.faults.push(AppliedFault { tick, event });
            }

            let shares = split_requests(allowed, params.workers, params.jitter, tick, &mut rng);
            let orders: Vec<WorkOrder> = shares
                .into_iter()
                .map(|requests| WorkOrder {
                    tick,
                    now_ms,
                    requests,
                    pace: pacing(params, requests),
                })
                .collect();
            let tally = pool.run_tick(&orders)?;

            let sample = self.target.sample();
            let snapshot = pipeline.apply(MetricsSnapshot {
                tick,
                elapsed_ms: now_ms + params.tick_ms,
                queue_depth: sample.queue_depth,
                active_workers: sample.active_workers,
                worker_capacity: sample.worker_capacity,
                latency_ms: tally.mean_latency_ms(),
                error_rate: tally.failure_rate(),
                requests: tally.submitted,
                completed: tally.completed,
                errors: tally.errors,
                timed_out: tally.timed_out,
                refused: tally.refused,
                dropped,
                extras: BTreeMap::new(),
            });
            debug!(
                tick,
                rate,
                requests = snapshot.requests,
                queue_depth = snapshot.queue_depth,
                refused = snapshot.refused,
                "tick complete"
            );
            self.metrics.record(snapshot)?;
            run.ticks_run += 1;
        }

        Ok(run)
    }
}

fn pacing(params: &RunParams, requests: u64) -> Option<Duration> {
    if !params.realtime || requests == 0 {
        return None;
    }
    Some(Duration::from_millis(params.tick_ms) / requests.min(u32::MAX as u64) as u32)
}

/// Faults that target the same resource share one revert.
fn fault_key(event: &FaultEvent) -> (u8, usize) {
    match event {
        FaultEvent::PauseBackend { backend, .. } => (0, *backend),
        FaultEvent::ShrinkPool { .. } => (1, 0),
        FaultEvent::ForceRefuse { backend, .. } => (2, *backend),
    }
}

fn expire_faults(target: &dyn LoadTarget, active: &mut Vec<(u64, FaultEvent)>, tick: u64) {
    let (expired, remaining): (Vec<_>, Vec<_>) =
        active.drain(..).partition(|(expires_at, _)| *expires_at <= tick);
    *active = remaining;
    for (_, event) in expired {
        let key = fault_key(&event);
        if active.iter().any(|(_, other)| fault_key(other) == key) {
            continue;
        }
        debug!(tick, fault = %event, "fault reverted");
        target.revert_fault(&event);
    }
}

fn revert_all(target: &dyn LoadTarget, active: &[(u64, FaultEvent)]) {
    let mut seen = Vec::new();
    for (_, event) in active {
        let key = fault_key(event);
        if !seen.contains(&key) {
            seen.push(key);
            target.revert_fault(event);
        }
    }
}

/// Splits `total` across `workers` with per-worker jitter. Shares always sum
/// to `total`; the rounding remainder rotates with the tick.
fn split_requests(total: u64, workers: usize, jitter: f64, tick: u64, rng: &mut StdRng) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let weights: Vec<f64> = (0..workers)
        .map(|_| {
            if jitter > 0.0 {
                1.0 + rng.gen_range(-jitter..jitter)
            } else {
                1.0
            }
        })
        .collect();
    let weight_sum: f64 = weights.iter().sum();
    let mut shares: Vec<u64> = weights
        .iter()
        .map(|weight| (total as f64 * weight / weight_sum).floor() as u64)
        .collect();

    let assigned: u64 = shares.iter().sum();
    let start = (tick % workers as u64) as usize;
    let mut idx = start;
    for _ in assigned..total {
        shares[idx % workers] += 1;
        idx += 1;
    }
    let mut excess = assigned.saturating_sub(total);
    idx = start;
    while excess > 0 {
        let slot = idx % workers;
        if shares[slot] > 0 {
            shares[slot] -= 1;
            excess -= 1;
        }
        idx += 1;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendServer;
    use crate::error::Error;
    use crate::models::BackendConfig;

    fn backend(workers: u32, max_queue: u32) -> Arc<dyn LoadTarget> {
        let config = BackendConfig {
            workers,
            max_queue,
            ..BackendConfig::named("api")
        };
        Arc::new(BackendServer::new(&config, 3).expect("backend should build"))
    }

    fn params(workers: usize, duration_secs: u64, rate: u64) -> RunParams {
        RunParams::new(ProfileKind::Ramp, workers, duration_secs, rate, 42)
    }

    struct Scripted {
        events: Vec<(u64, FaultEvent)>,
    }

    impl ChaosStrategy for Scripted {
        fn next_event(&mut self, ctx: &ChaosContext) -> Option<FaultEvent> {
            self.events
                .iter()
                .find(|(tick, _)| *tick == ctx.tick)
                .map(|(_, event)| event.clone())
        }
    }

    struct StopAt {
        tick: u64,
        handle: StopHandle,
    }

    impl ChaosStrategy for StopAt {
        fn next_event(&mut self, ctx: &ChaosContext) -> Option<FaultEvent> {
            if ctx.tick == self.tick {
                self.handle.stop();
            }
            None
        }
    }

    #[test]
    fn refuses_to_run_past_thread_cap() {
        let target = backend(50, 100);
        let mut engine = SimulationEngine::new(Arc::clone(&target), SafetyLimits::default());
        let err = engine.start(&params(2_000, 5, 100)).unwrap_err();
        assert!(matches!(
            err,
            Error::SafetyLimitExceeded {
                field: "workers",
                requested: 2_000,
                limit: 1_000
            }
        ));
        assert!(engine.series().is_empty());
        assert_eq!(target.summary()["total_requests"], 0.0);
    }

    #[test]
    fn records_one_snapshot_per_tick_in_order() {
        let mut engine = SimulationEngine::new(backend(50, 100), SafetyLimits::default());
        let report = engine.start(&params(4, 2, 200)).expect("run should succeed");
        assert_eq!(report.ticks_run, 20);
        assert!(!report.stopped_early);

        let series = engine.series();
        let ticks: Vec<u64> = series.iter().map(|s| s.tick).collect();
        assert_eq!(ticks, (0..20).collect::<Vec<_>>());
        assert!(series.windows(2).all(|pair| pair[0].elapsed_ms < pair[1].elapsed_ms));
        assert_eq!(report.series.len(), 20);

        let requested: u64 = series.iter().map(|s| s.requests).sum();
        assert_eq!(report.summary["requests"], requested as f64);
        assert_eq!(report.target["total_requests"], requested as f64);
    }

    #[test]
    fn single_worker_runs_are_reproducible() {
        let run = || {
            let mut engine = SimulationEngine::new(backend(5, 20), SafetyLimits::default());
            engine.start(&params(1, 3, 400)).expect("run should succeed");
            engine.series()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn overload_is_refused_not_fatal() {
        let target = backend(5, 10);
        let mut engine = SimulationEngine::new(Arc::clone(&target), SafetyLimits::default());
        let report = engine.start(&params(8, 3, 2_000)).expect("run should succeed");
        assert!(report.summary["refused"] > 0.0);
        assert!(engine.series().iter().all(|s| s.queue_depth <= 11));
        assert!(engine.series().iter().all(|s| s.active_workers <= 5));
        assert_eq!(target.sample().queue_depth, 0);
    }

    #[test]
    fn limiter_drops_events_above_per_tick_ceiling() {
        let limits = SafetyLimits {
            max_events_per_second: 500,
            ..SafetyLimits::default()
        };
        let mut engine = SimulationEngine::new(backend(50, 1_000), limits);
        let report = engine.start(&params(2, 1, 400)).expect("run should succeed");
        assert!(report.dropped > 0);
        assert!(engine.series().iter().all(|s| s.requests <= 50));
    }

    #[test]
    fn scripted_pause_refuses_then_recovers() {
        let chaos = Scripted {
            events: vec![(
                2,
                FaultEvent::PauseBackend {
                    backend: 0,
                    ticks: 3,
                },
            )],
        };
        let mut engine = SimulationEngine::new(backend(50, 1_000), SafetyLimits::default())
            .with_chaos(Box::new(chaos));
        let report = engine.start(&params(2, 1, 100)).expect("run should succeed");
        assert_eq!(report.faults.len(), 1);

        let series = engine.series();
        for snapshot in &series {
            let paused = (2..5).contains(&snapshot.tick);
            if paused {
                assert_eq!(snapshot.refused, snapshot.requests);
            } else {
                assert_eq!(snapshot.refused, 0);
            }
        }
    }

    #[test]
    fn pending_forced_refusals_end_with_the_run() {
        let target = backend(50, 1_000);
        let chaos = Scripted {
            events: vec![(
                9,
                FaultEvent::ForceRefuse {
                    backend: 0,
                    count: 1_000,
                },
            )],
        };
        let mut engine = SimulationEngine::new(Arc::clone(&target), SafetyLimits::default())
            .with_chaos(Box::new(chaos));
        let first = engine.start(&params(2, 1, 100)).expect("run should succeed");
        assert_eq!(first.faults.len(), 1);
        assert!(first.summary["refused"] > 0.0);

        let second = engine.start(&params(2, 1, 100)).expect("run should succeed");
        assert!(second.faults.is_empty());
        assert!(second.summary["requests"] > 0.0);
        assert_eq!(second.summary["refused"], 0.0);

        target.start();
        let dispatch = target.dispatch(&crate::events::Request::new(1, "c"));
        assert_eq!(dispatch.outcome, crate::events::Outcome::Completed);
    }

    #[test]
    fn realtime_runs_pace_submissions_across_the_tick() {
        let mut engine = SimulationEngine::new(backend(50, 1_000), SafetyLimits::default());
        let params = params(2, 1, 40).with_tick_ms(250).with_realtime(true);
        let started = std::time::Instant::now();
        let report = engine.start(&params).expect("run should succeed");
        assert_eq!(report.ticks_run, 4);
        assert!(report.summary["requests"] > 0.0);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn extensions_shape_recorded_snapshots() {
        let mut engine = SimulationEngine::new(backend(50, 1_000), SafetyLimits::default());
        let params = params(2, 1, 100)
            .with_plugins(["resilience-score", "trend-lens"])
            .with_filters(["queue-floor"]);
        let report = engine.start(&params).expect("run should succeed");

        let series = engine.series();
        assert!(series.iter().all(|s| s.queue_depth == 0 || s.queue_depth > 3));
        assert!(series
            .iter()
            .all(|s| (0.0..=100.0).contains(&s.extras["resilience_score"])));
        assert_eq!(series[0].extras["trend_requests_delta"], 0.0);
        assert!(report.summary.contains_key("resilience_score_avg"));
        assert!(report.series[0].extras.contains_key("trend_latency_delta"));
    }

    #[test]
    fn unknown_extension_stops_the_run_before_it_starts() {
        let target = backend(50, 100);
        let mut engine = SimulationEngine::new(Arc::clone(&target), SafetyLimits::default());
        let err = engine
            .start(&params(2, 1, 100).with_filters(["smoothie"]))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownExtension { kind: "filter", .. }));
        assert!(engine.series().is_empty());
        assert_eq!(target.summary()["total_requests"], 0.0);
    }

    #[test]
    fn stop_handle_ends_the_run_early() {
        let engine = SimulationEngine::new(backend(50, 1_000), SafetyLimits::default());
        let handle = engine.stop_handle();
        let mut engine = engine.with_chaos(Box::new(StopAt { tick: 5, handle }));
        let report = engine.start(&params(2, 3, 100)).expect("run should succeed");
        assert!(report.stopped_early);
        assert_eq!(report.ticks_run, 6);
        assert_eq!(engine.series().last().map(|s| s.requests), Some(0));
    }

    #[test]
    fn split_preserves_total() {
        let mut rng = StdRng::seed_from_u64(1);
        for total in [0, 1, 7, 100, 9_999] {
            for workers in [1, 3, 16] {
                let shares = split_requests(total, workers, 0.05, total, &mut rng);
                assert_eq!(shares.len(), workers);
                assert_eq!(shares.iter().sum::<u64>(), total);
            }
        }
    }
}
