//! Seeded fault injection, at most one discrete event per tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FaultEvent {
    PauseBackend { backend: usize, ticks: u64 },
    ForceRefuse { backend: usize, count: u32 },
    ShrinkPool { by: u32, ticks: u64 },
}

impl FaultEvent {
    /// Ticks until the event must be reverted. `None` for one-shot events.
    pub fn duration_ticks(&self) -> Option<u64> {
        match self {
            FaultEvent::PauseBackend { ticks, .. } | FaultEvent::ShrinkPool { ticks, .. } => {
                Some(*ticks)
            }
            FaultEvent::ForceRefuse { .. } => None,
        }
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultEvent::PauseBackend { backend, ticks } => {
                write!(f, "pause backend {} for {} ticks", backend, ticks)
            }
            FaultEvent::ForceRefuse { backend, count } => {
                write!(f, "force {} refusals on backend {}", count, backend)
            }
            FaultEvent::ShrinkPool { by, ticks } => {
                write!(f, "shrink pool by {} for {} ticks", by, ticks)
            }
        }
    }
}

/// What a strategy may inspect when deciding the next fault.
#[derive(Clone, Copy, Debug)]
pub struct ChaosContext {
    pub tick: u64,
    pub backend_count: usize,
    /// Current effective pool size, `None` when the target has no database.
    pub pool_size: Option<u32>,
}

pub trait ChaosStrategy: Send {
    fn next_event(&mut self, ctx: &ChaosContext) -> Option<FaultEvent>;
}

pub struct NoChaos;

impl ChaosStrategy for NoChaos {
    fn next_event(&mut self, _ctx: &ChaosContext) -> Option<FaultEvent> {
        None
    }
}

pub struct SeededChaos {
    fault_rate: f64,
    ticks_per_sec: u64,
    rng: StdRng,
}

impl SeededChaos {
    pub fn new(fault_rate: f64, seed: u64, ticks_per_sec: u64) -> Self {
        Self {
            fault_rate: fault_rate.clamp(0.0, 1.0),
            ticks_per_sec: ticks_per_sec.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ChaosStrategy for SeededChaos {
    fn next_event(&mut self, ctx: &ChaosContext) -> Option<FaultEvent> {
        if ctx.backend_count == 0 || !self.rng.gen_bool(self.fault_rate) {
            return None;
        }

        let kinds = if ctx.pool_size.is_some() { 3 } else { 2 };
        let backend = self.rng.gen_range(0..ctx.backend_count);
        match self.rng.gen_range(0..kinds) {
            0 => Some(FaultEvent::PauseBackend {
                backend,
                ticks: self.rng.gen_range(1..=2) * self.ticks_per_sec,
            }),
            1 => Some(FaultEvent::ForceRefuse {
                backend,
                count: self.rng.gen_range(5..=25),
            }),
            _ => {
                let pool = ctx.pool_size.unwrap_or(1);
                let share = self.rng.gen_range(0.3..=0.7);
                let by = ((pool as f64 * share).round() as u32).max(1);
                Some(FaultEvent::ShrinkPool {
                    by,
                    ticks: self.rng.gen_range(2..=4) * self.ticks_per_sec,
                })
            }
        }
    }
}

/// No-op unless `fault_rate` is positive.
pub fn build_chaos(fault_rate: f64, seed: u64, ticks_per_sec: u64) -> Box<dyn ChaosStrategy> {
    if fault_rate <= 0.0 {
        Box::new(NoChaos)
    } else {
        Box::new(SeededChaos::new(fault_rate, seed, ticks_per_sec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tick: u64, pool_size: Option<u32>) -> ChaosContext {
        ChaosContext {
            tick,
            backend_count: 3,
            pool_size,
        }
    }

    fn draw(strategy: &mut dyn ChaosStrategy, ticks: u64, pool: Option<u32>) -> Vec<Option<FaultEvent>> {
        (0..ticks).map(|tick| strategy.next_event(&ctx(tick, pool))).collect()
    }

    #[test]
    fn zero_rate_never_fires() {
        let mut chaos = build_chaos(0.0, 1, 10);
        assert!(draw(chaos.as_mut(), 500, Some(20)).iter().all(Option::is_none));
    }

    #[test]
    fn full_rate_fires_every_tick() {
        let mut chaos = SeededChaos::new(1.0, 1, 10);
        let events = draw(&mut chaos, 100, Some(20));
        assert!(events.iter().all(Option::is_some));
        for event in events.into_iter().flatten() {
            match event {
                FaultEvent::PauseBackend { backend, ticks } => {
                    assert!(backend < 3);
                    assert!(ticks == 10 || ticks == 20);
                }
                FaultEvent::ForceRefuse { backend, count } => {
                    assert!(backend < 3);
                    assert!((5..=25).contains(&count));
                }
                FaultEvent::ShrinkPool { by, ticks } => {
                    assert!((6..=14).contains(&by));
                    assert!((20..=40).contains(&ticks));
                }
            }
        }
    }

    #[test]
    fn pool_faults_need_a_pool() {
        let mut chaos = SeededChaos::new(1.0, 3, 10);
        let events = draw(&mut chaos, 200, None);
        assert!(events
            .iter()
            .flatten()
            .all(|event| !matches!(event, FaultEvent::ShrinkPool { .. })));
    }

    #[test]
    fn same_seed_same_faults() {
        let mut a = SeededChaos::new(0.3, 99, 10);
        let mut b = SeededChaos::new(0.3, 99, 10);
        assert_eq!(draw(&mut a, 300, Some(20)), draw(&mut b, 300, Some(20)));
    }

    #[test]
    fn one_shot_events_have_no_duration() {
        let event = FaultEvent::ForceRefuse {
            backend: 0,
            count: 3,
        };
        assert_eq!(event.duration_ticks(), None);
        assert_eq!(event.to_string(), "force 3 refusals on backend 0");
    }
}
