//! Time-varying target request rates.
//!
//! Every schedule is a pure function of the tick index so identical
//! parameters always produce identical load curves. Randomness enters the
//! run only through per-worker jitter and chaos injection.

use std::f64::consts::PI;

use crate::models::ProfileKind;

const WAVE_PERIOD_SECS: u64 = 14;
const BURST_INTERVAL_SECS: u64 = 8;
const BURST_LENGTH_SECS: u64 = 3;
const SLOW_HOLD_FACTOR: f64 = 1.6;
const STAIR_STEPS: u32 = 6;

#[derive(Clone, Debug, PartialEq)]
pub enum AttackProfile {
    Ramp {
        base_rate: f64,
        max_rate: f64,
        ramp_ticks: u64,
    },
    Wave {
        base_rate: f64,
        max_rate: f64,
        period_ticks: u64,
    },
    Burst {
        base_rate: f64,
        max_rate: f64,
        interval_ticks: u64,
        burst_ticks: u64,
    },
    SlowClient {
        base_rate: f64,
        max_rate: f64,
        hold_ticks: f64,
    },
    Stair {
        base_rate: f64,
        max_rate: f64,
        duration_ticks: u64,
        steps: u32,
    },
    Chaos {
        base_rate: f64,
        max_rate: f64,
        ramp_ticks: u64,
        fault_rate: f64,
    },
}

impl AttackProfile {
    /// Builds the schedule for `kind` from a base rate (requests per second)
    /// and the run length in ticks.
    pub fn build(kind: ProfileKind, rate: u64, total_ticks: u64, tick_ms: u64, fault_rate: f64) -> Self {
        let base = rate as f64;
        let ticks_per_sec = (1000 / tick_ms.max(1)).max(1);
        let total_ticks = total_ticks.max(1);

        match kind {
            ProfileKind::Ramp => AttackProfile::Ramp {
                base_rate: base,
                max_rate: base * 2.0,
                ramp_ticks: total_ticks,
            },
            ProfileKind::Wave => AttackProfile::Wave {
                base_rate: base,
                max_rate: base * 3.0,
                period_ticks: WAVE_PERIOD_SECS * ticks_per_sec,
            },
            ProfileKind::Burst => AttackProfile::Burst {
                base_rate: base,
                max_rate: base * 3.0,
                interval_ticks: BURST_INTERVAL_SECS * ticks_per_sec,
                burst_ticks: BURST_LENGTH_SECS * ticks_per_sec,
            },
            ProfileKind::SlowClient => AttackProfile::SlowClient {
                base_rate: base * 0.65,
                max_rate: base * 2.75,
                hold_ticks: total_ticks as f64 * SLOW_HOLD_FACTOR,
            },
            ProfileKind::Stair => AttackProfile::Stair {
                base_rate: base,
                max_rate: base * 3.5,
                duration_ticks: total_ticks,
                steps: STAIR_STEPS,
            },
            ProfileKind::Chaos => AttackProfile::Chaos {
                base_rate: base,
                max_rate: base * 2.0,
                ramp_ticks: total_ticks,
                fault_rate,
            },
        }
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            AttackProfile::Ramp { .. } => ProfileKind::Ramp,
            AttackProfile::Wave { .. } => ProfileKind::Wave,
            AttackProfile::Burst { .. } => ProfileKind::Burst,
            AttackProfile::SlowClient { .. } => ProfileKind::SlowClient,
            AttackProfile::Stair { .. } => ProfileKind::Stair,
            AttackProfile::Chaos { .. } => ProfileKind::Chaos,
        }
    }

    pub fn fault_rate(&self) -> Option<f64> {
        match self {
            AttackProfile::Chaos { fault_rate, .. } => Some(*fault_rate),
            _ => None,
        }
    }

    /// Target rate in requests per second at `tick`.
    pub fn rate_at(&self, tick: u64) -> u64 {
        let rate = match *self {
            AttackProfile::Ramp {
                base_rate,
                max_rate,
                ramp_ticks,
            }
            | AttackProfile::Chaos {
                base_rate,
                max_rate,
                ramp_ticks,
                ..
            } => ramp(base_rate, max_rate, ramp_ticks, tick),
            AttackProfile::Wave {
                base_rate,
                max_rate,
                period_ticks,
            } => {
                let amplitude = (max_rate - base_rate) / 2.0;
                let mid = base_rate + amplitude;
                let phase = 2.0 * PI * tick as f64 / period_ticks.max(1) as f64;
                mid + amplitude * phase.sin()
            }
            AttackProfile::Burst {
                base_rate,
                max_rate,
                interval_ticks,
                burst_ticks,
            } => {
                if tick % interval_ticks.max(1) < burst_ticks {
                    max_rate
                } else {
                    base_rate
                }
            }
            AttackProfile::SlowClient {
                base_rate,
                max_rate,
                hold_ticks,
            } => max_rate * (-(tick as f64) / hold_ticks.max(1.0)).exp() + base_rate,
            AttackProfile::Stair {
                base_rate,
                max_rate,
                duration_ticks,
                steps,
            } => {
                let steps = steps.max(1) as u64;
                let step_len = (duration_ticks / steps).max(1);
                let current = (tick / step_len + 1).min(steps);
                base_rate + (max_rate - base_rate) * (current as f64 / steps as f64)
            }
        };
        rate.max(0.0).round() as u64
    }
}

fn ramp(base_rate: f64, max_rate: f64, ramp_ticks: u64, tick: u64) -> f64 {
    if ramp_ticks == 0 || tick >= ramp_ticks {
        return max_rate;
    }
    base_rate + (max_rate - base_rate) * (tick as f64 / ramp_ticks as f64)
}

/// Turns per-second rates into whole per-tick request counts, carrying the
/// fractional remainder so low rates still produce traffic.
#[derive(Clone, Debug, Default)]
pub struct TickPacer {
    carry: f64,
}

impl TickPacer {
    pub fn requests_for(&mut self, rate_per_sec: u64, tick_ms: u64) -> u64 {
        self.carry += rate_per_sec as f64 * tick_ms as f64 / 1000.0;
        let whole = self.carry.floor();
        self.carry -= whole;
        whole as u64
    }
}
