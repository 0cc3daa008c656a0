//! Ordered per-tick snapshots and aggregate statistics over them.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::error;

use crate::error::{Error, Result};

/// State of the target at the end of one tick. Never mutated once recorded.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tick: u64,
    pub elapsed_ms: u64,
    pub queue_depth: u32,
    pub active_workers: u32,
    pub worker_capacity: u32,
    /// Mean latency of requests served during the tick.
    pub latency_ms: f64,
    /// Share of the tick's requests that errored, timed out or were refused.
    pub error_rate: f64,
    pub requests: u64,
    pub completed: u64,
    pub errors: u64,
    pub timed_out: u64,
    pub refused: u64,
    pub dropped: u64,
    /// Values added by snapshot plugins, keyed by annotation name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, f64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricField {
    QueueDepth,
    ActiveWorkers,
    LatencyMs,
    ErrorRate,
    Requests,
    Refused,
    Dropped,
}

impl MetricField {
    pub const ALL: [MetricField; 7] = [
        MetricField::QueueDepth,
        MetricField::ActiveWorkers,
        MetricField::LatencyMs,
        MetricField::ErrorRate,
        MetricField::Requests,
        MetricField::Refused,
        MetricField::Dropped,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetricField::QueueDepth => "queue_depth",
            MetricField::ActiveWorkers => "active_workers",
            MetricField::LatencyMs => "latency_ms",
            MetricField::ErrorRate => "error_rate",
            MetricField::Requests => "requests",
            MetricField::Refused => "refused",
            MetricField::Dropped => "dropped",
        }
    }

    pub fn value(&self, snapshot: &MetricsSnapshot) -> f64 {
        match self {
            MetricField::QueueDepth => snapshot.queue_depth as f64,
            MetricField::ActiveWorkers => snapshot.active_workers as f64,
            MetricField::LatencyMs => snapshot.latency_ms,
            MetricField::ErrorRate => snapshot.error_rate,
            MetricField::Requests => snapshot.requests as f64,
            MetricField::Refused => snapshot.refused as f64,
            MetricField::Dropped => snapshot.dropped as f64,
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    /// Sample standard deviation; 0 for a single tick.
    pub stdev: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Per-tick row in the shape reporters persist.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    pub tick: u64,
    pub elapsed_ms: u64,
    pub queue_depth: u32,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub requests: u64,
    #[serde(flatten)]
    pub extras: BTreeMap<String, f64>,
}

impl From<&MetricsSnapshot> for TickRecord {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            tick: snapshot.tick,
            elapsed_ms: snapshot.elapsed_ms,
            queue_depth: snapshot.queue_depth,
            latency_ms: snapshot.latency_ms,
            error_rate: snapshot.error_rate,
            requests: snapshot.requests,
            extras: snapshot.extras.clone(),
        }
    }
}

#[derive(Default)]
pub struct MetricsCollector {
    series: Mutex<Vec<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `snapshot`. Ticks must arrive strictly increasing.
    pub fn record(&self, snapshot: MetricsSnapshot) -> Result<()> {
        let mut series = self.series.lock();
        if let Some(last) = series.last() {
            if snapshot.tick <= last.tick {
                error!(last = last.tick, tick = snapshot.tick, "snapshot out of order");
                return Err(Error::InternalRace(format!(
                    "tick {} recorded after tick {}",
                    snapshot.tick, last.tick
                )));
            }
        }
        series.push(snapshot);
        Ok(())
    }

    pub fn series(&self) -> Vec<MetricsSnapshot> {
        self.series.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.series.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.lock().is_empty()
    }

    pub fn clear(&self) {
        self.series.lock().clear();
    }

    pub fn values(&self, field: MetricField) -> Vec<f64> {
        self.series
            .lock()
            .iter()
            .map(|snapshot| field.value(snapshot))
            .collect()
    }

    pub fn aggregate(&self, field: MetricField) -> Option<AggregateStats> {
        let mut values = self.values(field);
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let count = values.len() as f64;
        let avg = values.iter().sum::<f64>() / count;
        let stdev = if values.len() < 2 {
            0.0
        } else {
            let squares: f64 = values.iter().map(|value| (value - avg).powi(2)).sum();
            (squares / (count - 1.0)).sqrt()
        };
        Some(AggregateStats {
            min: values[0],
            max: values[values.len() - 1],
            avg,
            median: median(&values),
            stdev,
            p90: nearest_rank_percentile(&values, 90.0)?,
            p99: nearest_rank_percentile(&values, 99.0)?,
        })
    }

    pub fn percentile(&self, field: MetricField, percentile: f64) -> Option<f64> {
        let mut values = self.values(field);
        values.sort_by(f64::total_cmp);
        nearest_rank_percentile(&values, percentile)
    }

    /// Run-level figures keyed by metric name.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        let series = self.series();
        let mut map = BTreeMap::new();
        map.insert("ticks".to_string(), series.len() as f64);

        let requests: u64 = series.iter().map(|s| s.requests).sum();
        let completed: u64 = series.iter().map(|s| s.completed).sum();
        let errors: u64 = series.iter().map(|s| s.errors).sum();
        let timed_out: u64 = series.iter().map(|s| s.timed_out).sum();
        let refused: u64 = series.iter().map(|s| s.refused).sum();
        let dropped: u64 = series.iter().map(|s| s.dropped).sum();
        map.insert("requests".to_string(), requests as f64);
        map.insert("completed".to_string(), completed as f64);
        map.insert("errors".to_string(), errors as f64);
        map.insert("timed_out".to_string(), timed_out as f64);
        map.insert("refused".to_string(), refused as f64);
        map.insert("dropped".to_string(), dropped as f64);
        let failure_rate = if requests == 0 {
            0.0
        } else {
            (errors + timed_out + refused) as f64 / requests as f64
        };
        map.insert("error_rate".to_string(), failure_rate);

        for field in [
            MetricField::QueueDepth,
            MetricField::LatencyMs,
            MetricField::ActiveWorkers,
        ] {
            if let Some(stats) = self.aggregate(field) {
                map.insert(format!("{}_avg", field), stats.avg);
                map.insert(format!("{}_max", field), stats.max);
                map.insert(format!("{}_median", field), stats.median);
                map.insert(format!("{}_stdev", field), stats.stdev);
                map.insert(format!("{}_p90", field), stats.p90);
                map.insert(format!("{}_p99", field), stats.p99);
            }
        }

        let mut extras: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
        for snapshot in &series {
            for (name, value) in &snapshot.extras {
                let entry = extras.entry(name.as_str()).or_default();
                entry.0 += value;
                entry.1 += 1;
            }
        }
        for (name, (total, count)) in extras {
            map.insert(format!("{}_avg", name), total / count as f64);
        }
        map
    }

    pub fn tick_records(&self) -> Vec<TickRecord> {
        self.series.lock().iter().map(TickRecord::from).collect()
    }
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn nearest_rank_percentile(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((percentile.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}
