//! Per-tick snapshot extensions.
//!
//! Plugins annotate a snapshot with derived values under
//! [`MetricsSnapshot::extras`]; filters then adjust its fields. The driver
//! runs the pipeline on each snapshot before it is recorded, so recorded
//! snapshots are final.

use crate::error::{Error, Result};
use crate::metrics::MetricsSnapshot;

pub const RESILIENCE_SCORE: &str = "resilience_score";
pub const TREND_REQUESTS_DELTA: &str = "trend_requests_delta";
pub const TREND_LATENCY_DELTA: &str = "trend_latency_delta";

const ERROR_SMOOTHING_ALPHA: f64 = 0.30;
const LATENCY_CAP_MS: f64 = 10_000.0;
const QUEUE_FLOOR: u32 = 3;

pub trait SnapshotExtension: Send {
    fn name(&self) -> &'static str;

    /// Called once per tick, in tick order.
    fn apply(&mut self, snapshot: &mut MetricsSnapshot);
}

/// `(name, description)` of every plugin.
pub const PLUGINS: [(&str, &str); 2] = [
    (
        "resilience-score",
        "0-100 score from error rate, worker saturation, queue depth and refusals",
    ),
    ("trend-lens", "per-tick deltas of request count and latency"),
];

/// `(name, description)` of every filter.
pub const FILTERS: [(&str, &str); 3] = [
    ("latency-cap", "caps latency outliers at 10s"),
    ("error-smooth", "EWMA smoothing of the error rate (alpha 0.3)"),
    ("queue-floor", "reports queue depths of 3 or less as 0"),
];

/// Scores how well the target is holding up, starting from 100.
#[derive(Default)]
pub struct ResilienceScore;

impl SnapshotExtension for ResilienceScore {
    fn name(&self) -> &'static str {
        "resilience-score"
    }

    fn apply(&mut self, snapshot: &mut MetricsSnapshot) {
        let saturation = if snapshot.worker_capacity == 0 {
            0.0
        } else {
            snapshot.active_workers as f64 / snapshot.worker_capacity as f64
        };
        let score = 100.0
            - (snapshot.error_rate * 120.0).min(40.0)
            - (saturation * 30.0).min(25.0)
            - (snapshot.queue_depth as f64 / 15.0).min(20.0)
            - (snapshot.refused as f64 / 50.0).min(15.0);
        snapshot
            .extras
            .insert(RESILIENCE_SCORE.to_string(), score.clamp(0.0, 100.0).trunc());
    }
}

#[derive(Default)]
pub struct TrendLens {
    previous: Option<(f64, f64)>,
}

impl SnapshotExtension for TrendLens {
    fn name(&self) -> &'static str {
        "trend-lens"
    }

    fn apply(&mut self, snapshot: &mut MetricsSnapshot) {
        let current = (snapshot.requests as f64, snapshot.latency_ms);
        let (prev_requests, prev_latency) = self.previous.unwrap_or(current);
        snapshot.extras.insert(
            TREND_REQUESTS_DELTA.to_string(),
            round_to(current.0 - prev_requests, 2),
        );
        snapshot.extras.insert(
            TREND_LATENCY_DELTA.to_string(),
            round_to(current.1 - prev_latency, 2),
        );
        self.previous = Some(current);
    }
}

#[derive(Default)]
pub struct LatencyCap;

impl SnapshotExtension for LatencyCap {
    fn name(&self) -> &'static str {
        "latency-cap"
    }

    fn apply(&mut self, snapshot: &mut MetricsSnapshot) {
        snapshot.latency_ms = snapshot.latency_ms.min(LATENCY_CAP_MS);
    }
}

/// Exponentially weighted error rate, seeded with the first tick's value.
#[derive(Default)]
pub struct ErrorSmooth {
    ewma: Option<f64>,
}

impl SnapshotExtension for ErrorSmooth {
    fn name(&self) -> &'static str {
        "error-smooth"
    }

    fn apply(&mut self, snapshot: &mut MetricsSnapshot) {
        let current = snapshot.error_rate;
        let previous = self.ewma.unwrap_or(current);
        let ewma = ERROR_SMOOTHING_ALPHA * current + (1.0 - ERROR_SMOOTHING_ALPHA) * previous;
        self.ewma = Some(ewma);
        snapshot.error_rate = round_to(ewma.clamp(0.0, 1.0), 4);
    }
}

#[derive(Default)]
pub struct QueueFloor;

impl SnapshotExtension for QueueFloor {
    fn name(&self) -> &'static str {
        "queue-floor"
    }

    fn apply(&mut self, snapshot: &mut MetricsSnapshot) {
        if snapshot.queue_depth <= QUEUE_FLOOR {
            snapshot.queue_depth = 0;
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Lowercases, trims, maps `_` to `-`, splits on commas and drops repeats,
/// keeping first-seen order.
pub fn normalize_names(raw: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in raw.iter().flat_map(|entry| entry.split(',')) {
        let name = token.trim().to_ascii_lowercase().replace('_', "-");
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

pub fn build_plugin(name: &str) -> Result<Box<dyn SnapshotExtension>> {
    match name {
        "resilience-score" => Ok(Box::new(ResilienceScore)),
        "trend-lens" => Ok(Box::new(TrendLens::default())),
        other => Err(Error::UnknownExtension {
            kind: "plugin",
            name: other.to_string(),
        }),
    }
}

pub fn build_filter(name: &str) -> Result<Box<dyn SnapshotExtension>> {
    match name {
        "latency-cap" => Ok(Box::new(LatencyCap)),
        "error-smooth" => Ok(Box::new(ErrorSmooth::default())),
        "queue-floor" => Ok(Box::new(QueueFloor)),
        other => Err(Error::UnknownExtension {
            kind: "filter",
            name: other.to_string(),
        }),
    }
}

/// Selected plugins followed by selected filters.
#[derive(Default)]
pub struct ExtensionPipeline {
    plugins: Vec<Box<dyn SnapshotExtension>>,
    filters: Vec<Box<dyn SnapshotExtension>>,
}

impl ExtensionPipeline {
    pub fn from_names(plugins: &[String], filters: &[String]) -> Result<Self> {
        Ok(Self {
            plugins: normalize_names(plugins)
                .iter()
                .map(|name| build_plugin(name))
                .collect::<Result<_>>()?,
            filters: normalize_names(filters)
                .iter()
                .map(|name| build_filter(name))
                .collect::<Result<_>>()?,
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins
            .iter()
            .chain(&self.filters)
            .map(|extension| extension.name())
            .collect()
    }

    pub fn apply(&mut self, mut snapshot: MetricsSnapshot) -> MetricsSnapshot {
        for extension in self.plugins.iter_mut().chain(self.filters.iter_mut()) {
            extension.apply(&mut snapshot);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|name| name.to_string()).collect()
    }

    fn snapshot(tick: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            tick,
            requests: 100,
            latency_ms: 40.0,
            worker_capacity: 10,
            ..MetricsSnapshot::default()
        }
    }

    #[test]
    fn names_are_normalized_and_deduplicated() {
        assert_eq!(
            normalize_names(&names(&["Trend_Lens, resilience-score", "trend-lens", " "])),
            vec!["trend-lens", "resilience-score"]
        );
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let err = ExtensionPipeline::from_names(&names(&["nano-coach"]), &[])
            .err()
            .unwrap();
        assert!(err.is_config());
        assert_eq!(err.to_string(), "unknown plugin 'nano-coach'");

        let err = ExtensionPipeline::from_names(&[], &names(&["median"])).err().unwrap();
        assert_eq!(err.to_string(), "unknown filter 'median'");
    }

    #[test]
    fn every_listed_extension_builds() {
        for (name, _) in PLUGINS {
            assert_eq!(build_plugin(name).unwrap().name(), name);
        }
        for (name, _) in FILTERS {
            assert_eq!(build_filter(name).unwrap().name(), name);
        }
    }

    #[test]
    fn healthy_tick_scores_full_marks() {
        let mut plugin = ResilienceScore;
        let mut snap = snapshot(0);
        plugin.apply(&mut snap);
        assert_eq!(snap.extras[RESILIENCE_SCORE], 100.0);
    }

    #[test]
    fn penalties_cap_and_floor_the_score() {
        let mut plugin = ResilienceScore;
        let mut snap = MetricsSnapshot {
            error_rate: 0.1,
            active_workers: 5,
            worker_capacity: 10,
            queue_depth: 30,
            refused: 100,
            ..snapshot(0)
        };
        plugin.apply(&mut snap);
        // 100 - 12 - 15 - 2 - 2
        assert_eq!(snap.extras[RESILIENCE_SCORE], 69.0);

        let mut snap = MetricsSnapshot {
            error_rate: 1.0,
            active_workers: 10,
            queue_depth: 1_000,
            refused: 10_000,
            ..snapshot(0)
        };
        plugin.apply(&mut snap);
        assert_eq!(snap.extras[RESILIENCE_SCORE], 0.0);
    }

    #[test]
    fn trend_lens_reports_deltas_from_the_previous_tick() {
        let mut plugin = TrendLens::default();
        let mut first = snapshot(0);
        plugin.apply(&mut first);
        assert_eq!(first.extras[TREND_REQUESTS_DELTA], 0.0);

        let mut second = MetricsSnapshot {
            requests: 130,
            latency_ms: 52.346,
            ..snapshot(1)
        };
        plugin.apply(&mut second);
        assert_eq!(second.extras[TREND_REQUESTS_DELTA], 30.0);
        assert_eq!(second.extras[TREND_LATENCY_DELTA], 12.35);
    }

    #[test]
    fn error_smoothing_follows_ewma() {
        let mut filter = ErrorSmooth::default();
        let mut first = MetricsSnapshot {
            error_rate: 0.5,
            ..snapshot(0)
        };
        filter.apply(&mut first);
        assert_eq!(first.error_rate, 0.5);

        let mut second = MetricsSnapshot {
            error_rate: 0.0,
            ..snapshot(1)
        };
        filter.apply(&mut second);
        assert_eq!(second.error_rate, 0.35);
    }

    #[test]
    fn filters_cap_latency_and_floor_queue() {
        let mut pipeline =
            ExtensionPipeline::from_names(&[], &names(&["latency-cap", "queue-floor"])).unwrap();
        let out = pipeline.apply(MetricsSnapshot {
            latency_ms: 25_000.0,
            queue_depth: 3,
            ..snapshot(0)
        });
        assert_eq!(out.latency_ms, LATENCY_CAP_MS);
        assert_eq!(out.queue_depth, 0);

        let out = pipeline.apply(MetricsSnapshot {
            queue_depth: 4,
            ..snapshot(1)
        });
        assert_eq!(out.queue_depth, 4);
    }

    #[test]
    fn plugins_see_the_unfiltered_snapshot() {
        let mut pipeline = ExtensionPipeline::from_names(
            &names(&["resilience-score"]),
            &names(&["queue-floor"]),
        )
        .unwrap();
        assert_eq!(pipeline.names(), vec!["resilience-score", "queue-floor"]);
        let out = pipeline.apply(MetricsSnapshot {
            queue_depth: 3,
            ..snapshot(0)
        });
        assert_eq!(out.queue_depth, 0);
        // queue penalty 3 / 15 = 0.2 truncates the score to 99
        assert_eq!(out.extras[RESILIENCE_SCORE], 99.0);
    }

    #[test]
    fn empty_pipeline_leaves_snapshots_alone() {
        let mut pipeline = ExtensionPipeline::default();
        assert!(pipeline.names().is_empty());
        assert_eq!(pipeline.apply(snapshot(2)), snapshot(2));
    }
}
