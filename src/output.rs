use std::fmt::Write as _;

use crate::engine::RunReport;
use crate::error::{Error, Result};
use crate::extensions::{FILTERS, PLUGINS};
use crate::metrics::AggregateStats;
use crate::models::{AlgoConfig, ClusterConfig, ProfileKind};

pub trait Formatter {
    fn write(&self, report: &RunReport) -> Result<String>;
}

pub struct HumanFormatter;
pub struct SummaryFormatter;
pub struct JsonFormatter;

impl Formatter for HumanFormatter {
    fn write(&self, report: &RunReport) -> Result<String> {
        let mut out = String::new();
        write_metadata(&mut out, report);

        let _ = writeln!(out, "Ticks:");
        for record in &report.series {
            let _ = writeln!(
                out,
                "t={:>6}ms requests={:<6} queue={:<6} latency={:>8.1}ms errors={:>5.1}%",
                record.elapsed_ms,
                record.requests,
                record.queue_depth,
                record.latency_ms,
                record.error_rate * 100.0
            );
        }

        if !report.faults.is_empty() {
            let _ = writeln!(out, "Faults:");
            for fault in &report.faults {
                let _ = writeln!(out, "tick {}: {}", fault.tick, fault.event);
            }
        }

        write_summary(&mut out, report);
        Ok(out)
    }
}

impl Formatter for SummaryFormatter {
    fn write(&self, report: &RunReport) -> Result<String> {
        let mut out = String::new();
        write_metadata(&mut out, report);
        write_summary(&mut out, report);
        Ok(out)
    }
}

impl Formatter for JsonFormatter {
    fn write(&self, report: &RunReport) -> Result<String> {
        let mut out = serde_json::to_string_pretty(report)
            .map_err(|err| Error::Cli(format!("failed to encode report: {}", err)))?;
        out.push('\n');
        Ok(out)
    }
}

fn write_metadata(out: &mut String, report: &RunReport) {
    let _ = writeln!(out, "Metadata:");
    let _ = writeln!(out, "profile: {}", report.profile);
    let _ = writeln!(out, "workers: {}", report.workers);
    let _ = writeln!(out, "duration_s: {}", report.duration_secs);
    let _ = writeln!(out, "rate: {}", report.rate);
    let _ = writeln!(out, "seed: {}", report.seed);
    let _ = writeln!(out, "tick_ms: {}", report.tick_ms);
    let _ = writeln!(out, "ticks: {}/{}", report.ticks_run, report.total_ticks);
    if report.stopped_early {
        let _ = writeln!(out, "stopped early");
    }
}

fn write_summary(out: &mut String, report: &RunReport) {
    let value = |key: &str| report.summary.get(key).copied().unwrap_or(0.0);
    let _ = writeln!(out, "Summary:");
    let _ = writeln!(
        out,
        "requests: {} (completed {}, errors {}, timed out {}, refused {})",
        value("requests"),
        value("completed"),
        value("errors"),
        value("timed_out"),
        value("refused")
    );
    let _ = writeln!(out, "dropped by limiter: {}", report.dropped);
    let _ = writeln!(out, "error rate: {:.2}%", value("error_rate") * 100.0);
    if let Some(stats) = &report.latency {
        write_stats(out, "latency_ms", stats);
    }
    if let Some(stats) = &report.queue_depth {
        write_stats(out, "queue_depth", stats);
    }
    if let Some(score) = report.summary.get("resilience_score_avg") {
        let _ = writeln!(out, "resilience score: {:.1}", score);
    }
    let _ = writeln!(out, "faults injected: {}", report.faults.len());

    let pool_exhausted = report.target.get("pool_exhausted").copied();
    let cache_hits = report.target.get("cache_hits").copied();
    if let (Some(exhausted), Some(hits)) = (pool_exhausted, cache_hits) {
        let _ = writeln!(out, "database: {} cache hits, {} pool exhausted", hits, exhausted);
    }
}

fn write_stats(out: &mut String, label: &str, stats: &AggregateStats) {
    let _ = writeln!(
        out,
        "{}: min {:.1} avg {:.1} median {:.1} stdev {:.1} p90 {:.1} p99 {:.1} max {:.1}",
        label, stats.min, stats.avg, stats.median, stats.stdev, stats.p90, stats.p99, stats.max
    );
}

pub fn format_algorithms() -> String {
    let mut out = String::new();
    for algo in AlgoConfig::ALL {
        let _ = writeln!(out, "{}", algo);
    }
    out
}

pub fn format_profiles() -> String {
    let mut out = String::new();
    for kind in ProfileKind::ALL {
        let _ = writeln!(out, "{:<12} {}", kind.as_str(), kind.description());
    }
    out
}

pub fn format_extensions() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Plugins:");
    for (name, description) in PLUGINS {
        let _ = writeln!(out, "{:<18} {}", name, description);
    }
    let _ = writeln!(out, "Filters:");
    for (name, description) in FILTERS {
        let _ = writeln!(out, "{:<18} {}", name, description);
    }
    out
}

pub fn format_cluster(config: &ClusterConfig) -> String {
    let mut out = String::new();
    let database = &config.database;
    let _ = writeln!(out, "Algorithm: {}", config.algorithm);
    let _ = writeln!(
        out,
        "Database: pool {}, cache {} (hit rate {:.2}, query {}ms)",
        database.connection_pool,
        if database.cache_enabled { "on" } else { "off" },
        database.cache_hit_rate,
        database.query_latency * 1000.0
    );
    let _ = writeln!(out, "Backends:");
    for backend in &config.backends {
        let _ = writeln!(
            out,
            "- {} (workers: {}, max_queue: {}, latency: {}-{}ms, thresholds: {}/{}/{})",
            backend.name,
            backend.workers,
            backend.max_queue,
            backend.base_latency * 1000.0,
            backend.max_latency * 1000.0,
            backend.error_threshold,
            backend.timeout_threshold,
            backend.refuse_threshold
        );
    }
    out
}

pub fn format_cluster_json(config: &ClusterConfig) -> Result<String> {
    let mut out = serde_json::to_string_pretty(config)
        .map_err(|err| Error::Cli(format!("failed to encode config: {}", err)))?;
    out.push('\n');
    Ok(out)
}
