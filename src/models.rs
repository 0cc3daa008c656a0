use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Cluster description as it appears in a TOML or JSON config file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub algorithm: AlgoConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgoConfig::default(),
            backends: vec![BackendConfig::default()],
            database: DatabaseConfig::default(),
        }
    }
}

/// One backend. Latencies are in seconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,
    #[serde(default = "default_base_latency")]
    pub base_latency: f64,
    #[serde(default = "default_max_latency")]
    pub max_latency: f64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold: f64,
    #[serde(default = "default_refuse_threshold")]
    pub refuse_threshold: f64,
    #[serde(default = "default_max_error_probability")]
    pub max_error_probability: f64,
    #[serde(default = "default_max_timeout_probability")]
    pub max_timeout_probability: f64,
}

impl BackendConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            max_queue: default_max_queue(),
            base_latency: default_base_latency(),
            max_latency: default_max_latency(),
            error_threshold: default_error_threshold(),
            timeout_threshold: default_timeout_threshold(),
            refuse_threshold: default_refuse_threshold(),
            max_error_probability: default_max_error_probability(),
            max_timeout_probability: default_max_timeout_probability(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::named("backend-1")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_connection_pool")]
    pub connection_pool: u32,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_hit_rate")]
    pub cache_hit_rate: f64,
    /// Seconds a cache miss adds to the request.
    #[serde(default = "default_query_latency")]
    pub query_latency: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_pool: default_connection_pool(),
            cache_enabled: false,
            cache_hit_rate: default_cache_hit_rate(),
            query_latency: default_query_latency(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AlgoConfig {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRoundRobin,
    IpHash,
}

impl AlgoConfig {
    pub const ALL: [AlgoConfig; 5] = [
        AlgoConfig::RoundRobin,
        AlgoConfig::LeastConnections,
        AlgoConfig::Random,
        AlgoConfig::WeightedRoundRobin,
        AlgoConfig::IpHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgoConfig::RoundRobin => "round-robin",
            AlgoConfig::LeastConnections => "least-connections",
            AlgoConfig::Random => "random",
            AlgoConfig::WeightedRoundRobin => "weighted-round-robin",
            AlgoConfig::IpHash => "ip-hash",
        }
    }
}

impl fmt::Display for AlgoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgoConfig {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        AlgoConfig::ALL
            .into_iter()
            .find(|algo| algo.as_str() == normalized)
            .ok_or_else(|| Error::UnknownAlgorithm(value.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    #[default]
    Ramp,
    Wave,
    Burst,
    SlowClient,
    Stair,
    Chaos,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 6] = [
        ProfileKind::Ramp,
        ProfileKind::Wave,
        ProfileKind::Burst,
        ProfileKind::SlowClient,
        ProfileKind::Stair,
        ProfileKind::Chaos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Ramp => "ramp",
            ProfileKind::Wave => "wave",
            ProfileKind::Burst => "burst",
            ProfileKind::SlowClient => "slow-client",
            ProfileKind::Stair => "stair",
            ProfileKind::Chaos => "chaos",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProfileKind::Ramp => "linear climb to twice the base rate, then steady",
            ProfileKind::Wave => "sinusoidal demand between 1x and 3x the base rate",
            ProfileKind::Burst => "3x spikes for 3s out of every 8s",
            ProfileKind::SlowClient => "long-hold pressure decaying toward the base rate",
            ProfileKind::Stair => "six equal steps up to 3.5x the base rate",
            ProfileKind::Chaos => "ramp with seeded fault injection",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        ProfileKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::UnknownProfile(value.to_string()))
    }
}

/// Parameters of one engine run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RunParams {
    pub profile: ProfileKind,
    pub workers: usize,
    pub duration_secs: u64,
    /// Base request rate in requests per second.
    pub rate: u64,
    pub seed: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub chaos_rate: Option<f64>,
    #[serde(default)]
    pub realtime: bool,
    /// Snapshot plugin names, run in order before the filters.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl RunParams {
    pub fn new(profile: ProfileKind, workers: usize, duration_secs: u64, rate: u64, seed: u64) -> Self {
        Self {
            profile,
            workers,
            duration_secs,
            rate,
            seed,
            tick_ms: default_tick_ms(),
            jitter: default_jitter(),
            chaos_rate: None,
            realtime: false,
            plugins: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_chaos_rate(mut self, rate: f64) -> Self {
        self.chaos_rate = Some(rate);
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_plugins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn total_ticks(&self) -> u64 {
        if self.tick_ms == 0 {
            return 0;
        }
        (self.duration_secs * 1000) / self.tick_ms
    }

    /// Fault probability per tick; only the chaos profile injects by default.
    pub fn fault_rate(&self) -> f64 {
        match (self.chaos_rate, self.profile) {
            (Some(rate), _) => rate,
            (None, ProfileKind::Chaos) => DEFAULT_CHAOS_RATE,
            (None, _) => 0.0,
        }
    }
}

pub const DEFAULT_CHAOS_RATE: f64 = 0.15;

fn default_workers() -> u32 {
    50
}

fn default_max_queue() -> u32 {
    100
}

fn default_base_latency() -> f64 {
    0.05
}

fn default_max_latency() -> f64 {
    2.0
}

fn default_error_threshold() -> f64 {
    0.8
}

fn default_timeout_threshold() -> f64 {
    0.95
}

fn default_refuse_threshold() -> f64 {
    1.1
}

fn default_max_error_probability() -> f64 {
    0.5
}

fn default_max_timeout_probability() -> f64 {
    0.35
}

fn default_connection_pool() -> u32 {
    20
}

fn default_cache_hit_rate() -> f64 {
    0.7
}

fn default_query_latency() -> f64 {
    0.005
}

fn default_tick_ms() -> u64 {
    100
}

fn default_jitter() -> f64 {
    0.05
}
