use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::BackendProfile;
use crate::database::DatabaseLayer;
use crate::error::{Error, Result};
use crate::extensions::ExtensionPipeline;
use crate::limiter::{SafetyLimiter, SafetyLimits};
use crate::models::{AlgoConfig, ClusterConfig, ProfileKind, RunParams};

#[derive(Parser, Debug)]
#[command(name = "overload-sim", version, about = "Simulate server degradation under synthetic load")]
pub struct Cli {
    /// Raise log verbosity on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulation and print its report.
    Run(RunArgs),
    /// List the load-balancing algorithms.
    ListAlgorithms,
    /// List the attack profiles.
    ListProfiles,
    /// List the snapshot plugins and filters.
    ListExtensions,
    /// Print the cluster configuration a run would use.
    ShowConfig(ShowConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Cluster config file (.toml or .json). Without one a single default
    /// backend is simulated.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value = "ramp")]
    pub profile: ProfileKind,
    /// Overrides the algorithm from the config file.
    #[arg(long)]
    pub algorithm: Option<AlgoConfig>,
    #[arg(long, default_value_t = 10)]
    pub workers: usize,
    /// Run length in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration: u64,
    /// Base request rate in requests per second.
    #[arg(long, default_value_t = 200)]
    pub rate: u64,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,
    /// Per-tick fault probability; defaults to 0.15 for the chaos profile.
    #[arg(long)]
    pub chaos_rate: Option<f64>,
    #[arg(long)]
    pub jitter: Option<f64>,
    /// Pace submissions across each tick in wall-clock time.
    #[arg(long)]
    pub realtime: bool,
    /// Snapshot plugins to run each tick, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub plugins: Vec<String>,
    /// Snapshot filters to run after the plugins, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub filters: Vec<String>,
    #[arg(long, value_enum, default_value_t = FormatArg::Human)]
    pub format: FormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct ShowConfigArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub algorithm: Option<AlgoConfig>,
    #[arg(long, value_enum, default_value_t = FormatArg::Human)]
    pub format: FormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatArg {
    Human,
    Summary,
    Json,
}

/// Everything a `run` invocation resolved to.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub params: RunParams,
    pub cluster: Option<ClusterConfig>,
    pub format: FormatArg,
}

pub fn parse_args() -> Result<Cli> {
    match Cli::try_parse() {
        Ok(cli) => Ok(cli),
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => Err(Error::Cli(err.to_string())),
    }
}

pub fn build_run(args: RunArgs) -> Result<RunPlan> {
    let cluster = match &args.config {
        Some(path) => {
            let mut config = load_cluster_config(path)?;
            if let Some(algorithm) = args.algorithm {
                config.algorithm = algorithm;
            }
            validate_cluster(&config)?;
            Some(config)
        }
        None if args.algorithm.is_some() => {
            return Err(Error::Cli(
                "--algorithm requires --config with at least one backend".to_string(),
            ))
        }
        None => None,
    };

    let mut params = RunParams::new(args.profile, args.workers, args.duration, args.rate, args.seed)
        .with_tick_ms(args.tick_ms)
        .with_realtime(args.realtime)
        .with_plugins(args.plugins)
        .with_filters(args.filters);
    if let Some(jitter) = args.jitter {
        params = params.with_jitter(jitter);
    }
    if let Some(rate) = args.chaos_rate {
        params = params.with_chaos_rate(rate);
    }
    SafetyLimiter::default().check_run(&params)?;
    ExtensionPipeline::from_names(&params.plugins, &params.filters)?;

    Ok(RunPlan {
        params,
        cluster,
        format: args.format,
    })
}

pub fn build_show_config(args: &ShowConfigArgs) -> Result<ClusterConfig> {
    let mut config = match &args.config {
        Some(path) => load_cluster_config(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(algorithm) = args.algorithm {
        config.algorithm = algorithm;
    }
    validate_cluster(&config)?;
    Ok(config)
}

pub fn load_cluster_config(path: &Path) -> Result<ClusterConfig> {
    let contents = fs::read_to_string(path).map_err(|err| {
        Error::ConfigIo(format!(
            "failed to read config '{}': {}",
            path.display(),
            err
        ))
    })?;
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("");

    parse_cluster_str(&contents, ext)
}

pub fn parse_cluster_str(contents: &str, format: &str) -> Result<ClusterConfig> {
    match format {
        "toml" => toml::from_str(contents)
            .map_err(|err| Error::ConfigParse(format!("failed to parse TOML: {}", err))),
        "json" => serde_json::from_str(contents)
            .map_err(|err| Error::ConfigParse(format!("failed to parse JSON: {}", err))),
        "" => Err(Error::UnsupportedConfigFormat("unknown".to_string())),
        other => Err(Error::UnsupportedConfigFormat(other.to_string())),
    }
}

/// Checks a parsed cluster against the safety caps and every per-component
/// rule without building it.
pub fn validate_cluster(config: &ClusterConfig) -> Result<()> {
    if config.backends.is_empty() {
        return Err(Error::EmptyBackends);
    }
    SafetyLimiter::new(SafetyLimits::default()).check_cluster(config)?;

    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            return Err(Error::DuplicateBackendName(backend.name.clone()));
        }
        BackendProfile::from_config(backend)?;
    }
    DatabaseLayer::new(&config.database, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_TOML: &str = r#"
algorithm = "least-connections"

[[backends]]
name = "web-1"
workers = 8
max_queue = 40

[[backends]]
name = "web-2"
refuse_threshold = 1.0

[database]
connection_pool = 5
cache_enabled = true
"#;

    fn run_args() -> RunArgs {
        RunArgs {
            config: None,
            profile: ProfileKind::Ramp,
            algorithm: None,
            workers: 4,
            duration: 5,
            rate: 100,
            seed: 1,
            tick_ms: 100,
            chaos_rate: None,
            jitter: None,
            realtime: false,
            plugins: Vec::new(),
            filters: Vec::new(),
            format: FormatArg::Summary,
        }
    }

    #[test]
    fn toml_cluster_fills_defaults() {
        let config = parse_cluster_str(CLUSTER_TOML, "toml").unwrap();
        assert_eq!(config.algorithm, AlgoConfig::LeastConnections);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].workers, 8);
        assert_eq!(config.backends[1].workers, 50);
        assert_eq!(config.backends[1].refuse_threshold, 1.0);
        assert_eq!(config.database.connection_pool, 5);
        assert!(config.database.cache_enabled);
        assert_eq!(config.database.cache_hit_rate, 0.7);
        validate_cluster(&config).unwrap();
    }

    #[test]
    fn json_cluster_parses() {
        let json = r#"{"algorithm":"ip-hash","backends":[{"name":"a"},{"name":"b","workers":3}]}"#;
        let config = parse_cluster_str(json, "json").unwrap();
        assert_eq!(config.algorithm, AlgoConfig::IpHash);
        assert_eq!(config.backends[1].workers, 3);
        assert_eq!(config.database.connection_pool, 20);
        assert!(!config.database.cache_enabled);
    }

    #[test]
    fn missing_backends_names_the_field() {
        let err = parse_cluster_str("algorithm = \"random\"", "toml").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("backends"));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = parse_cluster_str(
            "algorithm = \"fastest\"\n[[backends]]\nname = \"a\"\n",
            "toml",
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = parse_cluster_str("", "yaml").unwrap_err();
        assert_eq!(err.to_string(), "unsupported config format 'yaml'");
    }

    #[test]
    fn validation_catches_threshold_and_pool_errors() {
        let mut config = parse_cluster_str(CLUSTER_TOML, "toml").unwrap();
        config.backends[0].refuse_threshold = 2.5;
        let err = validate_cluster(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid config field 'backends.web-1.refuse_threshold': must be between 0 and 2.0"
        );

        let mut config = parse_cluster_str(CLUSTER_TOML, "toml").unwrap();
        config.database.connection_pool = 0;
        assert!(validate_cluster(&config).is_err());

        let mut config = parse_cluster_str(CLUSTER_TOML, "toml").unwrap();
        config.backends[1].name = "web-1".to_string();
        assert!(matches!(
            validate_cluster(&config),
            Err(Error::DuplicateBackendName(_))
        ));
    }

    #[test]
    fn build_run_applies_overrides() {
        let mut args = run_args();
        args.profile = ProfileKind::Chaos;
        args.jitter = Some(0.2);
        let plan = build_run(args).unwrap();
        assert!(plan.cluster.is_none());
        assert_eq!(plan.params.jitter, 0.2);
        assert_eq!(plan.params.fault_rate(), 0.15);
        assert_eq!(plan.format, FormatArg::Summary);
    }

    #[test]
    fn build_run_enforces_safety_caps() {
        let mut args = run_args();
        args.workers = 2_000;
        assert!(matches!(
            build_run(args),
            Err(Error::SafetyLimitExceeded { field: "workers", .. })
        ));
    }

    #[test]
    fn build_run_rejects_unknown_extensions() {
        let mut args = run_args();
        args.plugins = vec!["trend-lens".to_string(), "crystal-ball".to_string()];
        let err = build_run(args).unwrap_err();
        assert!(err.is_config());
        assert_eq!(err.to_string(), "unknown plugin 'crystal-ball'");
    }

    #[test]
    fn cli_splits_extension_lists() {
        let cli = Cli::try_parse_from([
            "overload-sim",
            "run",
            "--plugins",
            "resilience-score,trend-lens",
            "--filters",
            "error-smooth",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.plugins, vec!["resilience-score", "trend-lens"]);
                assert_eq!(args.filters, vec!["error-smooth"]);
                let plan = build_run(args).unwrap();
                assert_eq!(plan.params.plugins.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn algorithm_override_needs_a_config() {
        let mut args = run_args();
        args.algorithm = Some(AlgoConfig::Random);
        assert!(matches!(build_run(args), Err(Error::Cli(_))));
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "overload-sim",
            "run",
            "--profile",
            "slow_client",
            "--workers",
            "3",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.profile, ProfileKind::SlowClient);
                assert_eq!(args.workers, 3);
                assert_eq!(args.format, FormatArg::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
