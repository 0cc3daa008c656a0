use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Installs a stderr fmt subscriber filtered by `RUST_LOG`, falling back to
/// `verbosity` (or [`DEFAULT_LOG_LEVEL`]). Stdout is left to the report.
/// Calling this twice is harmless; the second call keeps the first
/// subscriber.
pub fn init(verbosity: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(verbosity.unwrap_or(DEFAULT_LOG_LEVEL)))
        .unwrap_or_default();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .with_filter(filter);

    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}

/// Maps repeated `-v` flags to a filter directive.
pub fn level_for(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}
