use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "nicplug=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Human,
    /// One JSON object per event.
    Json,
}

/// Install the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}
