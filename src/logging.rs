//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "grounded_chat=info,gchat=info,tower_http=warn";

/// Install the global subscriber. Logs go to stderr so `gchat ask` can
/// stream the answer on stdout.
///
/// `RUST_LOG` overrides the default filter; `verbose` raises it to debug.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ if verbose => EnvFilter::new("grounded_chat=debug,gchat=debug"),
        _ => EnvFilter::new(DEFAULT_FILTER),
    };

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    // A second init (tests, embedding in another binary) is not an error.
    let _ = tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init();
}
