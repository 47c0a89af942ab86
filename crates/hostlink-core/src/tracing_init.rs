//! Logging setup for the agent binary.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Crates whose events are shown at the configured level.
const CRATES: [&str; 3] = ["hostlink_agent", "hostlink_security", "hostlink_core"];

/// Filter directive applying `level` to every hostlink crate, e.g.
/// `"hostlink_agent=debug,hostlink_security=debug,hostlink_core=debug"`.
pub fn crate_filter(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. With `log_json` every event is a
/// JSON line. Fails when the directive is malformed or a subscriber is
/// already installed.
pub fn init_tracing(level: &str, log_json: bool) -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| crate_filter(level));
    let env_filter = EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("log filter {directives:?}: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}
