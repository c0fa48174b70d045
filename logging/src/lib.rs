//! Log setup shared by the binaries and by tests.

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber for a binary.
///
/// `verbosity` is the number of `-v` flags: 0 = info, 1 = debug, 2+ = trace.
/// `RUST_LOG` still wins when set, so ad-hoc per-module directives keep
/// working.
pub fn setup(verbosity: u8) -> Result<()> {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_owned());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Failed to parse log directives: {directives}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Could not set global default subscriber: {e}"))?;

    Ok(())
}

/// Subscribes to logs for the duration of a test.
pub fn test(directives: &str) -> DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(directives)
        .with_test_writer()
        .finish();

    tracing::subscriber::set_default(subscriber)
}
