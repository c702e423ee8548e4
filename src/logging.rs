use anyhow::Result;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`),
/// writing to stderr so stdout stays free for command output.
///
/// Fails if a subscriber is already installed, callers that may run more than
/// once (tests, binaries sharing a process) should ignore the error.
pub fn init() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

    Ok(())
}
