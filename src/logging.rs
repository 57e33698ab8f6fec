//! Tracing bootstrap for embedders and tests.
use tracing_subscriber::EnvFilter;

/// Install the global subscriber, honoring `RUST_LOG` and falling back to
/// `info` (or `debug` when `verbose`). Installing twice is an error; tests
/// that race on this can ignore the result.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let fallback = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}
