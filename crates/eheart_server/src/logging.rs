use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, filtering with `filter`
/// (`RUST_LOG` syntax).
pub fn init(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log filter `{filter}`"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}
