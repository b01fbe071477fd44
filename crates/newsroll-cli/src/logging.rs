use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Installs the stderr subscriber; `RUST_LOG` overrides `default_level`.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("installing tracing subscriber: {err}"))
}
