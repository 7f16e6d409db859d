//! Tracing subscriber setup for the server binary.

use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging(default_directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("MAGI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {}", e))?;
    Ok(())
}
