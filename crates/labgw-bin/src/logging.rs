//! Structured logging setup.
//!
//! Level and format come from the gateway configuration; `RUST_LOG`
//! overrides the level when set, which is handy for one-off debugging of
//! the CLI against a live database.

use anyhow::{bail, Result};
use labgw_core::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = fmt().with_env_filter(filter).with_target(false);
    match config.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        other => bail!("unsupported log format: {other}"),
    }
    Ok(())
}
