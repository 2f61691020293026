//! Logging setup and configuration

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured default level.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
