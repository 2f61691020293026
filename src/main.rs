//! xfpd: session-manager daemon for the Xserve front-panel USB device
//!
//! Attaches to the front panel when it appears, logs unsolicited device
//! events, and tears sessions down cleanly on unplug or Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use xfp_usb::config::Config;
use xfp_usb::usb::{Coordinator, DeviceNotification, spawn_bus_worker};

#[derive(Parser, Debug)]
#[command(name = "xfpd")]
#[command(
    author,
    version,
    about = "Session manager for the Apple Xserve front-panel USB device"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = Config::default();
        let path = Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::load_or_default(),
    };

    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    xfp_usb::logging::init(level).context("Failed to setup logging")?;

    info!("xfpd v{}", env!("CARGO_PKG_VERSION"));
    info!(
        vendor_id = format_args!("{:#06x}", config.device.vendor_id),
        product_id = format_args!("{:#06x}", config.device.product_id),
        "watching for device"
    );

    let (notify_tx, notify_rx) = async_channel::bounded(256);
    let coordinator = Arc::new(Coordinator::new(
        notify_tx,
        config.transfer.timeouts(),
        config.transfer.event_poll(),
    ));

    let worker =
        spawn_bus_worker(coordinator.clone(), config.device).context("Failed to start USB worker")?;

    let monitor = tokio::spawn(async move {
        while let Ok(notification) = notify_rx.recv().await {
            match notification {
                DeviceNotification::Attached { node } => {
                    info!(node = node.0, "device session attached");
                }
                DeviceNotification::Detached { node } => {
                    info!(node = node.0, "device session detached");
                }
                DeviceNotification::Event { node, payload } => {
                    info!(
                        node = node.0,
                        len = payload.len(),
                        "unsolicited device event"
                    );
                }
            }
        }
    });

    info!("Press Ctrl+C to shutdown");
    if let Err(err) = signal::ctrl_c().await {
        error!("Error waiting for Ctrl+C: {}", err);
    }

    info!("Shutting down USB subsystem...");
    worker.shutdown();
    monitor.abort();

    info!("Shutdown complete");
    Ok(())
}
