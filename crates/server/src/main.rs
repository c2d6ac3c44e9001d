//! rust-usbip Server
//!
//! USB/IP daemon: lists the host's USB devices to remote clients and hands
//! imported devices over after the privileged claimer has claimed them.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use protocol::ExportedDevice;
use server::config::ServerConfig;
use server::network::{ConnectionManager, EVENT_QUEUE_CAPACITY};
use server::usb::{DeviceSource, RusbDeviceSource};
use server::{DeviceRegistry, RequestCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "USB/IP server - export USB devices over TCP")]
#[command(long_about = "
USB/IP server daemon. Remote hosts list and import this machine's USB
devices with the standard usbip client tools.

The daemon runs unprivileged. Importing a device requires the claimer
(usbip-claimer) to be running as root.

EXAMPLES:
    # Run with default config
    usbipd

    # Run with custom config
    usbipd --config /path/to/server.toml

    # List exportable USB devices without starting the server
    usbipd --list-devices

    # Run with debug logging on a non-standard port
    usbipd --log-level debug --port 13240

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-rs/server.toml
    3. /etc/usbip-rs/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// TCP port to listen on (overrides config)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let mut config = match args.config.as_deref() {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).as_ref());
            ServerConfig::load(Some(path)).context("Failed to load configuration")?
        }
        None => ServerConfig::load_or_default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
        config.validate().context("Invalid port")?;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-usbip Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let source = Arc::new(
        RusbDeviceSource::new(config.usb.filters.clone())
            .context("Failed to initialize USB subsystem")?,
    );

    if args.list_devices {
        let devices = source.list_devices().context("Failed to list devices")?;
        print_devices(&devices);
        return Ok(());
    }

    run_server(config, source).await
}

fn print_devices(devices: &[ExportedDevice]) {
    if devices.is_empty() {
        println!("No exportable USB devices found.");
        return;
    }

    println!("Found {} exportable USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  [{}] {:04x}:{:04x} class {:02x}/{:02x}/{:02x}",
            device.bus_id,
            device.vendor_id,
            device.product_id,
            device.device_class,
            device.device_subclass,
            device.device_protocol
        );
        println!(
            "      Bus {:03} Device {:03} Speed: {:?}, {} interface(s)",
            device.bus_number, device.device_number, device.speed, device.interface_count
        );
        println!();
    }
}

async fn run_server(config: ServerConfig, source: Arc<RusbDeviceSource>) -> Result<()> {
    let claimer = claim::ClaimClient::connect(&config.claimer)
        .await
        .context("Failed to connect to the claimer")?;

    // Subscribe before the initial scan so no change slips between the two
    let device_events = source
        .subscribe()
        .context("Failed to subscribe to device events")?;
    let devices = source.list_devices().context("Failed to list devices")?;
    info!("Exporting {} device(s)", devices.len());

    let registry = Arc::new(DeviceRegistry::with_devices(devices));
    let coordinator = RequestCoordinator::new(registry, claimer.clone());

    let uptime = coordinator
        .check_claimer()
        .await
        .context("Claimer did not answer the health check")?;
    info!("Claimer is up ({}s)", uptime);

    source
        .start_polling(config.usb.poll_interval())
        .context("Failed to start USB polling")?;
    let watcher = tokio::spawn(coordinator.clone().watch_devices(device_events));

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let coordinator_task = tokio::spawn(coordinator.clone().run(event_rx));

    let manager = ConnectionManager::new(
        config.server.bind_ip()?,
        config.server.max_connections,
        event_tx,
    );
    let addr = manager
        .start(config.server.port)
        .await
        .context("Failed to start USB/IP listener")?;
    info!("Listening on {}", addr);
    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if let Err(e) = manager.stop().await {
        warn!("Error stopping listener: {}", e);
    }
    // Dropping the manager drops the last event sender and ends the coordinator loop
    drop(manager);
    if let Err(e) = coordinator_task.await {
        error!("Coordinator task failed: {}", e);
    }

    let released = coordinator.release_all().await;
    info!("Released {} claim(s)", released);

    // Joins the polling thread, so keep it off the async workers
    let polling = source.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || polling.stop()).await {
        warn!("Failed to stop USB polling: {}", e);
    }
    watcher.abort();
    claimer.close().await;

    info!("Server shutdown complete");
    Ok(())
}
