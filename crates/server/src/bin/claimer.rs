//! rust-usbip Claimer
//!
//! Privileged helper that detaches kernel drivers and claims USB devices on
//! behalf of the unprivileged USB/IP daemon. Listens on a Unix socket and
//! speaks the claim IPC protocol.

use anyhow::{Context, Result};
use clap::Parser;
use claim::transport::unix;
use claim::{ClaimService, IpcServer};
use common::setup_logging;
use nix::unistd::Uid;
use server::RusbClaimBackend;
use server::config::ServerConfig;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Socket mode: owner and group may connect
const SOCKET_MODE: u32 = 0o660;

#[derive(Parser, Debug)]
#[command(name = "usbip-claimer")]
#[command(author, version, about = "USB/IP claimer - privileged device claims")]
#[command(long_about = "
Privileged helper for usbipd. Claims USB devices for export by detaching
their kernel drivers, and gives them back to the host on release.

Must run as root. Reads the [claimer] section of the server configuration.

EXAMPLES:
    # Run with default config
    sudo usbip-claimer

    # Run with custom config and debug logging
    sudo usbip-claimer --config /etc/usbip-rs/server.toml --log-level debug
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).as_ref());
            ServerConfig::load(Some(path)).context("Failed to load configuration")?
        }
        None => ServerConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-usbip Claimer v{}", env!("CARGO_PKG_VERSION"));
    if !Uid::effective().is_root() {
        warn!("Not running as root: kernel drivers cannot be detached");
    }

    let ipc = config.claimer;
    let backend =
        Arc::new(RusbClaimBackend::new().context("Failed to initialize USB subsystem")?);
    let service = Arc::new(ClaimService::new(
        ipc.service_name.clone(),
        backend,
        ipc.history_limit,
    ));
    let server = IpcServer::new(service.clone(), ipc.clone());

    let path = ipc.socket_path().context("Invalid claimer socket path")?;
    let listener = unix::bind(&path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    info!("Listening on {}", path.display());

    let serve = tokio::spawn(server.clone().serve_unix(listener));

    // Either a signal or a shutdown command from the daemon ends the service
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
        _ = service.wait_for_shutdown() => info!("Shutdown requested over IPC"),
    }
    service.request_shutdown();

    match serve.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Claim service failed: {}", e),
        Err(e) => error!("Claim service task failed: {}", e),
    }

    let released = service.release_all().await;
    info!("Released {} claim(s)", released);

    if let Err(e) = std::fs::remove_file(&path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }

    info!("Claimer shutdown complete");
    Ok(())
}
