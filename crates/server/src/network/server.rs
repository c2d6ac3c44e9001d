//! USB/IP TCP listener
//!
//! Owns the listening socket and the set of live connection tasks. Every
//! accepted connection runs independently; the only state they share is the
//! event queue into the request coordinator.

use super::connection::{ConnectionId, ConnectionState, run_connection};
use super::{ConnectionEvent, NetworkError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop()` waits for a connection task to finish its cleanup
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

type ConnectionTable = Arc<Mutex<HashMap<ConnectionId, JoinHandle<()>>>>;

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    connections: ConnectionTable,
}

/// TCP connection manager for the USB/IP listener
pub struct ConnectionManager {
    bind_addr: IpAddr,
    max_connections: usize,
    events: mpsc::Sender<ConnectionEvent>,
    next_id: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    /// Create a stopped manager that will report events on `events`
    pub fn new(
        bind_addr: IpAddr,
        max_connections: usize,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            bind_addr,
            max_connections: max_connections.max(1),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            running: Mutex::new(None),
        }
    }

    /// Manager listening on the loopback interface
    pub fn localhost(max_connections: usize, events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), max_connections, events)
    }

    /// Bind `port` and start accepting connections
    ///
    /// Fails with `BindFailed` for port 0 or a port already in use, and with
    /// `AlreadyRunning` if the manager was started before.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, NetworkError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(NetworkError::AlreadyRunning {
                addr: current.local_addr,
            });
        }

        if port == 0 {
            return Err(NetworkError::BindFailed {
                port,
                reason: "port must be in 1-65535".to_string(),
            });
        }

        let listener = TcpListener::bind((self.bind_addr, port))
            .await
            .map_err(|e| NetworkError::BindFailed {
                port,
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed {
                port,
                reason: e.to_string(),
            })?;

        let (shutdown, _) = watch::channel(false);
        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            AcceptContext {
                events: self.events.clone(),
                connections: connections.clone(),
                shutdown: shutdown.clone(),
                next_id: self.next_id.clone(),
                max_connections: self.max_connections,
            },
        ));

        info!("USB/IP server listening on {}", local_addr);
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
            connections,
        });
        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    ///
    /// Individual close failures are logged, not returned.
    pub async fn stop(&self) -> Result<(), NetworkError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(NetworkError::NotRunning);
        };

        info!("Stopping USB/IP server on {}", running.local_addr);
        running.accept_task.abort();
        running.shutdown.send_replace(true);

        let tasks: Vec<_> = running.connections.lock().await.drain().collect();
        let count = tasks.len();
        for (id, mut task) in tasks {
            match tokio::time::timeout(STOP_GRACE_PERIOD, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: connection task failed during stop: {}", id, e),
                Err(_) => {
                    warn!("{}: did not close within {:?}, aborting", id, STOP_GRACE_PERIOD);
                    task.abort();
                }
            }
        }

        info!("USB/IP server stopped ({} connection(s) closed)", count);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the listener is bound to, if running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of open client connections
    pub async fn connection_count(&self) -> usize {
        match self.running.lock().await.as_ref() {
            Some(running) => running.connections.lock().await.len(),
            None => 0,
        }
    }
}

struct AcceptContext {
    events: mpsc::Sender<ConnectionEvent>,
    connections: ConnectionTable,
    shutdown: watch::Sender<bool>,
    next_id: Arc<AtomicU64>,
    max_connections: usize,
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Per-connection accept failures (e.g. reset before accept) are not fatal
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        admit(stream, peer, &ctx).await;
    }
}

async fn admit(stream: TcpStream, peer: SocketAddr, ctx: &AcceptContext) {
    let mut connections = ctx.connections.lock().await;
    if connections.len() >= ctx.max_connections {
        warn!(
            "Rejecting connection from {}: {} of {} connections in use",
            peer,
            connections.len(),
            ctx.max_connections
        );
        drop(stream);
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let id = ConnectionId(ctx.next_id.fetch_add(1, Ordering::Relaxed));
    let state = ConnectionState::new(id, peer);
    let events = ctx.events.clone();
    let shutdown = ctx.shutdown.subscribe();
    let table = ctx.connections.clone();

    let task = tokio::spawn(async move {
        run_connection(state, stream, events, shutdown).await;
        table.lock().await.remove(&id);
    });
    connections.insert(id, task);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionManager::localhost(4, tx), rx)
    }

    #[tokio::test]
    async fn test_port_zero_rejected() {
        let (manager, _rx) = manager();
        let result = manager.start(0).await;
        assert!(matches!(result, Err(NetworkError::BindFailed { port: 0, .. })));
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let (manager, _rx) = manager();
        assert!(matches!(manager.stop().await, Err(NetworkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let (manager, _rx) = manager();
        let Err(err) = manager.start(port).await else {
            panic!("Expected BindFailed");
        };
        assert!(err.is_fatal());
        assert!(matches!(err, NetworkError::BindFailed { port: p, .. } if p == port));
    }
}
