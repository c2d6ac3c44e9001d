//! Network subsystem
//!
//! Handles the USB/IP TCP listener and per-connection I/O.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager
//!   ├─> accept connections (up to max_connections)
//!   └─> spawn a task per connection
//!         ├─> buffer bytes, decode complete messages (FrameDecoder)
//!         ├─> ConnectionEvent::Frame ──> RequestCoordinator ──> reply
//!         ├─> write encoded replies in receipt order
//!         └─> ConnectionEvent::Closed exactly once on EOF, error or stop
//! ```

pub mod connection;
pub mod server;

use protocol::{OpMessage, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::oneshot;

pub use connection::{ConnectionId, ConnectionPhase, ConnectionState};
pub use server::ConnectionManager;

/// Capacity of the connection event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Listener could not be bound (invalid or busy port)
    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Server already running on {addr}")]
    AlreadyRunning { addr: SocketAddr },

    #[error("Server is not running")]
    NotRunning,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the connection
    #[error("Connection {id} closed")]
    ConnectionClosed { id: ConnectionId },

    #[error("Send failed on {id}: {reason}")]
    SendFailed { id: ConnectionId, reason: String },

    #[error("Receive failed on {id}: {reason}")]
    ReceiveFailed { id: ConnectionId, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl NetworkError {
    /// Whether the error prevents the server from running at all
    ///
    /// Everything else is scoped to a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetworkError::BindFailed { .. })
    }
}

/// Connection lifecycle event delivered to the request coordinator
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A client connected
    Opened { id: ConnectionId, peer: SocketAddr },

    /// A complete message arrived
    ///
    /// The connection waits on `reply` before decoding its next message, so
    /// messages of one connection are handled in receipt order. `None` means
    /// nothing is written back.
    Frame {
        id: ConnectionId,
        message: OpMessage,
        reply: oneshot::Sender<Option<OpMessage>>,
    },

    /// The connection ended; sent exactly once per `Opened`
    Closed {
        id: ConnectionId,
        /// Why it ended, `None` for a clean close by either side
        error: Option<NetworkError>,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Opened { id, .. }
            | ConnectionEvent::Frame { id, .. }
            | ConnectionEvent::Closed { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bind_failure_is_fatal() {
        assert!(
            NetworkError::BindFailed {
                port: 3240,
                reason: "in use".into()
            }
            .is_fatal()
        );
        assert!(!NetworkError::NotRunning.is_fatal());
        assert!(
            !NetworkError::ReceiveFailed {
                id: ConnectionId(1),
                reason: "reset".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_error_context() {
        let err = NetworkError::BindFailed {
            port: 3240,
            reason: "Address already in use".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3240"));
        assert!(msg.contains("already in use"));
    }
}
