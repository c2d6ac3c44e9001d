//! Per-connection state and receive loop
//!
//! Each accepted TCP connection runs [`run_connection`] in its own task.
//! Bytes go into the connection's [`FrameDecoder`]; every complete message is
//! handed to the request coordinator and its reply written back before the
//! next message is decoded. Cleanup runs once, whichever of EOF, a read or
//! write error, or a server stop ends the loop.

use super::{ConnectionEvent, NetworkError};
use protocol::{FrameDecoder, OpHeader, OpMessage, OpStatus, ProtocolError, encode};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Read buffer size per connection
const READ_BUFFER_SIZE: usize = 4096;

/// High bit set on every USB/IP request command code
const REQUEST_FLAG: u16 = 0x8000;

/// Server-assigned connection identifier, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle: `Open -> Closing -> Closed`, never backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Open,
    Closing,
    Closed,
}

/// State owned by one connection task
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    peer: SocketAddr,
    phase: ConnectionPhase,
    decoder: FrameDecoder,
    opened_at: Instant,
    messages_received: u64,
    protocol_errors: u64,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            phase: ConnectionPhase::Open,
            decoder: FrameDecoder::new(),
            opened_at: Instant::now(),
            messages_received: 0,
            protocol_errors: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }

    /// Bytes of a partial message waiting for the rest
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Append received bytes; ignored once the connection is closing
    pub fn receive(&mut self, data: &[u8]) {
        if self.is_open() {
            self.decoder.extend(data);
        }
    }

    /// Take the next complete message off the receive buffer
    pub fn next_message(&mut self) -> Result<Option<OpMessage>, ProtocolError> {
        if !self.is_open() {
            return Ok(None);
        }
        let result = self.decoder.next_message();
        match &result {
            Ok(Some(_)) => self.messages_received += 1,
            Err(_) => self.protocol_errors += 1,
            Ok(None) => {}
        }
        result
    }

    /// Enter `Closing`, returning `true` only for the first caller
    pub fn begin_close(&mut self) -> bool {
        if self.phase != ConnectionPhase::Open {
            return false;
        }
        self.phase = ConnectionPhase::Closing;
        self.decoder.clear();
        true
    }

    pub fn finish_close(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }
}

/// Drive one connection until EOF, error or server stop
pub(crate) async fn run_connection(
    mut state: ConnectionState,
    stream: TcpStream,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = state.id();
    let peer = state.peer();
    let (mut reader, mut writer) = stream.into_split();

    if events
        .send(ConnectionEvent::Opened { id, peer })
        .await
        .is_err()
    {
        warn!("{}: request coordinator stopped, dropping connection from {}", id, peer);
        state.begin_close();
        state.finish_close();
        return;
    }
    info!("{}: connected from {}", id, peer);

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let error = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => {
                    trace!("{}: received {} bytes", id, n);
                    state.receive(&buf[..n]);
                    if let Err(e) = process_buffered(&mut state, &mut writer, &events).await {
                        break Some(e);
                    }
                }
                Err(e) => {
                    break Some(NetworkError::ReceiveFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            },
            _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => {
                debug!("{}: server stopping", id);
                break None;
            }
        }
    };

    close(&mut state, &mut writer, &events, error).await;
}

/// Dispatch every complete message currently buffered
async fn process_buffered(
    state: &mut ConnectionState,
    writer: &mut OwnedWriteHalf,
    events: &mpsc::Sender<ConnectionEvent>,
) -> Result<(), NetworkError> {
    let id = state.id();
    loop {
        match state.next_message() {
            Ok(Some(message)) => {
                debug!("{}: dispatching command {:#06x}", id, message.command());
                let (reply_tx, reply_rx) = oneshot::channel();
                events
                    .send(ConnectionEvent::Frame {
                        id,
                        message,
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| {
                        NetworkError::ConnectionFailed("request coordinator stopped".to_string())
                    })?;

                let reply = reply_rx.await.map_err(|_| {
                    NetworkError::ConnectionFailed(
                        "request coordinator dropped a request".to_string(),
                    )
                })?;
                if let Some(response) = reply {
                    write_message(id, writer, &response).await?;
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(
                    "{}: rejected message ({} buffered bytes left): {}",
                    id,
                    state.buffered(),
                    e
                );
                // A client waiting on an unimplemented request still gets an answer
                if let ProtocolError::UnsupportedCommand { command, .. } = e
                    && command & REQUEST_FLAG != 0
                {
                    let header = OpHeader::new(command & !REQUEST_FLAG, OpStatus::Error.code());
                    write_bytes(id, writer, &header_bytes(id, header)?).await?;
                }
            }
        }
    }
}

async fn write_message(
    id: ConnectionId,
    writer: &mut OwnedWriteHalf,
    message: &OpMessage,
) -> Result<(), NetworkError> {
    let bytes = match encode(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(
                "{}: failed to encode reply {:#06x}: {}",
                id,
                message.command(),
                e
            );
            header_bytes(id, OpHeader::new(message.command(), OpStatus::Error.code()))?
        }
    };
    write_bytes(id, writer, &bytes).await
}

fn header_bytes(id: ConnectionId, header: OpHeader) -> Result<Vec<u8>, NetworkError> {
    let mut bytes = Vec::with_capacity(OpHeader::SIZE);
    header
        .write_to(&mut bytes)
        .map_err(|e| NetworkError::SendFailed {
            id,
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

async fn write_bytes(
    id: ConnectionId,
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
) -> Result<(), NetworkError> {
    writer
        .write_all(bytes)
        .await
        .map_err(|e| NetworkError::SendFailed {
            id,
            reason: e.to_string(),
        })?;
    trace!("{}: sent {} bytes", id, bytes.len());
    Ok(())
}

async fn close(
    state: &mut ConnectionState,
    writer: &mut OwnedWriteHalf,
    events: &mpsc::Sender<ConnectionEvent>,
    error: Option<NetworkError>,
) {
    if !state.begin_close() {
        return;
    }
    let id = state.id();

    if let Err(e) = writer.shutdown().await {
        debug!("{}: socket shutdown failed: {}", id, e);
    }

    match &error {
        Some(e) => warn!(
            "{}: closed after {} message(s) in {:?}: {}",
            id,
            state.messages_received(),
            state.uptime(),
            e
        ),
        None => info!(
            "{}: closed after {} message(s) in {:?}",
            id,
            state.messages_received(),
            state.uptime()
        ),
    }

    if events
        .send(ConnectionEvent::Closed { id, error })
        .await
        .is_err()
    {
        debug!("{}: request coordinator gone before close notification", id);
    }
    state.finish_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::BusId;

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionId(7), "127.0.0.1:40000".parse().unwrap())
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "conn-42");
    }

    #[test]
    fn test_close_transition_runs_once() {
        let mut state = state();
        assert_eq!(state.phase(), ConnectionPhase::Open);

        assert!(state.begin_close());
        assert_eq!(state.phase(), ConnectionPhase::Closing);
        assert!(!state.begin_close());

        state.finish_close();
        assert_eq!(state.phase(), ConnectionPhase::Closed);
        assert!(!state.begin_close());
    }

    #[test]
    fn test_partial_message_persists() {
        let mut state = state();
        let bytes = encode(&OpMessage::ImportRequest {
            bus_id: BusId::new("1-1"),
        })
        .unwrap();

        state.receive(&bytes[..10]);
        assert_eq!(state.next_message().unwrap(), None);
        assert_eq!(state.buffered(), 10);

        state.receive(&bytes[10..]);
        assert!(matches!(
            state.next_message().unwrap(),
            Some(OpMessage::ImportRequest { .. })
        ));
        assert_eq!(state.messages_received(), 1);
        assert_eq!(state.buffered(), 0);
    }

    #[test]
    fn test_protocol_error_counted() {
        let mut state = state();
        state.receive(&[0x01, 0x06, 0x80, 0x05, 0, 0, 0, 0]);
        assert!(state.next_message().is_err());
        assert_eq!(state.protocol_errors(), 1);
        assert_eq!(state.buffered(), 0);
    }

    #[test]
    fn test_closing_connection_ignores_input() {
        let mut state = state();
        state.begin_close();
        state.receive(&encode(&OpMessage::DevListRequest).unwrap());
        assert_eq!(state.buffered(), 0);
        assert_eq!(state.next_message().unwrap(), None);
    }
}
