//! Transports for claim IPC frames
//!
//! The IPC client and server only see a [`FramedChannel`]: a queue of
//! outbound frames and a queue of inbound frames. What moves the bytes is
//! decided here, which keeps authentication, statistics and timeouts
//! testable without a privileged process.

use tokio::sync::mpsc;

/// Default depth of the frame queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Bidirectional, ordered frame channel
#[derive(Debug)]
pub struct FramedChannel {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl FramedChannel {
    pub fn new(outbound: mpsc::Sender<Vec<u8>>, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { outbound, inbound }
    }

    /// Split into the sending and receiving queues
    pub fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.outbound, self.inbound)
    }
}

/// Two in-process channel ends wired to each other
pub fn memory_pair(capacity: usize) -> (FramedChannel, FramedChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (FramedChannel::new(a_tx, a_rx), FramedChannel::new(b_tx, b_rx))
}

#[cfg(unix)]
pub mod unix {
    //! Unix domain socket transport

    use super::{DEFAULT_CHANNEL_CAPACITY, FramedChannel};
    use crate::error::{IpcError, Result};
    use crate::framing::{read_frame, write_frame};
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    /// Connect to the claimer socket
    pub async fn connect(path: &Path, max_message_size: usize) -> Result<FramedChannel> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            IpcError::ServiceUnavailable(format!(
                "cannot connect to claimer at {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!("Connected to claimer at {}", path.display());
        Ok(attach(stream, max_message_size))
    }

    /// Bind the claimer socket, replacing a stale socket file
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(UnixListener::bind(path)?)
    }

    /// Drive a connected stream with a reader and a writer task
    pub fn attach(stream: UnixStream, max_message_size: usize) -> FramedChannel {
        let (mut read_half, mut write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, max_message_size).await {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("IPC peer closed the socket");
                        break;
                    }
                    Err(e) => {
                        warn!("IPC read failed: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    warn!("IPC write failed: {}", e);
                    break;
                }
            }
        });

        FramedChannel::new(outbound_tx, inbound_rx)
    }
}
