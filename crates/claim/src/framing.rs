//! IPC frame encoding
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][CRC32: u32 (big-endian)][postcard payload]
//! ```
//!
//! `Length` counts payload bytes only. The size limit applies to the whole
//! frame and is enforced before anything is written and before a receive
//! buffer is allocated.

use crate::error::{IpcError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length + checksum prefix
pub const FRAME_HEADER_SIZE: usize = 8;

/// Compute the CRC32 of a payload
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serialize `value` into a complete frame
///
/// Fails with [`IpcError::MessageTooLarge`] if the frame would exceed
/// `max_message_size`.
pub fn encode_frame<T: Serialize>(value: &T, max_message_size: usize) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(value)?;
    let size = FRAME_HEADER_SIZE + payload.len();
    if size > max_message_size {
        return Err(IpcError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }

    let mut frame = vec![0u8; FRAME_HEADER_SIZE];
    BigEndian::write_u32(&mut frame[0..4], payload.len() as u32);
    BigEndian::write_u32(&mut frame[4..8], compute_checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Verify and deserialize a complete frame
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8], max_message_size: usize) -> Result<T> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(IpcError::InvalidRequest(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    if frame.len() > max_message_size {
        return Err(IpcError::MessageTooLarge {
            size: frame.len(),
            max: max_message_size,
        });
    }

    let length = BigEndian::read_u32(&frame[0..4]) as usize;
    let expected = BigEndian::read_u32(&frame[4..8]);
    let payload = &frame[FRAME_HEADER_SIZE..];
    if payload.len() != length {
        return Err(IpcError::InvalidRequest(format!(
            "frame declares {} payload bytes, carries {}",
            length,
            payload.len()
        )));
    }

    let actual = compute_checksum(payload);
    if actual != expected {
        return Err(IpcError::ChecksumMismatch { expected, actual });
    }

    Ok(postcard::from_bytes(payload)?)
}

/// Read one raw frame from an async stream
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary. A stream
/// that ends inside a header or payload is an `UnexpectedEof` error.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        match reader.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} header bytes", filled, FRAME_HEADER_SIZE),
                )
                .into());
            }
            n => filled += n,
        }
    }

    let length = BigEndian::read_u32(&header[0..4]) as usize;
    let size = FRAME_HEADER_SIZE.saturating_add(length);
    if size > max_message_size {
        return Err(IpcError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }

    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&header);
    frame.resize(size, 0);
    reader.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await?;
    Ok(Some(frame))
}

/// Write one raw frame to an async stream
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
