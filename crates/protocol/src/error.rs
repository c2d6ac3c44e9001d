//! Protocol error types

use thiserror::Error;

/// USB/IP codec errors
///
/// All variants are local to a single message: the connection that produced
/// the bytes stays open and only the offending message is rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Header is truncated or names a command this codec does not know
    #[error("Invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Header carries a protocol version other than the supported one
    #[error("Unsupported protocol version: {version:#06x} (expected {expected:#06x})")]
    UnsupportedVersion { version: u16, expected: u16 },

    /// Known USB/IP command that this server does not implement
    ///
    /// `frame_len` is the number of bytes the rejected message occupies, so a
    /// stream decoder can skip it and stay in sync.
    #[error("Unsupported command: {command:#06x}")]
    UnsupportedCommand { command: u16, frame_len: usize },

    /// Payload is shorter than the header's declared structure requires
    #[error("Invalid data length: needed {needed} bytes, got {available}")]
    InvalidDataLength { needed: usize, available: usize },

    /// Structurally invalid field contents or a count that overflows its field
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error while reading or writing a field
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error concerns the fixed 8-byte operation header
    pub fn is_header_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader { .. } | ProtocolError::UnsupportedVersion { .. }
        )
    }

    /// Number of buffered bytes a stream decoder may discard to resynchronise
    ///
    /// `None` means the message boundary is unknown and the buffered input
    /// has to be dropped.
    pub fn skip_len(&self) -> Option<usize> {
        match self {
            ProtocolError::UnsupportedCommand { frame_len, .. } => Some(*frame_len),
            _ => None,
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnsupportedVersion {
            version: 0x0106,
            expected: 0x0111,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unsupported protocol version"));
        assert!(msg.contains("0x0106"));
        assert!(msg.contains("0x0111"));
    }

    #[test]
    fn test_unsupported_command_skip_len() {
        let err = ProtocolError::UnsupportedCommand {
            command: 0x8002,
            frame_len: 40,
        };
        assert_eq!(err.skip_len(), Some(40));
        assert!(!err.is_header_error());
        assert!(format!("{}", err).contains("0x8002"));
    }

    #[test]
    fn test_header_errors_have_no_skip_len() {
        let err = ProtocolError::InvalidHeader {
            reason: "unknown command 0x1234".to_string(),
        };
        assert!(err.is_header_error());
        assert_eq!(err.skip_len(), None);
    }
}
