//! Claim IPC error types
//!
//! [`IpcError`] is what callers on either side of the channel see.
//! [`IpcFailure`] is the serializable subset that travels inside an
//! [`IpcResponse`](crate::IpcResponse) when the claimer rejects a request.

use protocol::BusId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the claim IPC layer
#[derive(Debug, Error)]
pub enum IpcError {
    /// No response arrived within the request timeout
    #[error("Request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: Uuid, timeout: Duration },

    /// Client identity was rejected by the claimer
    #[error("Authentication failed for client '{client_id}'")]
    AuthenticationFailed { client_id: String },

    /// Encoded message exceeds the configured maximum
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Too many requests are awaiting responses
    #[error("Pending request limit exceeded ({limit} outstanding)")]
    PendingLimitExceeded { limit: usize },

    /// Claimer cannot be reached or dropped the channel
    #[error("Claim service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Client was closed while the request was outstanding
    #[error("Claim client stopped")]
    ServiceStopped,

    /// Too many concurrent IPC connections
    #[error("Connection limit reached ({max} connections)")]
    ConnectionLimit { max: usize },

    /// Device is claimed by another owner
    #[error("Device {bus_id} is already claimed by '{owner}'")]
    AlreadyClaimed { bus_id: BusId, owner: String },

    /// No device with this bus id exists on the host
    #[error("Device {0} not found")]
    DeviceNotFound(BusId),

    /// Hardware claim or release failed
    #[error("Claim operation on {bus_id} failed: {reason}")]
    ClaimFailed { bus_id: BusId, reason: String },

    /// Malformed request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Frame checksum did not match its payload
    #[error("Frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Response carried an unexpected result variant
    #[error("Unexpected response to {command}")]
    UnexpectedResponse { command: String },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Transport I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used to map IPC failures onto client-visible status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcErrorKind {
    /// Request timed out
    Timeout,
    /// Caller is not allowed to talk to the claimer
    Authentication,
    /// A size or count limit was hit
    ResourceExhausted,
    /// Claimer is not running or the channel is gone
    Unavailable,
    /// Device is owned by someone else
    Conflict,
    /// Device does not exist
    NotFound,
    /// Hardware-level failure
    Device,
    /// Malformed data on the channel or in the request
    Protocol,
}

impl IpcError {
    /// Classify this error
    pub fn kind(&self) -> IpcErrorKind {
        match self {
            IpcError::Timeout { .. } => IpcErrorKind::Timeout,
            IpcError::AuthenticationFailed { .. } => IpcErrorKind::Authentication,
            IpcError::MessageTooLarge { .. }
            | IpcError::PendingLimitExceeded { .. }
            | IpcError::ConnectionLimit { .. } => IpcErrorKind::ResourceExhausted,
            IpcError::ServiceUnavailable(_) | IpcError::ServiceStopped | IpcError::Io(_) => {
                IpcErrorKind::Unavailable
            }
            IpcError::AlreadyClaimed { .. } => IpcErrorKind::Conflict,
            IpcError::DeviceNotFound(_) => IpcErrorKind::NotFound,
            IpcError::ClaimFailed { .. } => IpcErrorKind::Device,
            IpcError::InvalidRequest(_)
            | IpcError::ChecksumMismatch { .. }
            | IpcError::UnexpectedResponse { .. }
            | IpcError::Config(_)
            | IpcError::Serialization(_) => IpcErrorKind::Protocol,
        }
    }
}

/// Rejection reason carried inside a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum IpcFailure {
    #[error("client '{client_id}' is not authorized")]
    AuthenticationFailed { client_id: String },

    #[error("device {bus_id} is already claimed by '{owner}'")]
    AlreadyClaimed { bus_id: BusId, owner: String },

    #[error("device {bus_id} is claimed by '{owner}', not by the caller")]
    NotOwner { bus_id: BusId, owner: String },

    #[error("device {bus_id} not found")]
    DeviceNotFound { bus_id: BusId },

    #[error("claim operation on {bus_id} failed: {reason}")]
    ClaimFailed { bus_id: BusId, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("claim service is shutting down")]
    ShuttingDown,
}

impl From<IpcFailure> for IpcError {
    fn from(failure: IpcFailure) -> Self {
        match failure {
            IpcFailure::AuthenticationFailed { client_id } => {
                IpcError::AuthenticationFailed { client_id }
            }
            IpcFailure::AlreadyClaimed { bus_id, owner }
            | IpcFailure::NotOwner { bus_id, owner } => IpcError::AlreadyClaimed { bus_id, owner },
            IpcFailure::DeviceNotFound { bus_id } => IpcError::DeviceNotFound(bus_id),
            IpcFailure::ClaimFailed { bus_id, reason } => IpcError::ClaimFailed { bus_id, reason },
            IpcFailure::InvalidRequest { reason } => IpcError::InvalidRequest(reason),
            IpcFailure::ResponseTooLarge { size, max } => IpcError::MessageTooLarge { size, max },
            IpcFailure::ShuttingDown => {
                IpcError::ServiceUnavailable("claim service is shutting down".to_string())
            }
        }
    }
}

/// Type alias for IPC results
pub type Result<T> = std::result::Result<T, IpcError>;
