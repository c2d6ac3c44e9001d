//! Claim IPC message definitions
//!
//! Requests flow from the daemon to the privileged claimer, responses flow
//! back. Both travel inside an [`IpcEnvelope`] so one channel carries both
//! directions.

use crate::error::IpcFailure;
use crate::stats::StatisticsSnapshot;
use chrono::{DateTime, Utc};
use protocol::BusId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Parameter key naming the target device
pub const PARAM_BUS_ID: &str = "bus_id";

/// Parameter key limiting the number of history entries returned
pub const PARAM_LIMIT: &str = "limit";

/// Command requested of the claimer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpcCommand {
    /// Take exclusive ownership of a device (`bus_id`)
    ClaimDevice,
    /// Give up ownership of a device (`bus_id`)
    ReleaseDevice,
    /// List all current claims
    GetClaimedDevices,
    /// Service status and statistics
    GetStatus,
    /// Liveness check
    HealthCheck,
    /// Recent claim/release history (optional `limit`)
    GetClaimHistory,
    /// Ask the claimer to release everything and exit
    Shutdown,
}

impl IpcCommand {
    /// Whether the command mutates claim state
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            IpcCommand::ClaimDevice | IpcCommand::ReleaseDevice | IpcCommand::Shutdown
        )
    }
}

impl fmt::Display for IpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IpcCommand::ClaimDevice => "claimDevice",
            IpcCommand::ReleaseDevice => "releaseDevice",
            IpcCommand::GetClaimedDevices => "getClaimedDevices",
            IpcCommand::GetStatus => "getStatus",
            IpcCommand::HealthCheck => "healthCheck",
            IpcCommand::GetClaimHistory => "getClaimHistory",
            IpcCommand::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Request sent to the claimer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Correlates the response with this request
    pub request_id: Uuid,
    /// Identity of the caller, checked by the claimer
    pub client_id: String,
    /// Requested command
    pub command: IpcCommand,
    /// Command parameters
    pub parameters: BTreeMap<String, String>,
}

impl IpcRequest {
    /// Create a request with a fresh id and no parameters
    pub fn new(client_id: impl Into<String>, command: IpcCommand) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id: client_id.into(),
            command,
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Read the `bus_id` parameter
    pub fn bus_id(&self) -> Result<BusId, IpcFailure> {
        self.parameters
            .get(PARAM_BUS_ID)
            .filter(|id| !id.is_empty())
            .map(|id| BusId::new(id.as_str()))
            .ok_or_else(|| IpcFailure::InvalidRequest {
                reason: format!("{} requires a '{}' parameter", self.command, PARAM_BUS_ID),
            })
    }
}

/// Successful result payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcResult {
    /// Claim granted (or the caller's existing claim)
    Claimed(ClaimedDevice),
    /// Release completed; `was_claimed` is false for a no-op release
    Released { bus_id: BusId, was_claimed: bool },
    /// Current claims
    ClaimedDevices(Vec<ClaimedDevice>),
    /// Service status
    Status(ServiceStatus),
    /// Health check result
    Health { healthy: bool, uptime_secs: u64 },
    /// Claim history, oldest first
    History(Vec<ClaimHistoryEntry>),
    /// Shutdown accepted
    ShutdownAck,
}

/// Response returned by the claimer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Id of the request this answers
    pub request_id: Uuid,
    /// Result or rejection reason
    pub result: Result<IpcResult, IpcFailure>,
}

impl IpcResponse {
    /// Successful response
    pub fn ok(request_id: Uuid, result: IpcResult) -> Self {
        Self {
            request_id,
            result: Ok(result),
        }
    }

    /// Failed response
    pub fn failure(request_id: Uuid, failure: IpcFailure) -> Self {
        Self {
            request_id,
            result: Err(failure),
        }
    }

    /// Whether the request succeeded
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Unit carried on an IPC channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcEnvelope {
    Request(IpcRequest),
    Response(IpcResponse),
}

/// Lifecycle state of a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    /// Device is exclusively held
    Claimed,
    /// Release in progress
    Releasing,
    /// Device handed back to the host
    Released,
}

/// How the claimer obtained exclusive access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimMethod {
    /// Kernel drivers were detached from the device's interfaces
    DriverDetach,
    /// No kernel driver was bound; interfaces were claimed directly
    DirectClaim,
}

/// Exclusive ownership record for one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedDevice {
    /// Stable device identifier (`vid:pid@busid`)
    pub device_id: String,
    /// Bus id of the claimed device
    pub bus_id: BusId,
    pub vendor_id: u16,
    pub product_id: u16,
    /// When the claim was granted
    pub claim_time: DateTime<Utc>,
    pub claim_method: ClaimMethod,
    pub claim_state: ClaimState,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
}

impl ClaimedDevice {
    /// Format the device identifier for a bus id and VID/PID pair
    pub fn make_device_id(bus_id: &BusId, vendor_id: u16, product_id: u16) -> String {
        format!("{:04x}:{:04x}@{}", vendor_id, product_id, bus_id)
    }
}

/// Kind of history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimAction {
    Claimed,
    Released,
    /// Hardware release failed; the claim was dropped anyway
    ReleaseFailed,
}

/// One entry of the claim history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: ClaimAction,
    pub client_id: String,
    /// Claim as it stood after the action
    pub device: ClaimedDevice,
}

/// Claimer status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub claimed_devices: usize,
    pub shutting_down: bool,
    pub statistics: StatisticsSnapshot,
}
