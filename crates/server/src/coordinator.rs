//! Request coordinator
//!
//! Consumes [`ConnectionEvent`]s, answers device-list requests from the
//! [`DeviceRegistry`] and turns import requests into claims at the
//! privileged claimer.
//!
//! Claims are serialized per device: an import holds that device's lock for
//! the whole claim round trip, so two imports of one device never race while
//! imports of different devices proceed in parallel. The claim table itself
//! is only locked for single read-modify-write steps, never across IPC.
//!
//! A claim belongs to the TCP session that imported it. When that session
//! disconnects the claim is detached, not released: the device stays claimed
//! and the next importer adopts it.

use crate::network::{ConnectionEvent, ConnectionId};
use crate::registry::DeviceRegistry;
use claim::{ClaimClient, ClaimedDevice, IpcError, IpcErrorKind};
use common::DeviceEvent;
use protocol::{BusId, OpMessage, OpStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Message is not a request this server answers
    #[error("Unexpected message {command:#06x} from client")]
    UnexpectedMessage { command: u16 },

    #[error("Claim IPC error: {0}")]
    Ipc(#[from] IpcError),
}

/// Claim held on behalf of a USB/IP session
#[derive(Debug, Clone)]
pub struct SessionClaim {
    pub device: ClaimedDevice,
    /// Importing session, `None` once it disconnected
    pub owner: Option<ConnectionId>,
}

#[derive(Default)]
struct ClaimTable {
    claims: HashMap<BusId, SessionClaim>,
    live_sessions: HashSet<ConnectionId>,
}

/// Outcome of looking at the local claim table before going to the claimer
enum LocalClaim {
    Adopted,
    Busy(ConnectionId),
    Absent,
}

pub struct RequestCoordinator {
    registry: Arc<DeviceRegistry>,
    claimer: ClaimClient,
    table: Mutex<ClaimTable>,
    device_locks: Mutex<HashMap<BusId, Arc<Mutex<()>>>>,
}

impl RequestCoordinator {
    pub fn new(registry: Arc<DeviceRegistry>, claimer: ClaimClient) -> Arc<Self> {
        Arc::new(Self {
            registry,
            claimer,
            table: Mutex::new(ClaimTable::default()),
            device_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn claimer(&self) -> &ClaimClient {
        &self.claimer
    }

    /// Health-check the claimer, returning its uptime in seconds
    pub async fn check_claimer(&self) -> Result<u64, CoordinatorError> {
        Ok(self.claimer.health_check().await?)
    }

    /// Consume connection events until every sender is gone
    ///
    /// Each frame is handled in its own task so a slow claim for one client
    /// does not hold up any other connection.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        info!("Request coordinator started");
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened { id, peer } => {
                    debug!("{}: session opened from {}", id, peer);
                    self.handle_connection_opened(id).await;
                }
                ConnectionEvent::Frame { id, message, reply } => {
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        let response = match coordinator.handle_message(id, message).await {
                            Ok(response) => Some(response),
                            Err(e) => {
                                warn!("{}: {}", id, e);
                                None
                            }
                        };
                        if reply.send(response).is_err() {
                            debug!("{}: connection closed before reply", id);
                        }
                    });
                }
                ConnectionEvent::Closed { id, error } => {
                    if let Some(e) = error {
                        debug!("{}: session ended with error: {}", id, e);
                    }
                    self.handle_connection_closed(id).await;
                }
            }
        }
        info!("Request coordinator stopped");
    }

    /// Route one decoded message to its handler
    pub async fn handle_message(
        &self,
        session: ConnectionId,
        message: OpMessage,
    ) -> Result<OpMessage, CoordinatorError> {
        match message {
            OpMessage::DevListRequest => Ok(self.handle_device_list().await),
            OpMessage::ImportRequest { bus_id } => {
                Ok(self.handle_device_import(session, &bus_id).await)
            }
            other => Err(CoordinatorError::UnexpectedMessage {
                command: other.command(),
            }),
        }
    }

    /// Device-list reply in registry order
    pub async fn handle_device_list(&self) -> OpMessage {
        let devices = self.registry.list().await;
        debug!("Device list: {} device(s)", devices.len());
        OpMessage::dev_list(devices)
    }

    /// Import reply for `bus_id` on behalf of `session`
    ///
    /// Every failure is reported through the reply status.
    pub async fn handle_device_import(&self, session: ConnectionId, bus_id: &BusId) -> OpMessage {
        let Some(device) = self.registry.get(bus_id).await else {
            info!("{}: import of unknown device {}", session, bus_id);
            return OpMessage::import_failure(OpStatus::NoDevice);
        };

        let lock = self.device_lock(bus_id).await;
        let _serialized = lock.lock().await;

        match self.check_local_claim(session, bus_id).await {
            LocalClaim::Adopted => {
                info!("{}: imported {} (existing claim)", session, bus_id);
                return OpMessage::import_success(device);
            }
            LocalClaim::Busy(owner) => {
                info!("{}: {} is in use by {}", session, bus_id, owner);
                return OpMessage::import_failure(OpStatus::DeviceBusy);
            }
            LocalClaim::Absent => {}
        }

        let claimed = match self.claimer.claim_device(bus_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                let status = status_for_ipc_error(&e);
                warn!(
                    "{}: claim of {} failed ({:?}), replying {:?}: {}",
                    session,
                    bus_id,
                    e.kind(),
                    status,
                    e
                );
                return OpMessage::import_failure(status);
            }
        };

        // The device may have been unplugged while the claim was in flight
        let Some(device) = self.registry.get(bus_id).await else {
            warn!("{}: {} disappeared during claim, releasing", session, bus_id);
            self.release_quietly(bus_id).await;
            return OpMessage::import_failure(OpStatus::NoDevice);
        };

        {
            let mut table = self.table.lock().await;
            let owner = table.live_sessions.contains(&session).then_some(session);
            table.claims.insert(
                bus_id.clone(),
                SessionClaim {
                    device: claimed.clone(),
                    owner,
                },
            );
        }

        info!(
            "{}: imported {} ({}, {:?})",
            session, bus_id, claimed.device_id, claimed.claim_method
        );
        OpMessage::import_success(device)
    }

    async fn check_local_claim(&self, session: ConnectionId, bus_id: &BusId) -> LocalClaim {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        let Some(claim) = table.claims.get_mut(bus_id) else {
            return LocalClaim::Absent;
        };
        match claim.owner {
            Some(owner) if owner != session && table.live_sessions.contains(&owner) => {
                LocalClaim::Busy(owner)
            }
            _ => {
                claim.owner = Some(session);
                LocalClaim::Adopted
            }
        }
    }

    /// Mark a session live so its imports take ownership of their claims
    pub async fn handle_connection_opened(&self, session: ConnectionId) {
        self.table.lock().await.live_sessions.insert(session);
    }

    /// Detach the claims of a closed session
    ///
    /// The claims stay in place for the next importer. Returns how many
    /// claims were detached.
    pub async fn handle_connection_closed(&self, session: ConnectionId) -> usize {
        let mut table = self.table.lock().await;
        table.live_sessions.remove(&session);

        let mut detached = 0;
        for (bus_id, claim) in table.claims.iter_mut() {
            if claim.owner == Some(session) {
                claim.owner = None;
                detached += 1;
                debug!("{}: detached from {}", session, bus_id);
            }
        }
        if detached > 0 {
            info!("{}: closed, {} claim(s) kept for reuse", session, detached);
        }
        detached
    }

    /// Apply a device hot-plug event
    pub async fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Added { device } => {
                let bus_id = device.bus_id.clone();
                if self.registry.upsert(device).await {
                    info!("Device {} added", bus_id);
                } else {
                    debug!("Device {} refreshed", bus_id);
                }
            }
            DeviceEvent::Removed { bus_id } => {
                if self.registry.remove(&bus_id).await.is_none() {
                    return;
                }
                info!("Device {} removed", bus_id);

                let lock = self.device_lock(&bus_id).await;
                let _serialized = lock.lock().await;
                let removed = self.table.lock().await.claims.remove(&bus_id);
                if let Some(claim) = removed {
                    info!(
                        "Dropping claim {} of removed device",
                        claim.device.device_id
                    );
                    self.release_quietly(&bus_id).await;
                }
            }
        }
    }

    /// Apply hot-plug events until the feed closes
    pub async fn watch_devices(self: Arc<Self>, events: async_channel::Receiver<DeviceEvent>) {
        while let Ok(event) = events.recv().await {
            self.handle_device_event(event).await;
        }
        debug!("Device event feed closed");
    }

    /// Release every claim at the claimer, returning how many were held
    pub async fn release_all(&self) -> usize {
        let claims: Vec<BusId> = self.table.lock().await.claims.drain().map(|(k, _)| k).collect();
        for bus_id in &claims {
            self.release_quietly(bus_id).await;
        }
        if !claims.is_empty() {
            info!("Released {} claim(s)", claims.len());
        }
        claims.len()
    }

    /// Claims currently held, sorted by bus id
    pub async fn claims(&self) -> Vec<SessionClaim> {
        let mut claims: Vec<_> = self.table.lock().await.claims.values().cloned().collect();
        claims.sort_by(|a, b| a.device.bus_id.as_str().cmp(b.device.bus_id.as_str()));
        claims
    }

    pub async fn claim_for(&self, bus_id: &BusId) -> Option<SessionClaim> {
        self.table.lock().await.claims.get(bus_id).cloned()
    }

    /// Release at the claimer, logging instead of failing
    async fn release_quietly(&self, bus_id: &BusId) {
        match self.claimer.release_device(bus_id).await {
            Ok(true) => debug!("Released {} at the claimer", bus_id),
            Ok(false) => debug!("{} was not claimed at the claimer", bus_id),
            Err(e) => error!("Failed to release {}: {}", bus_id, e),
        }
    }

    async fn device_lock(&self, bus_id: &BusId) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .await
            .entry(bus_id.clone())
            .or_default()
            .clone()
    }
}

/// USB/IP status reported for a failed claim
pub fn status_for_ipc_error(error: &IpcError) -> OpStatus {
    if let IpcError::MessageTooLarge { .. } = error {
        return OpStatus::Error;
    }
    match error.kind() {
        IpcErrorKind::Authentication | IpcErrorKind::Unavailable => OpStatus::NotAvailable,
        IpcErrorKind::Conflict | IpcErrorKind::ResourceExhausted => OpStatus::DeviceBusy,
        IpcErrorKind::NotFound => OpStatus::NoDevice,
        IpcErrorKind::Timeout | IpcErrorKind::Device => OpStatus::DeviceError,
        IpcErrorKind::Protocol => OpStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_ipc_error_status_mapping() {
        let bus_id = BusId::new("1-1");
        let cases = [
            (
                IpcError::AuthenticationFailed {
                    client_id: "usbipd".into(),
                },
                OpStatus::NotAvailable,
            ),
            (IpcError::ServiceStopped, OpStatus::NotAvailable),
            (
                IpcError::Timeout {
                    request_id: Uuid::new_v4(),
                    timeout: Duration::from_secs(1),
                },
                OpStatus::DeviceError,
            ),
            (
                IpcError::PendingLimitExceeded { limit: 4 },
                OpStatus::DeviceBusy,
            ),
            (
                IpcError::MessageTooLarge {
                    size: 2048,
                    max: 1024,
                },
                OpStatus::Error,
            ),
            (
                IpcError::AlreadyClaimed {
                    bus_id: bus_id.clone(),
                    owner: "other".into(),
                },
                OpStatus::DeviceBusy,
            ),
            (IpcError::DeviceNotFound(bus_id.clone()), OpStatus::NoDevice),
            (
                IpcError::ClaimFailed {
                    bus_id,
                    reason: "busy".into(),
                },
                OpStatus::DeviceError,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(status_for_ipc_error(&error), expected, "{}", error);
        }
    }
}
