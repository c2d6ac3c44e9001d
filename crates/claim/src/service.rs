//! Claim registry at the privileged claimer
//!
//! [`ClaimService`] is the only place a [`ClaimedDevice`] is created. It
//! keeps at most one claim per bus id, records a bounded history and
//! delegates the hardware work to a [`ClaimBackend`].

use crate::error::IpcFailure;
use crate::message::{ClaimAction, ClaimHistoryEntry, ClaimMethod, ClaimState, ClaimedDevice};
use chrono::{DateTime, Utc};
use protocol::BusId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Device details returned by a successful hardware claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimGrant {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub method: ClaimMethod,
}

/// Hardware claim failures
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device not present")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

/// Hardware side of claiming a device
///
/// Calls are blocking and run on the blocking thread pool.
pub trait ClaimBackend: Send + Sync + 'static {
    /// Take exclusive access to the device at `bus_id`
    fn claim(&self, bus_id: &BusId) -> Result<ClaimGrant, BackendError>;

    /// Hand the device back to the host
    fn release(&self, bus_id: &BusId) -> Result<(), BackendError>;
}

struct ClaimRecord {
    device: ClaimedDevice,
    owner: String,
}

/// Exclusive claim registry
pub struct ClaimService {
    name: String,
    backend: Arc<dyn ClaimBackend>,
    claims: Mutex<HashMap<BusId, ClaimRecord>>,
    device_locks: Mutex<HashMap<BusId, Arc<Mutex<()>>>>,
    history: Mutex<VecDeque<ClaimHistoryEntry>>,
    history_limit: usize,
    started_at: DateTime<Utc>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ClaimService {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ClaimBackend>,
        history_limit: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            backend,
            claims: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            started_at: Utc::now(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Claim a device for `owner`
    ///
    /// An owner re-claiming its own device gets the existing claim back.
    /// A claim held by anyone else is a conflict. Work on one bus id is
    /// serialized by its device lock; the registry lock is only held to
    /// read or commit an entry, never across the hardware claim.
    pub async fn claim_device(
        &self,
        owner: &str,
        bus_id: &BusId,
    ) -> Result<ClaimedDevice, IpcFailure> {
        if self.is_shutting_down() {
            return Err(IpcFailure::ShuttingDown);
        }

        let lock = self.device_lock(bus_id).await;
        let _serialized = lock.lock().await;

        if let Some(record) = self.claims.lock().await.get(bus_id) {
            return match record.device.claim_state {
                ClaimState::Claimed if record.owner == owner => {
                    debug!("{} already claimed by '{}', returning existing claim", bus_id, owner);
                    Ok(record.device.clone())
                }
                ClaimState::Claimed => Err(IpcFailure::AlreadyClaimed {
                    bus_id: bus_id.clone(),
                    owner: record.owner.clone(),
                }),
                ClaimState::Releasing | ClaimState::Released => Err(IpcFailure::ClaimFailed {
                    bus_id: bus_id.clone(),
                    reason: "release in progress".to_string(),
                }),
            };
        }

        let backend = self.backend.clone();
        let target = bus_id.clone();
        let grant = tokio::task::spawn_blocking(move || backend.claim(&target))
            .await
            .map_err(|e| IpcFailure::ClaimFailed {
                bus_id: bus_id.clone(),
                reason: format!("claim task failed: {}", e),
            })?
            .map_err(|e| match e {
                BackendError::NotFound => IpcFailure::DeviceNotFound {
                    bus_id: bus_id.clone(),
                },
                BackendError::Failed(reason) => IpcFailure::ClaimFailed {
                    bus_id: bus_id.clone(),
                    reason,
                },
            })?;

        let device = ClaimedDevice {
            device_id: ClaimedDevice::make_device_id(bus_id, grant.vendor_id, grant.product_id),
            bus_id: bus_id.clone(),
            vendor_id: grant.vendor_id,
            product_id: grant.product_id,
            claim_time: Utc::now(),
            claim_method: grant.method,
            claim_state: ClaimState::Claimed,
            device_class: grant.device_class,
            device_subclass: grant.device_subclass,
            device_protocol: grant.device_protocol,
        };
        self.claims.lock().await.insert(
            bus_id.clone(),
            ClaimRecord {
                device: device.clone(),
                owner: owner.to_string(),
            },
        );

        info!("Claimed {} for '{}' ({:?})", device.device_id, owner, device.claim_method);
        self.record_history(ClaimAction::Claimed, owner, device.clone())
            .await;
        Ok(device)
    }

    /// Release `owner`'s claim on a device
    ///
    /// Moves the claim through `Releasing` to `Released` and removes it.
    /// Returns `Ok(false)` when there was nothing to release.
    pub async fn release_device(&self, owner: &str, bus_id: &BusId) -> Result<bool, IpcFailure> {
        let lock = self.device_lock(bus_id).await;
        let _serialized = lock.lock().await;

        let mut device = {
            let mut claims = self.claims.lock().await;
            match claims.get_mut(bus_id) {
                None => return Ok(false),
                Some(record) if record.owner != owner => {
                    return Err(IpcFailure::NotOwner {
                        bus_id: bus_id.clone(),
                        owner: record.owner.clone(),
                    });
                }
                Some(record) if record.device.claim_state != ClaimState::Claimed => {
                    return Ok(false);
                }
                Some(record) => {
                    record.device.claim_state = ClaimState::Releasing;
                    record.device.clone()
                }
            }
        };

        let backend = self.backend.clone();
        let target = bus_id.clone();
        let outcome = match tokio::task::spawn_blocking(move || backend.release(&target)).await {
            Ok(Ok(())) => ClaimAction::Released,
            Ok(Err(e)) => {
                warn!("Hardware release of {} failed: {}", bus_id, e);
                ClaimAction::ReleaseFailed
            }
            Err(e) => {
                warn!("Release task for {} failed: {}", bus_id, e);
                ClaimAction::ReleaseFailed
            }
        };

        device.claim_state = ClaimState::Released;
        self.claims.lock().await.remove(bus_id);

        info!("Released {} for '{}'", device.device_id, owner);
        self.record_history(outcome, owner, device).await;
        Ok(true)
    }

    /// Release every claim regardless of owner
    pub async fn release_all(&self) -> usize {
        let held: Vec<(String, BusId)> = self
            .claims
            .lock()
            .await
            .iter()
            .map(|(bus_id, record)| (record.owner.clone(), bus_id.clone()))
            .collect();

        let mut released = 0;
        for (owner, bus_id) in held {
            if let Ok(true) = self.release_device(&owner, &bus_id).await {
                released += 1;
            }
        }
        released
    }

    /// Current claims ordered by bus id
    pub async fn claimed_devices(&self) -> Vec<ClaimedDevice> {
        let mut devices: Vec<ClaimedDevice> = self
            .claims
            .lock()
            .await
            .values()
            .map(|record| record.device.clone())
            .collect();
        devices.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        devices
    }

    pub async fn claim_count(&self) -> usize {
        self.claims.lock().await.len()
    }

    /// Most recent history entries, oldest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<ClaimHistoryEntry> {
        let history = self.history.lock().await;
        let take = limit.unwrap_or(history.len()).min(history.len());
        history.iter().skip(history.len() - take).cloned().collect()
    }

    /// Stop accepting claims and wake shutdown waiters
    pub fn request_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Claim service '{}' shutting down", self.name);
            self.shutdown_tx.send_replace(true);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    async fn device_lock(&self, bus_id: &BusId) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .await
            .entry(bus_id.clone())
            .or_default()
            .clone()
    }

    async fn record_history(&self, action: ClaimAction, client_id: &str, device: ClaimedDevice) {
        let mut history = self.history.lock().await;
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(ClaimHistoryEntry {
            timestamp: Utc::now(),
            action,
            client_id: client_id.to_string(),
            device,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticClaimBackend;
    use std::time::{Duration, Instant};

    fn service(history_limit: usize) -> (ClaimService, Arc<StaticClaimBackend>) {
        let backend = Arc::new(StaticClaimBackend::with_devices(["1-1", "1-2", "2-1"]));
        (
            ClaimService::new("test-claimer", backend.clone(), history_limit),
            backend,
        )
    }

    #[tokio::test]
    async fn test_claim_and_reclaim_same_owner() {
        let (service, backend) = service(16);
        let bus_id = BusId::new("1-1");

        let first = service.claim_device("usbipd", &bus_id).await.unwrap();
        let second = service.claim_device("usbipd", &bus_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.claim_calls(), 1);
        assert_eq!(service.claim_count().await, 1);
    }

    #[tokio::test]
    async fn test_other_owner_conflicts() {
        let (service, _) = service(16);
        let bus_id = BusId::new("1-2");

        service.claim_device("usbipd", &bus_id).await.unwrap();
        let result = service.claim_device("other", &bus_id).await;

        assert!(matches!(
            result,
            Err(IpcFailure::AlreadyClaimed { ref owner, .. }) if owner == "usbipd"
        ));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (service, _) = service(16);
        let result = service.claim_device("usbipd", &BusId::new("9-9")).await;
        assert!(matches!(result, Err(IpcFailure::DeviceNotFound { .. })));
        assert_eq!(service.claim_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_records_transition() {
        let (service, backend) = service(16);
        let bus_id = BusId::new("2-1");

        service.claim_device("usbipd", &bus_id).await.unwrap();
        assert!(service.release_device("usbipd", &bus_id).await.unwrap());
        assert!(!service.release_device("usbipd", &bus_id).await.unwrap());

        assert_eq!(backend.release_calls(), 1);
        assert!(service.claimed_devices().await.is_empty());

        let history = service.history(None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, ClaimAction::Claimed);
        assert_eq!(history[1].action, ClaimAction::Released);
        assert_eq!(history[1].device.claim_state, ClaimState::Released);
    }

    #[tokio::test]
    async fn test_release_by_non_owner_rejected() {
        let (service, _) = service(16);
        let bus_id = BusId::new("1-1");

        service.claim_device("usbipd", &bus_id).await.unwrap();
        let result = service.release_device("intruder", &bus_id).await;
        assert!(matches!(result, Err(IpcFailure::NotOwner { .. })));
        assert_eq!(service.claim_count().await, 1);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let (service, _) = service(3);
        let bus_id = BusId::new("1-1");

        for _ in 0..3 {
            service.claim_device("usbipd", &bus_id).await.unwrap();
            service.release_device("usbipd", &bus_id).await.unwrap();
        }

        let history = service.history(None).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].action, ClaimAction::Released);
        assert_eq!(service.history(Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_blocks_new_claims() {
        let (service, _) = service(16);
        service.claim_device("usbipd", &BusId::new("1-1")).await.unwrap();

        service.request_shutdown();
        service.wait_for_shutdown().await;

        let result = service.claim_device("usbipd", &BusId::new("1-2")).await;
        assert!(matches!(result, Err(IpcFailure::ShuttingDown)));
        assert_eq!(service.release_all().await, 1);
        assert_eq!(service.claim_count().await, 0);
    }

    #[tokio::test]
    async fn test_claims_of_different_devices_overlap() {
        let (service, backend) = service(16);
        let delay = Duration::from_millis(400);
        backend.set_claim_delay(delay);

        let bus_a = BusId::new("1-1");
        let bus_b = BusId::new("1-2");
        let started = Instant::now();
        let (first, second) = tokio::join!(
            service.claim_device("usbipd", &bus_a),
            service.claim_device("usbipd", &bus_b),
        );
        let elapsed = started.elapsed();

        first.unwrap();
        second.unwrap();
        assert!(elapsed < delay * 3 / 2, "claims ran one after another: {:?}", elapsed);
        assert_eq!(service.claim_count().await, 2);
    }

    #[tokio::test]
    async fn test_status_answers_while_claim_in_flight() {
        let (service, backend) = service(16);
        let delay = Duration::from_millis(400);
        service.claim_device("usbipd", &BusId::new("2-1")).await.unwrap();
        backend.set_claim_delay(delay);

        let status = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let asked = Instant::now();
            let count = service.claim_count().await;
            let devices = service.claimed_devices().await;
            (count, devices.len(), asked.elapsed())
        };
        let bus = BusId::new("1-1");
        let (claimed, (count, listed, waited)) =
            tokio::join!(service.claim_device("usbipd", &bus), status);

        claimed.unwrap();
        assert_eq!(count, 1);
        assert_eq!(listed, 1);
        assert!(waited < Duration::from_millis(100), "status waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_duplicate_claim_during_claim_conflicts() {
        let (service, backend) = service(16);
        backend.set_claim_delay(Duration::from_millis(200));
        let bus_id = BusId::new("1-2");

        let (first, second) = tokio::join!(
            service.claim_device("usbipd", &bus_id),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                service.claim_device("other", &bus_id).await
            },
        );

        first.unwrap();
        assert!(matches!(second, Err(IpcFailure::AlreadyClaimed { .. })));
        assert_eq!(backend.claim_calls(), 1);
    }
}
