//! In-memory claim backend for tests and dry runs

use crate::message::ClaimMethod;
use crate::service::{BackendError, ClaimBackend, ClaimGrant};
use protocol::BusId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Backend over a fixed device table
///
/// Counts calls, can delay claims to widen race windows, and can be told to
/// fail releases.
#[derive(Default)]
pub struct StaticClaimBackend {
    devices: Mutex<HashMap<BusId, ClaimGrant>>,
    failing_releases: Mutex<HashSet<BusId>>,
    claim_delay: Mutex<Option<Duration>>,
    claim_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl StaticClaimBackend {
    /// Backend knowing one HID-class device per bus id
    pub fn with_devices<I, S>(bus_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<BusId>,
    {
        let backend = Self::default();
        for (i, bus_id) in bus_ids.into_iter().enumerate() {
            backend.add_device(
                bus_id.into(),
                ClaimGrant {
                    vendor_id: 0x1000 + i as u16,
                    product_id: 0x2000 + i as u16,
                    device_class: 0x03,
                    device_subclass: 0x00,
                    device_protocol: 0x00,
                    method: ClaimMethod::DriverDetach,
                },
            );
        }
        backend
    }

    pub fn add_device(&self, bus_id: BusId, grant: ClaimGrant) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(bus_id, grant);
        }
    }

    pub fn remove_device(&self, bus_id: &BusId) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.remove(bus_id);
        }
    }

    /// Sleep this long inside every claim
    pub fn set_claim_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.claim_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Make releases of `bus_id` fail
    pub fn fail_release(&self, bus_id: BusId) {
        if let Ok(mut failing) = self.failing_releases.lock() {
            failing.insert(bus_id);
        }
    }

    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

impl ClaimBackend for StaticClaimBackend {
    fn claim(&self, bus_id: &BusId) -> Result<ClaimGrant, BackendError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.claim_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.devices
            .lock()
            .map_err(|_| BackendError::Failed("device table poisoned".into()))?
            .get(bus_id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn release(&self, bus_id: &BusId) -> Result<(), BackendError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_releases
            .lock()
            .map(|f| f.contains(bus_id))
            .unwrap_or(false);
        if failing {
            return Err(BackendError::Failed(format!(
                "cannot reattach kernel driver to {}",
                bus_id
            )));
        }
        Ok(())
    }
}
