//! Exported device registry
//!
//! Ordered snapshot of the devices advertised to USB/IP clients. The order is
//! the order devices were first seen, so repeated device-list replies are
//! stable until the host's USB topology changes.

use protocol::{BusId, ExportedDevice};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<ExportedDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `devices`, in the given order
    pub fn with_devices(devices: Vec<ExportedDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Replace the whole registry with a fresh enumeration
    pub async fn replace_all(&self, devices: Vec<ExportedDevice>) {
        let mut current = self.devices.write().await;
        debug!("Registry replaced: {} -> {} devices", current.len(), devices.len());
        *current = devices;
    }

    /// Insert a device or refresh its snapshot in place
    ///
    /// Returns `true` if the bus id was not registered before.
    pub async fn upsert(&self, device: ExportedDevice) -> bool {
        let mut devices = self.devices.write().await;
        match devices.iter_mut().find(|d| d.bus_id == device.bus_id) {
            Some(existing) => {
                *existing = device;
                false
            }
            None => {
                devices.push(device);
                true
            }
        }
    }

    /// Remove a device, returning its last snapshot
    pub async fn remove(&self, bus_id: &BusId) -> Option<ExportedDevice> {
        let mut devices = self.devices.write().await;
        let index = devices.iter().position(|d| &d.bus_id == bus_id)?;
        Some(devices.remove(index))
    }

    pub async fn get(&self, bus_id: &BusId) -> Option<ExportedDevice> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| &d.bus_id == bus_id)
            .cloned()
    }

    /// Snapshot of all devices in registry order
    pub async fn list(&self) -> Vec<ExportedDevice> {
        self.devices.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_device_list, create_mock_exported_device};

    #[tokio::test]
    async fn test_upsert_keeps_position() {
        let registry = DeviceRegistry::with_devices(create_mock_device_list(3));

        let mut refreshed = create_mock_exported_device("1-2", 0xAAAA, 0xBBBB);
        refreshed.device_release = 0x0200;
        assert!(!registry.upsert(refreshed).await);

        let devices = registry.list().await;
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].bus_id.as_str(), "1-2");
        assert_eq!(devices[1].vendor_id, 0xAAAA);
    }

    #[tokio::test]
    async fn test_new_devices_append() {
        let registry = DeviceRegistry::with_devices(create_mock_device_list(2));
        assert!(registry.upsert(create_mock_exported_device("3-1", 1, 2)).await);

        let order: Vec<_> = registry
            .list()
            .await
            .into_iter()
            .map(|d| d.bus_id.to_string())
            .collect();
        assert_eq!(order, vec!["1-1", "1-2", "3-1"]);
    }

    #[tokio::test]
    async fn test_remove_and_get() {
        let registry = DeviceRegistry::with_devices(create_mock_device_list(2));
        let bus_id = BusId::new("1-1");

        assert!(registry.get(&bus_id).await.is_some());
        assert!(registry.remove(&bus_id).await.is_some());
        assert!(registry.get(&bus_id).await.is_none());
        assert!(registry.remove(&bus_id).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_replace_all() {
        let registry = DeviceRegistry::with_devices(create_mock_device_list(4));
        registry.replace_all(Vec::new()).await;
        assert!(registry.is_empty().await);
    }
}
