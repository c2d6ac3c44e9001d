//! USB subsystem
//!
//! Device enumeration and the hardware side of claiming:
//! - [`DeviceSource`]: current exported devices plus a hot-plug event feed
//! - [`RusbDeviceSource`]: enumeration through libusb, polled on a
//!   dedicated thread so the Tokio runtime never blocks on USB I/O
//! - [`StaticDeviceSource`]: fixed device table for tests and dry runs
//! - [`RusbClaimBackend`]: kernel-driver detach and interface claims, used by
//!   the privileged claimer

pub mod backend;
pub mod enumerator;

use async_channel::Receiver;
use common::{DeviceEvent, DeviceEventHub};
use protocol::{BusId, ExportedDevice};
use std::sync::RwLock;

pub use backend::RusbClaimBackend;
pub use enumerator::{RusbDeviceSource, bus_id_of, matches_filters};

/// Device enumeration collaborator
pub trait DeviceSource: Send + Sync {
    /// Devices currently attached, in enumeration order
    fn list_devices(&self) -> common::Result<Vec<ExportedDevice>>;

    /// Feed of device changes from now on
    fn subscribe(&self) -> common::Result<Receiver<DeviceEvent>>;
}

/// Device source over a table the caller edits
#[derive(Default)]
pub struct StaticDeviceSource {
    devices: RwLock<Vec<ExportedDevice>>,
    hub: DeviceEventHub,
}

impl StaticDeviceSource {
    pub fn new(devices: Vec<ExportedDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
            hub: DeviceEventHub::default(),
        }
    }

    /// Plug in (or refresh) a device and notify subscribers
    pub async fn add_device(&self, device: ExportedDevice) -> common::Result<usize> {
        {
            let mut devices = self.write()?;
            match devices.iter_mut().find(|d| d.bus_id == device.bus_id) {
                Some(existing) => *existing = device.clone(),
                None => devices.push(device.clone()),
            }
        }
        self.hub
            .publisher()
            .publish(DeviceEvent::Added { device })
            .await
    }

    /// Unplug a device and notify subscribers
    pub async fn remove_device(&self, bus_id: &BusId) -> common::Result<usize> {
        self.write()?.retain(|d| &d.bus_id != bus_id);
        self.hub
            .publisher()
            .publish(DeviceEvent::Removed {
                bus_id: bus_id.clone(),
            })
            .await
    }

    fn write(&self) -> common::Result<std::sync::RwLockWriteGuard<'_, Vec<ExportedDevice>>> {
        self.devices
            .write()
            .map_err(|e| common::Error::Usb(format!("device table poisoned: {}", e)))
    }
}

impl DeviceSource for StaticDeviceSource {
    fn list_devices(&self) -> common::Result<Vec<ExportedDevice>> {
        self.devices
            .read()
            .map(|d| d.clone())
            .map_err(|e| common::Error::Usb(format!("device table poisoned: {}", e)))
    }

    fn subscribe(&self) -> common::Result<Receiver<DeviceEvent>> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_device_list, create_mock_hid_device};

    #[tokio::test]
    async fn test_static_source_events() {
        let source = StaticDeviceSource::new(create_mock_device_list(2));
        let events = source.subscribe().unwrap();

        assert_eq!(source.add_device(create_mock_hid_device("2-1")).await.unwrap(), 1);
        assert_eq!(source.remove_device(&BusId::new("1-1")).await.unwrap(), 1);

        let Ok(DeviceEvent::Added { device }) = events.recv().await else {
            panic!("Expected Added event");
        };
        assert_eq!(device.bus_id.as_str(), "2-1");
        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent::Removed {
                bus_id: BusId::new("1-1")
            }
        );

        let listed: Vec<_> = source
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.bus_id.to_string())
            .collect();
        assert_eq!(listed, vec!["1-2", "2-1"]);
    }
}
