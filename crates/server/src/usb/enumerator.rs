//! libusb device enumeration
//!
//! Builds [`ExportedDevice`] snapshots from the host's USB topology and polls
//! for changes on a dedicated OS thread. Differences between consecutive
//! scans are published as [`DeviceEvent`]s through a [`DeviceEventHub`].

use super::DeviceSource;
use async_channel::Receiver;
use common::{DeviceEvent, DeviceEventHub};
use protocol::{BusId, DeviceSpeed, ExportedDevice, InterfaceInfo};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Linux Foundation vendor id, used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// USB hub device class
const HUB_CLASS: u8 = 0x09;

/// Device source backed by libusb
pub struct RusbDeviceSource {
    context: Context,
    filters: Vec<String>,
    hub: DeviceEventHub,
    stop: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RusbDeviceSource {
    /// Open a libusb context; `filters` are validated `VID:PID` patterns
    pub fn new(filters: Vec<String>) -> common::Result<Self> {
        let context = Context::new().map_err(usb_error)?;
        Ok(Self {
            context,
            filters,
            hub: DeviceEventHub::default(),
            stop: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        })
    }

    /// Start the polling thread; a second call is a no-op
    pub fn start_polling(&self, interval: Duration) -> common::Result<()> {
        let mut poller = self
            .poller
            .lock()
            .map_err(|e| common::Error::Usb(format!("poller slot poisoned: {}", e)))?;
        if poller.is_some() {
            return Ok(());
        }

        let initial = enumerate(&self.context, &self.filters).map_err(usb_error)?;
        let context = self.context.clone();
        let filters = self.filters.clone();
        let publisher = self.hub.publisher();
        let stop = self.stop.clone();

        let handle = std::thread::Builder::new()
            .name("usb-poll".to_string())
            .spawn(move || {
                info!("USB polling thread started ({:?} interval)", interval);
                let mut known = initial;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    let current = match enumerate(&context, &filters) {
                        Ok(current) => current,
                        Err(e) => {
                            warn!("USB enumeration failed: {}", e);
                            continue;
                        }
                    };
                    for event in diff_snapshots(&known, &current) {
                        if let Err(e) = publisher.publish_blocking(event) {
                            error!("Failed to publish device event: {}", e);
                        }
                    }
                    known = current;
                }
                info!("USB polling thread stopped");
            })
            .map_err(common::Error::Io)?;

        *poller = Some(handle);
        Ok(())
    }

    /// Stop the polling thread and wait for it to exit
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.poller.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("USB polling thread panicked");
        }
    }
}

impl Drop for RusbDeviceSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DeviceSource for RusbDeviceSource {
    fn list_devices(&self) -> common::Result<Vec<ExportedDevice>> {
        enumerate(&self.context, &self.filters).map_err(usb_error)
    }

    fn subscribe(&self) -> common::Result<Receiver<DeviceEvent>> {
        self.hub.subscribe()
    }
}

fn usb_error(e: rusb::Error) -> common::Error {
    common::Error::Usb(e.to_string())
}

/// USB/IP bus id of a device: bus number, then the port chain ("1-1.2")
pub fn bus_id_of(bus_number: u8, ports: &[u8]) -> BusId {
    let chain: Vec<String> = ports.iter().map(u8::to_string).collect();
    BusId::new(format!("{}-{}", bus_number, chain.join(".")))
}

/// Whether a VID/PID pair passes the configured filters (empty = all)
pub fn matches_filters(vendor_id: u16, product_id: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((vid, pid)) = filter.split_once(':') else {
            return false;
        };
        field_matches(vid, vendor_id) && field_matches(pid, product_id)
    })
}

fn field_matches(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16)
        .map(|v| v == value)
        .unwrap_or(false)
}

/// Snapshot every exportable device
pub(crate) fn enumerate<T: UsbContext>(
    context: &T,
    filters: &[String],
) -> Result<Vec<ExportedDevice>, rusb::Error> {
    let mut exported = Vec::new();
    for device in context.devices()?.iter() {
        match export_device(&device, filters) {
            Ok(Some(snapshot)) => exported.push(snapshot),
            Ok(None) => {}
            Err(e) => debug!(
                "Skipping device bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
    exported.sort_by(|a, b| a.bus_id.as_str().cmp(b.bus_id.as_str()));
    trace!("Enumerated {} exportable device(s)", exported.len());
    Ok(exported)
}

/// Build a device snapshot; `None` for root hubs and filtered devices
fn export_device<T: UsbContext>(
    device: &Device<T>,
    filters: &[String],
) -> Result<Option<ExportedDevice>, rusb::Error> {
    let descriptor = device.device_descriptor()?;

    // Root hubs cannot be exported over USB/IP
    if descriptor.vendor_id() == ROOT_HUB_VENDOR_ID && descriptor.class_code() == HUB_CLASS {
        return Ok(None);
    }
    if !matches_filters(descriptor.vendor_id(), descriptor.product_id(), filters) {
        return Ok(None);
    }

    let ports = device.port_numbers()?;
    if ports.is_empty() {
        return Ok(None);
    }
    let bus_id = bus_id_of(device.bus_number(), &ports);

    // Unconfigured devices have no active configuration
    let (configuration_value, interfaces) = match device.active_config_descriptor() {
        Ok(config) => {
            let interfaces = config
                .interfaces()
                .filter_map(|interface| interface.descriptors().next())
                .map(|alt| InterfaceInfo {
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                })
                .collect::<Vec<_>>();
            (config.number(), interfaces)
        }
        Err(_) => (0, Vec::new()),
    };

    let version = descriptor.device_version();
    let device_release = (u16::from(version.major() / 10) << 12)
        | (u16::from(version.major() % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor());

    Ok(Some(ExportedDevice {
        path: format!("/sys/bus/usb/devices/{}", bus_id),
        bus_id,
        bus_number: u32::from(device.bus_number()),
        device_number: u32::from(device.address()),
        speed: map_device_speed(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_release,
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value,
        configuration_count: descriptor.num_configurations(),
        interface_count: interfaces.len().min(u8::MAX as usize) as u8,
        interfaces,
    }))
}

/// Map rusb device speed to the USB/IP speed code
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Events turning the `previous` scan into the `current` one
///
/// Removals come first so a device that moved ports is seen leaving before
/// it arrives again.
pub(crate) fn diff_snapshots(
    previous: &[ExportedDevice],
    current: &[ExportedDevice],
) -> Vec<DeviceEvent> {
    let before: HashMap<&BusId, &ExportedDevice> =
        previous.iter().map(|d| (&d.bus_id, d)).collect();
    let after: HashMap<&BusId, &ExportedDevice> = current.iter().map(|d| (&d.bus_id, d)).collect();

    let removed = previous
        .iter()
        .filter(|d| !after.contains_key(&d.bus_id))
        .map(|d| DeviceEvent::Removed {
            bus_id: d.bus_id.clone(),
        });
    let added = current
        .iter()
        .filter(|d| before.get(&d.bus_id).copied() != Some(d))
        .map(|d| DeviceEvent::Added { device: d.clone() });

    removed.chain(added).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_device_list, create_mock_exported_device};

    #[test]
    fn test_bus_id_format() {
        assert_eq!(bus_id_of(1, &[1]).as_str(), "1-1");
        assert_eq!(bus_id_of(3, &[2, 4, 1]).as_str(), "3-2.4.1");
    }

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1234:0x5678".to_string(), // Exact match
            "0xABCD:*".to_string(),      // Wildcard PID
        ];

        assert!(matches_filters(0x1234, 0x5678, &filters));
        assert!(matches_filters(0xABCD, 0x1111, &filters));
        assert!(matches_filters(0xABCD, 0x9999, &filters));

        assert!(!matches_filters(0x1234, 0x9999, &filters)); // Wrong PID
        assert!(!matches_filters(0x9999, 0x5678, &filters)); // Wrong VID

        // Empty filters = allow all
        assert!(matches_filters(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_diff_snapshots() {
        let previous = create_mock_device_list(3);
        let mut current = previous.clone();
        current.remove(0);
        current[0].device_release = 0x0200;
        current.push(create_mock_exported_device("2-1", 1, 1));

        let events = diff_snapshots(&previous, &current);
        let summary: Vec<_> = events
            .iter()
            .map(|e| match e {
                DeviceEvent::Added { device } => format!("+{}", device.bus_id),
                DeviceEvent::Removed { bus_id } => format!("-{}", bus_id),
            })
            .collect();
        assert_eq!(summary, vec!["-1-1", "+1-2", "+2-1"]);
    }

    #[test]
    fn test_diff_of_identical_scans_is_empty() {
        let devices = create_mock_device_list(2);
        assert!(diff_snapshots(&devices, &devices).is_empty());
    }
}
