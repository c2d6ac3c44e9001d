//! Test utilities for rust-usbip
//!
//! Provides mock device records and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_exported_device;
//!
//! let device = create_mock_exported_device("1-1", 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.bus_id.as_str(), "1-1");
//! ```

use protocol::{BusId, DeviceSpeed, ExportedDevice, InterfaceInfo};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock ExportedDevice for testing
///
/// Bus and device numbers are derived from the bus id ("2-3" gives bus 2,
/// device 3); the device has a single vendor-specific interface.
pub fn create_mock_exported_device(bus_id: &str, vendor_id: u16, product_id: u16) -> ExportedDevice {
    create_mock_exported_device_with_class(bus_id, vendor_id, product_id, 0x00, 0x00, 0x00)
}

/// Create a mock ExportedDevice with specific USB class
///
/// The class triple is applied to both the device and its only interface,
/// except that a device class of 0 leaves the interface vendor-specific.
pub fn create_mock_exported_device_with_class(
    bus_id: &str,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> ExportedDevice {
    let (bus_number, device_number) = parse_bus_id(bus_id);
    let interface = if class == 0 {
        InterfaceInfo {
            class: 0xFF,
            subclass: 0x00,
            protocol: 0x00,
        }
    } else {
        InterfaceInfo {
            class,
            subclass,
            protocol,
        }
    };

    ExportedDevice {
        path: format!("/sys/bus/usb/devices/{}", bus_id),
        bus_id: BusId::new(bus_id),
        bus_number,
        device_number,
        speed: DeviceSpeed::High,
        vendor_id,
        product_id,
        device_release: 0x0100,
        device_class: class,
        device_subclass: subclass,
        device_protocol: protocol,
        configuration_value: 1,
        configuration_count: 1,
        interface_count: 1,
        interfaces: vec![interface],
    }
}

/// Create a mock mass storage device
pub fn create_mock_mass_storage_device(bus_id: &str) -> ExportedDevice {
    create_mock_exported_device_with_class(bus_id, 0x0781, 0x5581, 0x08, 0x06, 0x50)
}

/// Create a mock HID device (keyboard/mouse)
pub fn create_mock_hid_device(bus_id: &str) -> ExportedDevice {
    create_mock_exported_device_with_class(bus_id, 0x046d, 0xc52b, 0x03, 0x01, 0x02)
}

/// Create a list of mock devices on bus 1 ("1-1", "1-2", ...)
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(3);
/// assert_eq!(devices[2].bus_id.as_str(), "1-3");
/// ```
pub fn create_mock_device_list(count: u32) -> Vec<ExportedDevice> {
    (1..=count)
        .map(|i| {
            create_mock_exported_device(
                &format!("1-{}", i),
                0x1000 + (i as u16),
                0x2000 + (i as u16),
            )
        })
        .collect()
}

fn parse_bus_id(bus_id: &str) -> (u32, u32) {
    let mut parts = bus_id.split('-');
    let bus = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let dev = parts
        .next()
        .and_then(|s| s.split('.').next_back())
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    (bus, dev)
}

/// Split `bytes` into random chunks of 1..=`max_chunk` bytes
///
/// Used to exercise stream decoders against arbitrary read boundaries.
pub fn split_randomly(bytes: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::rng();
    let max_chunk = max_chunk.max(1);
    let mut chunks = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let len = rng.random_range(1..=max_chunk.min(rest.len()));
        let (head, tail) = rest.split_at(len);
        chunks.push(head.to_vec());
        rest = tail;
    }
    chunks
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_exported_device() {
        let device = create_mock_exported_device("2-3", 0x1234, 0x5678);

        assert_eq!(device.bus_id.as_str(), "2-3");
        assert_eq!(device.bus_number, 2);
        assert_eq!(device.device_number, 3);
        assert_eq!(device.interface_count as usize, device.interfaces.len());
    }

    #[test]
    fn test_nested_hub_port_bus_id() {
        let device = create_mock_exported_device("1-4.2", 0x1234, 0x5678);
        assert_eq!(device.bus_number, 1);
        assert_eq!(device.device_number, 2);
    }

    #[test]
    fn test_create_mock_device_list() {
        let devices = create_mock_device_list(10);

        assert_eq!(devices.len(), 10);

        let ids: std::collections::HashSet<_> = devices.iter().map(|d| d.bus_id.clone()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_create_mock_mass_storage_device() {
        let device = create_mock_mass_storage_device("1-1");

        assert_eq!(device.device_class, 0x08); // Mass Storage
        assert_eq!(device.interfaces[0].subclass, 0x06); // SCSI
        assert_eq!(device.interfaces[0].protocol, 0x50); // Bulk-Only
    }

    #[test]
    fn test_split_randomly_preserves_bytes() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks = split_randomly(&data, 7);

        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 7));
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
