//! USB/IP device and status types
//!
//! This module defines the device records advertised to USB/IP clients,
//! the bus identifier used to address them, and the status codes carried in
//! operation replies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the fixed sysfs path field in a device record
pub const PATH_SIZE: usize = 256;

/// Width of the fixed bus id field
pub const BUS_ID_SIZE: usize = 32;

/// Bus identifier locating a device in the host's USB topology (e.g. "1-1.2")
///
/// On the wire this is a fixed 32-byte, null-terminated field, so at most 31
/// bytes of the id are carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(String);

impl BusId {
    /// Create a bus id from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the bus id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode to the fixed-width wire field, truncating to 31 bytes
    pub fn to_wire(&self) -> [u8; BUS_ID_SIZE] {
        fixed_field(&self.0)
    }

    /// Decode from a wire field, stopping at the first NUL byte
    pub fn from_wire(field: &[u8]) -> Self {
        Self(trim_nul(field))
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BusId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Copy `text` into a zeroed array of width `N`
///
/// The last byte is always NUL. Longer text is cut at the last character
/// boundary that fits.
pub(crate) fn fixed_field<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let mut len = text.len().min(N.saturating_sub(1));
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}

/// Read a null-padded field as a string
pub(crate) fn trim_nul(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// USB device speed (Linux `enum usb_device_speed`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpeed {
    /// Speed not reported by the host
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// Wireless USB
    Wireless,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    /// Wire code of this speed
    pub fn code(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Wireless => 4,
            DeviceSpeed::Super => 5,
            DeviceSpeed::SuperPlus => 6,
        }
    }

    /// Parse a wire code, `None` for codes outside the kernel enum
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DeviceSpeed::Unknown),
            1 => Some(DeviceSpeed::Low),
            2 => Some(DeviceSpeed::Full),
            3 => Some(DeviceSpeed::High),
            4 => Some(DeviceSpeed::Wireless),
            5 => Some(DeviceSpeed::Super),
            6 => Some(DeviceSpeed::SuperPlus),
            _ => None,
        }
    }
}

/// Interface class triple advertised in a device-list reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// USB interface class
    pub class: u8,
    /// USB interface subclass
    pub subclass: u8,
    /// USB interface protocol
    pub protocol: u8,
}

/// Descriptive record for one USB device as exposed to clients
///
/// Immutable snapshot produced by the device-enumeration backend. The
/// `interfaces` list is only transmitted in device-list replies; import
/// replies carry the record alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDevice {
    /// Sysfs path of the device on the exporting host
    pub path: String,
    /// Bus id used by clients to import the device
    pub bus_id: BusId,
    /// USB bus number
    pub bus_number: u32,
    /// Device number on the bus
    pub device_number: u32,
    /// Negotiated device speed
    pub speed: DeviceSpeed,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub device_release: u16,
    /// USB device class
    pub device_class: u8,
    /// USB device subclass
    pub device_subclass: u8,
    /// USB device protocol
    pub device_protocol: u8,
    /// Currently active configuration value
    pub configuration_value: u8,
    /// Number of configurations
    pub configuration_count: u8,
    /// Number of interfaces in the active configuration
    pub interface_count: u8,
    /// Interface class triples of the active configuration
    pub interfaces: Vec<InterfaceInfo>,
}

/// Status code carried in operation replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    /// Request completed
    Ok,
    /// Device is not available to this client
    NotAvailable,
    /// Device is busy (claimed by someone else)
    DeviceBusy,
    /// Device is in an error state
    DeviceError,
    /// Device not found
    NoDevice,
    /// Unexpected server error
    Error,
    /// Status code this codec does not name
    Unknown(u32),
}

impl OpStatus {
    /// Wire code of this status
    pub fn code(self) -> u32 {
        match self {
            OpStatus::Ok => 0,
            OpStatus::NotAvailable => 1,
            OpStatus::DeviceBusy => 2,
            OpStatus::DeviceError => 3,
            OpStatus::NoDevice => 4,
            OpStatus::Error => 5,
            OpStatus::Unknown(code) => code,
        }
    }

    /// Parse a wire status code
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => OpStatus::Ok,
            1 => OpStatus::NotAvailable,
            2 => OpStatus::DeviceBusy,
            3 => OpStatus::DeviceError,
            4 => OpStatus::NoDevice,
            5 => OpStatus::Error,
            other => OpStatus::Unknown(other),
        }
    }

    /// Whether this is the success status
    pub fn is_ok(self) -> bool {
        self == OpStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_id_wire_padding() {
        let bus_id = BusId::new("1-1.2");
        let wire = bus_id.to_wire();

        assert_eq!(&wire[..5], b"1-1.2");
        assert!(wire[5..].iter().all(|b| *b == 0));
        assert_eq!(BusId::from_wire(&wire), bus_id);
    }

    #[test]
    fn test_bus_id_truncated_to_width() {
        let long = "9".repeat(40);
        let wire = BusId::new(long).to_wire();

        assert_eq!(wire.len(), BUS_ID_SIZE);
        assert_eq!(BusId::from_wire(&wire).as_str(), "9".repeat(31));
    }

    #[test]
    fn test_bus_id_of_full_width_keeps_terminator() {
        let wire = BusId::new("8".repeat(BUS_ID_SIZE)).to_wire();

        assert_eq!(wire[BUS_ID_SIZE - 1], 0);
        assert_eq!(BusId::from_wire(&wire).as_str(), "8".repeat(BUS_ID_SIZE - 1));
    }

    #[test]
    fn test_bus_id_truncated_on_char_boundary() {
        // 30 ASCII bytes then a 3-byte character straddling the 31-byte limit
        let id = format!("{}\u{20ac}", "7".repeat(30));
        let wire = BusId::new(id).to_wire();

        assert!(wire[30..].iter().all(|b| *b == 0));
        assert_eq!(BusId::from_wire(&wire).as_str(), "7".repeat(30));
    }

    #[test]
    fn test_speed_codes() {
        for code in 0..=6 {
            let speed = DeviceSpeed::from_code(code).unwrap();
            assert_eq!(speed.code(), code);
        }
        assert_eq!(DeviceSpeed::from_code(7), None);
    }

    #[test]
    fn test_status_codes() {
        assert!(OpStatus::from_code(0).is_ok());
        assert_eq!(OpStatus::from_code(4), OpStatus::NoDevice);
        assert_eq!(OpStatus::from_code(99), OpStatus::Unknown(99));
        assert_eq!(OpStatus::Unknown(99).code(), 99);
        assert_eq!(OpStatus::DeviceBusy.code(), 2);
    }
}
