//! USB/IP protocol version handling

use crate::error::{ProtocolError, Result};

/// USB/IP protocol version spoken by the Linux vhci-hcd userland (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Validate the version field of an operation header
pub fn validate_version(version: u16) -> Result<()> {
    if version != USBIP_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            expected: USBIP_VERSION,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_accepted() {
        assert!(validate_version(USBIP_VERSION).is_ok());
    }

    #[test]
    fn test_other_versions_rejected() {
        for version in [0x0000, 0x0100, 0x0106, 0x0112, 0xFFFF] {
            let result = validate_version(version);
            assert!(matches!(
                result,
                Err(ProtocolError::UnsupportedVersion { version: v, .. }) if v == version
            ));
        }
    }
}
