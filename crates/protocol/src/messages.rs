//! USB/IP operation messages
//!
//! Operation messages are exchanged before a device is attached:
//! - Discovery (`OP_REQ_DEVLIST` / `OP_REP_DEVLIST`)
//! - Import (`OP_REQ_IMPORT` / `OP_REP_IMPORT`)
//!
//! Every message starts with the 8-byte [`OpHeader`].

use crate::types::{BusId, ExportedDevice, OpStatus};
use crate::version::USBIP_VERSION;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Command code: retrieve the list of exported devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply code: list of exported devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Command code: import a remote device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply code: reply to import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command code: query a single device (not implemented)
pub const OP_REQ_DEVINFO: u16 = 0x8002;
/// Reply code: single device info (not implemented)
pub const OP_REP_DEVINFO: u16 = 0x0002;
/// Command code: export a device (not implemented)
pub const OP_REQ_EXPORT: u16 = 0x8006;
/// Reply code: reply to export (not implemented)
pub const OP_REP_EXPORT: u16 = 0x0006;
/// Command code: unexport a device (not implemented)
pub const OP_REQ_UNEXPORT: u16 = 0x8007;
/// Reply code: reply to unexport (not implemented)
pub const OP_REP_UNEXPORT: u16 = 0x0007;

/// USB/IP operation header (8 bytes, big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    /// Protocol version
    pub version: u16,
    /// Command or reply code
    pub command: u16,
    /// Status (0 in requests)
    pub status: u32,
}

impl OpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 8;

    /// Create a header for the current protocol version
    pub fn new(command: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            command,
            status,
        }
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let command = reader.read_u16::<BigEndian>()?;
        let status = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            version,
            command,
            status,
        })
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.command)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// Decoded USB/IP operation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpMessage {
    /// Client asks for the exported device list
    DevListRequest,

    /// Server replies with the exported devices in registry order
    DevListReply {
        /// Reply status
        status: OpStatus,
        /// Exported devices
        devices: Vec<ExportedDevice>,
    },

    /// Client asks to import (attach) a device
    ImportRequest {
        /// Bus id of the requested device
        bus_id: BusId,
    },

    /// Server replies to an import request
    ///
    /// `device` is present exactly when `status` is [`OpStatus::Ok`].
    ImportReply {
        /// Reply status
        status: OpStatus,
        /// Device record on success
        device: Option<ExportedDevice>,
    },
}

impl OpMessage {
    /// Successful device-list reply
    pub fn dev_list(devices: Vec<ExportedDevice>) -> Self {
        OpMessage::DevListReply {
            status: OpStatus::Ok,
            devices,
        }
    }

    /// Successful import reply
    pub fn import_success(device: ExportedDevice) -> Self {
        OpMessage::ImportReply {
            status: OpStatus::Ok,
            device: Some(device),
        }
    }

    /// Failed import reply
    pub fn import_failure(status: OpStatus) -> Self {
        OpMessage::ImportReply {
            status,
            device: None,
        }
    }

    /// Command code of this message
    pub fn command(&self) -> u16 {
        match self {
            OpMessage::DevListRequest => OP_REQ_DEVLIST,
            OpMessage::DevListReply { .. } => OP_REP_DEVLIST,
            OpMessage::ImportRequest { .. } => OP_REQ_IMPORT,
            OpMessage::ImportReply { .. } => OP_REP_IMPORT,
        }
    }

    /// Header written in front of this message
    pub fn header(&self) -> OpHeader {
        let status = match self {
            OpMessage::DevListReply { status, .. } | OpMessage::ImportReply { status, .. } => {
                status.code()
            }
            OpMessage::DevListRequest | OpMessage::ImportRequest { .. } => 0,
        };
        OpHeader::new(self.command(), status)
    }

    /// Whether this message is a client request
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            OpMessage::DevListRequest | OpMessage::ImportRequest { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let header = OpHeader::new(OP_REQ_IMPORT, 0);

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), OpHeader::SIZE);
        assert_eq!(buf, [0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00]);

        let decoded = OpHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_reply_header_carries_status() {
        let reply = OpMessage::import_failure(OpStatus::NoDevice);
        let header = reply.header();

        assert_eq!(header.command, OP_REP_IMPORT);
        assert_eq!(header.status, 4);
        assert!(!reply.is_request());
    }
}
