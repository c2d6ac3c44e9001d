//! USB/IP operation message encoding and decoding
//!
//! This module translates between wire bytes and [`OpMessage`] values. It
//! performs no I/O: encoding writes into a `Vec<u8>`, decoding reads from a
//! borrowed slice.
//!
//! # Frame Format
//!
//! ```text
//! [version: u16][command: u16][status: u32][payload...]
//! ```
//!
//! All integers are big-endian. Payload layout depends on the command:
//! - `OP_REQ_DEVLIST`: empty
//! - `OP_REP_DEVLIST`: `[count: u32]` then `count` device records, each
//!   followed by its 4-byte interface entries
//! - `OP_REQ_IMPORT`: `[busid: 32 bytes]`
//! - `OP_REP_IMPORT`: one device record when status is 0, otherwise empty
//!
//! Length fields are never trusted for allocation: every count is checked
//! against the bytes actually buffered before memory is reserved.

use crate::error::{ProtocolError, Result};
use crate::messages::{
    OP_REP_DEVINFO, OP_REP_DEVLIST, OP_REP_EXPORT, OP_REP_IMPORT, OP_REP_UNEXPORT, OP_REQ_DEVINFO,
    OP_REQ_DEVLIST, OP_REQ_EXPORT, OP_REQ_IMPORT, OP_REQ_UNEXPORT, OpHeader, OpMessage,
};
use crate::types::{
    BUS_ID_SIZE, BusId, DeviceSpeed, ExportedDevice, InterfaceInfo, OpStatus, PATH_SIZE,
    fixed_field, trim_nul,
};
use crate::version::validate_version;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BytesMut};
use std::io::{Read, Write};

/// Maximum size of a single operation frame (1 MiB, ~3300 device records)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of an exported-device record on the wire
pub const DEVICE_RECORD_SIZE: usize = 312;

/// Size of one interface entry following a device record in a device list
pub const INTERFACE_RECORD_SIZE: usize = 4;

/// Result of scanning a buffer for one message
enum Scan {
    /// A full message and the number of bytes it occupied
    Complete(OpMessage, usize),
    /// At least `needed` bytes are required before the message can be decoded
    Incomplete { needed: usize },
}

/// Encode a message to bytes
///
/// # Example
/// ```
/// use protocol::{OpMessage, encode};
///
/// let bytes = encode(&OpMessage::DevListRequest).unwrap();
/// assert_eq!(bytes, [0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
/// ```
pub fn encode(message: &OpMessage) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len_hint(message));
    encode_into(message, &mut buf)?;
    Ok(buf)
}

/// Encode a message, appending to an existing buffer
pub fn encode_into(message: &OpMessage, buf: &mut Vec<u8>) -> Result<()> {
    let start = buf.len();
    message.header().write_to(buf)?;

    match message {
        OpMessage::DevListRequest => {}
        OpMessage::ImportRequest { bus_id } => {
            buf.write_all(&bus_id.to_wire())?;
        }
        OpMessage::DevListReply { devices, .. } => {
            let count = u32::try_from(devices.len()).map_err(|_| {
                ProtocolError::InvalidMessageFormat(format!(
                    "device count {} exceeds u32 range",
                    devices.len()
                ))
            })?;
            buf.write_u32::<BigEndian>(count)?;
            for device in devices {
                check_interfaces(device)?;
                write_device(buf, device)?;
                for interface in &device.interfaces {
                    buf.write_u8(interface.class)?;
                    buf.write_u8(interface.subclass)?;
                    buf.write_u8(interface.protocol)?;
                    buf.write_u8(0)?;
                }
            }
        }
        OpMessage::ImportReply { status, device } => match (status.is_ok(), device) {
            (true, Some(device)) => write_device(buf, device)?,
            (false, None) => {}
            (true, None) => {
                return Err(ProtocolError::InvalidMessageFormat(
                    "successful import reply without device".to_string(),
                ));
            }
            (false, Some(_)) => {
                return Err(ProtocolError::InvalidMessageFormat(
                    "failed import reply must not carry a device".to_string(),
                ));
            }
        },
    }

    let size = buf.len() - start;
    if size > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Decode one message from the start of `bytes`
///
/// Fails with `InvalidHeader` when fewer than 8 bytes are present and with
/// `InvalidDataLength` when the payload is shorter than the header requires.
/// Bytes after the first message are ignored.
///
/// # Example
/// ```
/// use protocol::{BusId, OpMessage, decode, encode};
///
/// let request = OpMessage::ImportRequest { bus_id: BusId::new("1-1") };
/// let decoded = decode(&encode(&request).unwrap()).unwrap();
/// assert_eq!(decoded, request);
/// ```
pub fn decode(bytes: &[u8]) -> Result<OpMessage> {
    match scan(bytes)? {
        Scan::Complete(message, _) => Ok(message),
        Scan::Incomplete { .. } if bytes.len() < OpHeader::SIZE => {
            Err(ProtocolError::InvalidHeader {
                reason: format!(
                    "need {} header bytes, got {}",
                    OpHeader::SIZE,
                    bytes.len()
                ),
            })
        }
        Scan::Incomplete { needed } => Err(ProtocolError::InvalidDataLength {
            needed,
            available: bytes.len(),
        }),
    }
}

/// Try to decode one message from a stream buffer
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((message,
/// consumed)))` for a complete message, and `Err` for malformed input.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(OpMessage, usize)>> {
    match scan(bytes)? {
        Scan::Complete(message, consumed) => Ok(Some((message, consumed))),
        Scan::Incomplete { .. } => Ok(None),
    }
}

/// Incremental decoder holding the partial-read buffer of one connection
///
/// Bytes are appended as they arrive; complete messages are taken off the
/// front. Any split of the same byte stream yields the same message
/// sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete message off the buffer
    ///
    /// `Ok(None)` means more bytes are needed. On error the offending bytes
    /// are discarded (the whole buffer when the message boundary is
    /// unknown), so the caller can keep calling after logging the error.
    pub fn next_message(&mut self) -> Result<Option<OpMessage>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match scan(&self.buffer) {
            Ok(Scan::Complete(message, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(message))
            }
            Ok(Scan::Incomplete { .. }) => Ok(None),
            Err(e) => {
                match e.skip_len() {
                    Some(len) => self.buffer.advance(len.min(self.buffer.len())),
                    None => self.buffer.clear(),
                }
                Err(e)
            }
        }
    }
}

fn scan(bytes: &[u8]) -> Result<Scan> {
    if bytes.len() < OpHeader::SIZE {
        return Ok(Scan::Incomplete {
            needed: OpHeader::SIZE,
        });
    }

    let mut cursor = bytes;
    let header = OpHeader::read_from(&mut cursor)?;
    validate_version(header.version)?;

    match header.command {
        OP_REQ_DEVLIST => Ok(Scan::Complete(OpMessage::DevListRequest, OpHeader::SIZE)),

        OP_REQ_IMPORT => {
            let needed = OpHeader::SIZE + BUS_ID_SIZE;
            if bytes.len() < needed {
                return Ok(Scan::Incomplete { needed });
            }
            let bus_id = BusId::from_wire(&bytes[OpHeader::SIZE..needed]);
            Ok(Scan::Complete(OpMessage::ImportRequest { bus_id }, needed))
        }

        OP_REP_IMPORT => {
            let status = OpStatus::from_code(header.status);
            if !status.is_ok() {
                return Ok(Scan::Complete(
                    OpMessage::import_failure(status),
                    OpHeader::SIZE,
                ));
            }
            let needed = OpHeader::SIZE + DEVICE_RECORD_SIZE;
            if bytes.len() < needed {
                return Ok(Scan::Incomplete { needed });
            }
            let device = read_device(&bytes[OpHeader::SIZE..needed])?;
            Ok(Scan::Complete(OpMessage::import_success(device), needed))
        }

        OP_REP_DEVLIST => scan_dev_list(bytes, OpStatus::from_code(header.status)),

        OP_REQ_DEVINFO => unsupported(bytes, header.command, OpHeader::SIZE + BUS_ID_SIZE),
        OP_REQ_EXPORT | OP_REQ_UNEXPORT => {
            unsupported(bytes, header.command, OpHeader::SIZE + DEVICE_RECORD_SIZE)
        }
        OP_REP_DEVINFO | OP_REP_EXPORT | OP_REP_UNEXPORT => {
            unsupported(bytes, header.command, OpHeader::SIZE)
        }

        other => Err(ProtocolError::InvalidHeader {
            reason: format!("unknown command {:#06x}", other),
        }),
    }
}

fn scan_dev_list(bytes: &[u8], status: OpStatus) -> Result<Scan> {
    let mut offset = OpHeader::SIZE + 4;
    if bytes.len() < offset {
        return Ok(Scan::Incomplete { needed: offset });
    }

    let mut count_field = &bytes[OpHeader::SIZE..offset];
    let count = count_field.read_u32::<BigEndian>()? as usize;

    let minimum = count
        .saturating_mul(DEVICE_RECORD_SIZE)
        .saturating_add(offset);
    if minimum > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: minimum,
            max: MAX_FRAME_SIZE,
        });
    }

    // Capacity bounded by what is actually buffered, not by the declared count
    let available_records = (bytes.len() - offset) / DEVICE_RECORD_SIZE;
    let mut devices = Vec::with_capacity(count.min(available_records));

    for _ in 0..count {
        let record_end = offset + DEVICE_RECORD_SIZE;
        if bytes.len() < record_end {
            return Ok(Scan::Incomplete { needed: record_end });
        }
        let mut device = read_device(&bytes[offset..record_end])?;
        offset = record_end;

        let interfaces_end = offset + device.interface_count as usize * INTERFACE_RECORD_SIZE;
        if interfaces_end > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: interfaces_end,
                max: MAX_FRAME_SIZE,
            });
        }
        if bytes.len() < interfaces_end {
            return Ok(Scan::Incomplete {
                needed: interfaces_end,
            });
        }

        let mut entries = &bytes[offset..interfaces_end];
        device.interfaces = (0..device.interface_count)
            .map(|_| read_interface(&mut entries))
            .collect::<std::io::Result<Vec<_>>>()?;
        offset = interfaces_end;

        devices.push(device);
    }

    Ok(Scan::Complete(
        OpMessage::DevListReply { status, devices },
        offset,
    ))
}

fn unsupported(bytes: &[u8], command: u16, frame_len: usize) -> Result<Scan> {
    if bytes.len() < frame_len {
        return Ok(Scan::Incomplete { needed: frame_len });
    }
    Err(ProtocolError::UnsupportedCommand { command, frame_len })
}

fn check_interfaces(device: &ExportedDevice) -> Result<()> {
    if device.interfaces.len() > u8::MAX as usize {
        return Err(ProtocolError::InvalidMessageFormat(format!(
            "device {} has {} interfaces, at most {} fit the interface count field",
            device.bus_id,
            device.interfaces.len(),
            u8::MAX
        )));
    }
    if device.interfaces.len() != device.interface_count as usize {
        return Err(ProtocolError::InvalidMessageFormat(format!(
            "device {} declares {} interfaces but lists {}",
            device.bus_id,
            device.interface_count,
            device.interfaces.len()
        )));
    }
    Ok(())
}

fn write_device<W: Write>(writer: &mut W, device: &ExportedDevice) -> Result<()> {
    writer.write_all(&fixed_field::<PATH_SIZE>(&device.path))?;
    writer.write_all(&device.bus_id.to_wire())?;
    writer.write_u32::<BigEndian>(device.bus_number)?;
    writer.write_u32::<BigEndian>(device.device_number)?;
    writer.write_u32::<BigEndian>(device.speed.code())?;
    writer.write_u16::<BigEndian>(device.vendor_id)?;
    writer.write_u16::<BigEndian>(device.product_id)?;
    writer.write_u16::<BigEndian>(device.device_release)?;
    writer.write_u8(device.device_class)?;
    writer.write_u8(device.device_subclass)?;
    writer.write_u8(device.device_protocol)?;
    writer.write_u8(device.configuration_value)?;
    writer.write_u8(device.configuration_count)?;
    writer.write_u8(device.interface_count)?;
    Ok(())
}

/// Parse one 312-byte device record; interfaces are left empty
fn read_device(mut record: &[u8]) -> Result<ExportedDevice> {
    let mut path = [0u8; PATH_SIZE];
    record.read_exact(&mut path)?;
    let mut bus_id = [0u8; BUS_ID_SIZE];
    record.read_exact(&mut bus_id)?;

    let bus_number = record.read_u32::<BigEndian>()?;
    let device_number = record.read_u32::<BigEndian>()?;
    let speed_code = record.read_u32::<BigEndian>()?;
    let speed = DeviceSpeed::from_code(speed_code).ok_or_else(|| {
        ProtocolError::InvalidMessageFormat(format!("unknown device speed {}", speed_code))
    })?;

    Ok(ExportedDevice {
        path: trim_nul(&path),
        bus_id: BusId::from_wire(&bus_id),
        bus_number,
        device_number,
        speed,
        vendor_id: record.read_u16::<BigEndian>()?,
        product_id: record.read_u16::<BigEndian>()?,
        device_release: record.read_u16::<BigEndian>()?,
        device_class: record.read_u8()?,
        device_subclass: record.read_u8()?,
        device_protocol: record.read_u8()?,
        configuration_value: record.read_u8()?,
        configuration_count: record.read_u8()?,
        interface_count: record.read_u8()?,
        interfaces: Vec::new(),
    })
}

fn read_interface<R: Read>(reader: &mut R) -> std::io::Result<InterfaceInfo> {
    let class = reader.read_u8()?;
    let subclass = reader.read_u8()?;
    let protocol = reader.read_u8()?;
    let _padding = reader.read_u8()?;
    Ok(InterfaceInfo {
        class,
        subclass,
        protocol,
    })
}

fn encoded_len_hint(message: &OpMessage) -> usize {
    match message {
        OpMessage::DevListRequest => OpHeader::SIZE,
        OpMessage::ImportRequest { .. } => OpHeader::SIZE + BUS_ID_SIZE,
        OpMessage::ImportReply { device, .. } => {
            OpHeader::SIZE + device.as_ref().map_or(0, |_| DEVICE_RECORD_SIZE)
        }
        OpMessage::DevListReply { devices, .. } => {
            OpHeader::SIZE
                + 4
                + devices
                    .iter()
                    .map(|d| DEVICE_RECORD_SIZE + d.interfaces.len() * INTERFACE_RECORD_SIZE)
                    .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::USBIP_VERSION;

    fn sample_device(bus_id: &str) -> ExportedDevice {
        ExportedDevice {
            path: format!("/sys/bus/usb/devices/{}", bus_id),
            bus_id: BusId::new(bus_id),
            bus_number: 1,
            device_number: 4,
            speed: DeviceSpeed::High,
            vendor_id: 0x0781,
            product_id: 0x5581,
            device_release: 0x0100,
            device_class: 0x00,
            device_subclass: 0x00,
            device_protocol: 0x00,
            configuration_value: 1,
            configuration_count: 1,
            interface_count: 1,
            interfaces: vec![InterfaceInfo {
                class: 0x08,
                subclass: 0x06,
                protocol: 0x50,
            }],
        }
    }

    #[test]
    fn test_dev_list_request_bytes() {
        let bytes = encode(&OpMessage::DevListRequest).unwrap();
        assert_eq!(bytes, [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_import_request_layout() {
        let bytes = encode(&OpMessage::ImportRequest {
            bus_id: BusId::new("1-1"),
        })
        .unwrap();

        assert_eq!(bytes.len(), OpHeader::SIZE + BUS_ID_SIZE);
        assert_eq!(&bytes[..4], &[0x01, 0x11, 0x80, 0x03]);
        assert_eq!(&bytes[8..11], b"1-1");
        assert!(bytes[11..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_dev_list_reply_layout() {
        let device = sample_device("1-1");
        let bytes = encode(&OpMessage::dev_list(vec![device])).unwrap();

        assert_eq!(
            bytes.len(),
            OpHeader::SIZE + 4 + DEVICE_RECORD_SIZE + INTERFACE_RECORD_SIZE
        );
        // count
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        // busid starts after the 256-byte path
        assert_eq!(&bytes[12 + 256..12 + 259], b"1-1");
        // speed (high = 3) after busnum and devnum
        assert_eq!(&bytes[12 + 296..12 + 300], &[0, 0, 0, 3]);
        // first interface entry
        assert_eq!(&bytes[12 + 312..], &[0x08, 0x06, 0x50, 0x00]);
    }

    #[test]
    fn test_dev_list_reply_roundtrip() {
        let msg = OpMessage::dev_list(vec![sample_device("1-1"), sample_device("2-1.4")]);
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_import_reply_omits_interfaces() {
        let device = sample_device("1-1");
        let bytes = encode(&OpMessage::import_success(device.clone())).unwrap();
        assert_eq!(bytes.len(), OpHeader::SIZE + DEVICE_RECORD_SIZE);

        let OpMessage::ImportReply {
            status,
            device: Some(decoded),
        } = decode(&bytes).unwrap()
        else {
            panic!("Expected successful ImportReply");
        };
        assert!(status.is_ok());
        assert_eq!(decoded.interface_count, 1);
        assert!(decoded.interfaces.is_empty());
        assert_eq!(decoded.bus_id, device.bus_id);
    }

    #[test]
    fn test_import_failure_is_header_only() {
        let bytes = encode(&OpMessage::import_failure(OpStatus::NoDevice)).unwrap();
        assert_eq!(bytes, [0x01, 0x11, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(
            decode(&bytes).unwrap(),
            OpMessage::import_failure(OpStatus::NoDevice)
        );
    }

    #[test]
    fn test_interface_count_mismatch_rejected() {
        let mut device = sample_device("1-1");
        device.interface_count = 2;
        let result = encode(&OpMessage::dev_list(vec![device]));
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_too_many_interfaces_rejected() {
        let mut device = sample_device("1-1");
        device.interfaces = vec![
            InterfaceInfo {
                class: 3,
                subclass: 0,
                protocol: 0,
            };
            300
        ];
        let Err(ProtocolError::InvalidMessageFormat(reason)) =
            encode(&OpMessage::dev_list(vec![device]))
        else {
            panic!("Expected InvalidMessageFormat");
        };
        assert!(reason.contains("300 interfaces"));
    }

    #[test]
    fn test_inconsistent_import_reply_rejected() {
        let msg = OpMessage::ImportReply {
            status: OpStatus::Ok,
            device: None,
        };
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_decode_short_header() {
        let result = decode(&[0x01, 0x11, 0x80]);
        assert!(matches!(result, Err(ProtocolError::InvalidHeader { .. })));
    }

    #[test]
    fn test_decode_short_payload() {
        let bytes = encode(&OpMessage::ImportRequest {
            bus_id: BusId::new("1-1"),
        })
        .unwrap();
        let result = decode(&bytes[..20]);
        let Err(ProtocolError::InvalidDataLength { needed, available }) = result else {
            panic!("Expected InvalidDataLength, got {:?}", result);
        };
        assert_eq!(needed, 40);
        assert_eq!(available, 20);
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut bytes = Vec::new();
        OpHeader::new(0x1234, 0).write_to(&mut bytes).unwrap();
        let result = decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::InvalidHeader { .. })));
    }

    #[test]
    fn test_decode_wrong_version() {
        let mut bytes = Vec::new();
        OpHeader {
            version: 0x0106,
            command: OP_REQ_DEVLIST,
            status: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        let result = decode(&bytes);
        let Err(err) = result else {
            panic!("Expected version error");
        };
        assert!(err.is_header_error());
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion { version: 0x0106, expected } if expected == USBIP_VERSION
        ));
    }

    #[test]
    fn test_decode_unsupported_command_reports_frame_len() {
        let mut bytes = Vec::new();
        OpHeader::new(OP_REQ_DEVINFO, 0).write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&BusId::new("1-1").to_wire());

        let result = decode(&bytes);
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedCommand {
                command: OP_REQ_DEVINFO,
                frame_len: 40
            })
        ));

        // Without the body the frame is not yet complete
        assert!(decode_frame(&bytes[..8]).unwrap().is_none());
    }

    #[test]
    fn test_huge_device_count_does_not_allocate() {
        let mut bytes = Vec::new();
        OpHeader::new(OP_REP_DEVLIST, 0).write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());

        let result = decode_frame(&bytes);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_declared_count_larger_than_buffer_needs_more() {
        let mut bytes = Vec::new();
        OpHeader::new(OP_REP_DEVLIST, 0).write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&3u32.to_be_bytes());

        assert!(decode_frame(&bytes).unwrap().is_none());
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::InvalidDataLength { needed, .. }) if needed == 12 + DEVICE_RECORD_SIZE
        ));
    }

    #[test]
    fn test_unknown_speed_rejected() {
        let mut bytes = encode(&OpMessage::import_success(sample_device("1-1"))).unwrap();
        // speed field: header + path + busid + busnum + devnum
        let speed_offset = OpHeader::SIZE + 256 + 32 + 8;
        bytes[speed_offset..speed_offset + 4].copy_from_slice(&42u32.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_frame_decoder_multiple_messages() {
        let mut stream = encode(&OpMessage::DevListRequest).unwrap();
        encode_into(
            &OpMessage::ImportRequest {
                bus_id: BusId::new("3-2"),
            },
            &mut stream,
        )
        .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(
            decoder.next_message().unwrap(),
            Some(OpMessage::DevListRequest)
        );
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(OpMessage::ImportRequest {
                bus_id: BusId::new("3-2")
            })
        );
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_skips_unsupported_command() {
        let mut stream = Vec::new();
        OpHeader::new(OP_REP_EXPORT, 0).write_to(&mut stream).unwrap();
        encode_into(&OpMessage::DevListRequest, &mut stream).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::UnsupportedCommand { .. })
        ));
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(OpMessage::DevListRequest)
        );
    }

    #[test]
    fn test_frame_decoder_drops_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 1, 2, 3]);

        assert!(decoder.next_message().is_err());
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(&encode(&OpMessage::DevListRequest).unwrap());
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(OpMessage::DevListRequest)
        );
    }
}
