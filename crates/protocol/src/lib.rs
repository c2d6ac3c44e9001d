//! USB/IP protocol library for rust-usbip
//!
//! This crate implements the operation-phase messages of the USB/IP
//! protocol (version 1.1.1): device discovery and device import. It is a
//! pure codec with no I/O, shared by the server's connection handling and
//! by tests that play the part of a USB/IP client.
//!
//! # Example
//!
//! ```
//! use protocol::{BusId, OpMessage, decode, encode};
//!
//! let request = OpMessage::ImportRequest {
//!     bus_id: BusId::new("1-1"),
//! };
//!
//! let bytes = encode(&request).unwrap();
//! assert_eq!(bytes.len(), 40);
//!
//! let decoded = decode(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```
//!
//! # Stream Decoding
//!
//! TCP delivers bytes in arbitrary pieces. [`FrameDecoder`] buffers them and
//! yields whole messages:
//!
//! ```
//! use protocol::{FrameDecoder, OpMessage, encode};
//!
//! let bytes = encode(&OpMessage::DevListRequest).unwrap();
//! let mut decoder = FrameDecoder::new();
//!
//! decoder.extend(&bytes[..3]);
//! assert_eq!(decoder.next_message().unwrap(), None);
//!
//! decoder.extend(&bytes[3..]);
//! assert_eq!(decoder.next_message().unwrap(), Some(OpMessage::DevListRequest));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    DEVICE_RECORD_SIZE, FrameDecoder, INTERFACE_RECORD_SIZE, MAX_FRAME_SIZE, decode, decode_frame,
    encode, encode_into,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    OP_REP_DEVINFO, OP_REP_DEVLIST, OP_REP_EXPORT, OP_REP_IMPORT, OP_REP_UNEXPORT, OP_REQ_DEVINFO,
    OP_REQ_DEVLIST, OP_REQ_EXPORT, OP_REQ_IMPORT, OP_REQ_UNEXPORT, OpHeader, OpMessage,
};
pub use types::{
    BUS_ID_SIZE, BusId, DeviceSpeed, ExportedDevice, InterfaceInfo, OpStatus, PATH_SIZE,
};
pub use version::{USBIP_VERSION, validate_version};
