//! rust-usbip Server
//!
//! USB/IP daemon that exports the host's USB devices over TCP. The daemon
//! itself runs unprivileged; exclusive access to a device is obtained from
//! the privileged claimer over the claim IPC protocol.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──ConnectionEvent──> RequestCoordinator ──IPC──> claimer
//!        │                                    │
//!   TCP sessions                        DeviceRegistry <── DeviceSource
//! ```
//!
//! - [`network`]: TCP listener and per-connection framing
//! - [`coordinator`]: device-list and import handling, session claims
//! - [`registry`]: exported device table kept current by hot-plug events
//! - [`usb`]: libusb enumeration and the claimer's hardware backend
//! - [`config`]: TOML configuration

pub mod config;
pub mod coordinator;
pub mod network;
pub mod registry;
pub mod usb;

pub use config::ServerConfig;
pub use coordinator::{CoordinatorError, RequestCoordinator, SessionClaim};
pub use network::{ConnectionEvent, ConnectionId, ConnectionManager, NetworkError};
pub use registry::DeviceRegistry;
pub use usb::{DeviceSource, RusbClaimBackend, RusbDeviceSource, StaticDeviceSource};
