//! Claim IPC for rust-usbip
//!
//! The USB/IP daemon runs unprivileged. Exclusive access to a physical
//! device (detaching its kernel drivers) is granted by a separate privileged
//! claimer. This crate is the protocol between the two:
//!
//! - [`message`]: request/response types and claim records
//! - [`framing`]: length + CRC32 framed postcard encoding
//! - [`transport`]: in-memory and Unix socket frame channels
//! - [`ClaimClient`]: daemon side, request/response correlation with
//!   timeouts, a pending-request bound and reconnects through a [`Connector`]
//! - [`IpcServer`] and [`ClaimService`]: claimer side, authentication,
//!   exclusive claim registry and history
//! - [`IpcStatistics`]: counters kept on both sides
//!
//! # Example
//!
//! ```
//! use claim::testing::StaticClaimBackend;
//! use claim::{ClaimClient, ClaimService, IpcConfig, IpcServer, transport};
//! use protocol::BusId;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = IpcConfig::default();
//! let backend = Arc::new(StaticClaimBackend::with_devices(["1-1"]));
//! let service = Arc::new(ClaimService::new("claimer", backend, 16));
//! let server = IpcServer::new(service, config.clone());
//!
//! let (client_end, server_end) = transport::memory_pair(8);
//! tokio::spawn(async move { server.serve_channel(server_end).await });
//!
//! let client = ClaimClient::new(client_end, &config);
//! let claim = client.claim_device(&BusId::new("1-1")).await.unwrap();
//! assert_eq!(claim.bus_id.as_str(), "1-1");
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod message;
pub mod pool;
pub mod server;
pub mod service;
pub mod stats;
pub mod testing;
pub mod transport;

pub use client::{ClaimClient, ConnectFuture, Connector};
pub use config::IpcConfig;
pub use error::{IpcError, IpcErrorKind, IpcFailure, Result};
pub use message::{
    ClaimAction, ClaimHistoryEntry, ClaimMethod, ClaimState, ClaimedDevice, IpcCommand,
    IpcEnvelope, IpcRequest, IpcResponse, IpcResult, ServiceStatus,
};
pub use server::IpcServer;
pub use service::{BackendError, ClaimBackend, ClaimGrant, ClaimService};
pub use stats::{IpcStatistics, StatisticsSnapshot};
pub use transport::FramedChannel;
