//! Common utilities for rust-usbip
//!
//! This crate provides the pieces shared by the USB/IP daemon and the
//! privileged claimer: error handling, logging setup, the channel bridge
//! carrying device hot-plug events from the USB polling thread into the
//! Tokio runtime, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{DeviceEvent, DeviceEventHub, DeviceEventPublisher};
pub use error::{Error, Result};
pub use logging::setup_logging;
