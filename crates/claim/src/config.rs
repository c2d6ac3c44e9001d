//! Claim IPC configuration

use crate::error::{IpcError, Result};
use crate::framing::FRAME_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by the daemon-side client and the claimer-side server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Name the claimer reports in status responses
    #[serde(default = "IpcConfig::default_service_name")]
    pub service_name: String,
    /// Unix socket the claimer listens on (`~` is expanded)
    #[serde(default = "IpcConfig::default_socket_path")]
    pub socket_path: String,
    /// Identity the daemon presents to the claimer
    #[serde(default = "IpcConfig::default_client_id")]
    pub client_id: String,
    /// Identities the claimer accepts
    #[serde(default = "IpcConfig::default_authorized_clients")]
    pub authorized_clients: Vec<String>,
    /// Maximum concurrent IPC connections at the claimer
    #[serde(default = "IpcConfig::default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait for a response before failing with a timeout
    #[serde(default = "IpcConfig::default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum requests awaiting a response per client
    #[serde(default = "IpcConfig::default_max_pending")]
    pub max_pending_requests: usize,
    /// Maximum encoded frame size in bytes, header included
    #[serde(default = "IpcConfig::default_max_message_size")]
    pub max_message_size: usize,
    /// Number of claim history entries kept by the claimer
    #[serde(default = "IpcConfig::default_history_limit")]
    pub history_limit: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            service_name: Self::default_service_name(),
            socket_path: Self::default_socket_path(),
            client_id: Self::default_client_id(),
            authorized_clients: Self::default_authorized_clients(),
            max_connections: Self::default_max_connections(),
            request_timeout_secs: Self::default_request_timeout(),
            max_pending_requests: Self::default_max_pending(),
            max_message_size: Self::default_max_message_size(),
            history_limit: Self::default_history_limit(),
        }
    }
}

impl IpcConfig {
    fn default_service_name() -> String {
        "usbip-rs-claimer".to_string()
    }

    fn default_socket_path() -> String {
        "/run/usbip-rs/claimer.sock".to_string()
    }

    fn default_client_id() -> String {
        "usbipd".to_string()
    }

    fn default_authorized_clients() -> Vec<String> {
        vec![Self::default_client_id()]
    }

    fn default_max_connections() -> usize {
        8
    }

    fn default_request_timeout() -> u64 {
        30
    }

    fn default_max_pending() -> usize {
        64
    }

    fn default_max_message_size() -> usize {
        64 * 1024
    }

    fn default_history_limit() -> usize {
        256
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Socket path with `~` and environment variables expanded
    pub fn socket_path(&self) -> Result<PathBuf> {
        shellexpand::full(&self.socket_path)
            .map(|p| PathBuf::from(p.as_ref()))
            .map_err(|e| IpcError::Config(format!("Invalid socket path '{}': {}", self.socket_path, e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(IpcError::Config("service_name must not be empty".into()));
        }
        if self.client_id.trim().is_empty() {
            return Err(IpcError::Config("client_id must not be empty".into()));
        }
        if self.authorized_clients.iter().any(|c| c.trim().is_empty()) {
            return Err(IpcError::Config(
                "Empty client id in authorized_clients list".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(IpcError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(IpcError::Config("max_connections must be > 0".into()));
        }
        if self.max_pending_requests == 0 {
            return Err(IpcError::Config("max_pending_requests must be > 0".into()));
        }
        if self.max_message_size <= FRAME_HEADER_SIZE {
            return Err(IpcError::Config(format!(
                "max_message_size must exceed the {}-byte frame header",
                FRAME_HEADER_SIZE
            )));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(IpcError::Config(
                "max_message_size must fit the 32-bit length field".into(),
            ));
        }
        if self.history_limit == 0 {
            return Err(IpcError::Config("history_limit must be > 0".into()));
        }
        self.socket_path()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IpcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.authorized_clients.contains(&config.client_id));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = IpcConfig::default();
        config.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = IpcConfig::default();
        config.max_pending_requests = 0;
        assert!(config.validate().is_err());

        let mut config = IpcConfig::default();
        config.max_message_size = FRAME_HEADER_SIZE;
        assert!(matches!(config.validate(), Err(IpcError::Config(_))));
    }

    #[test]
    fn test_tilde_socket_path_expanded() {
        let config = IpcConfig {
            socket_path: "~/claimer.sock".to_string(),
            ..IpcConfig::default()
        };
        let path = config.socket_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("claimer.sock"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: IpcConfig = toml::from_str("max_message_size = 1024").unwrap();
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.client_id, "usbipd");
    }
}
