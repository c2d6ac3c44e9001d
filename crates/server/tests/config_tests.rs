//! Integration tests for configuration files
//!
//! Tests server configuration parsing and persistence, including:
//! - Full and minimal configuration files
//! - The [claimer] section shared with the claimer binary
//! - Invalid configuration handling
//! - Save/load through the filesystem

use server::config::{DEFAULT_PORT, ServerConfig};
use std::time::Duration;
use tempfile::tempdir;

const FULL_SERVER_CONFIG: &str = r#"
[server]
bind_addr = "127.0.0.1"
port = 13240
log_level = "debug"
max_connections = 8

[usb]
filters = ["0x046d:*", "0x1234:0x5678"]
poll_interval_ms = 250

[claimer]
service_name = "lab-claimer"
socket_path = "/tmp/usbip-rs-test/claimer.sock"
client_id = "usbipd-lab"
authorized_clients = ["usbipd-lab", "usbipd-backup"]
max_connections = 2
request_timeout_secs = 5
max_pending_requests = 16
max_message_size = 8192
history_limit = 32
"#;

mod parsing {
    use super::*;

    #[test]
    fn test_parse_full_server_config() {
        let config: ServerConfig = toml::from_str(FULL_SERVER_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind_ip().unwrap().to_string(), "127.0.0.1");
        assert_eq!(config.server.port, 13240);
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.usb.filters.len(), 2);
        assert_eq!(config.usb.poll_interval(), Duration::from_millis(250));

        assert_eq!(config.claimer.service_name, "lab-claimer");
        assert_eq!(config.claimer.client_id, "usbipd-lab");
        assert_eq!(config.claimer.authorized_clients.len(), 2);
        assert_eq!(config.claimer.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.claimer.max_message_size, 8192);
        assert_eq!(
            config.claimer.socket_path().unwrap().to_str(),
            Some("/tmp/usbip-rs-test/claimer.sock")
        );
    }

    #[test]
    fn test_parse_minimal_server_config() {
        let config: ServerConfig = toml::from_str("[server]\n").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.log_level, "info");
        assert!(config.usb.filters.is_empty());
        assert_eq!(config.claimer.client_id, "usbipd");
    }

    #[test]
    fn test_missing_server_section() {
        let result: Result<ServerConfig, _> = toml::from_str("[usb]\nfilters = []\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_claimer_section() {
        let config: ServerConfig =
            toml::from_str("[server]\n[claimer]\nrequest_timeout_secs = 3\n").unwrap();
        assert_eq!(config.claimer.request_timeout_secs, 3);
        assert_eq!(config.claimer.max_pending_requests, 64);
    }
}

mod validation {
    use super::*;

    fn invalid(toml: &str) -> String {
        let config: ServerConfig = toml::from_str(toml).unwrap();
        format!("{:#}", config.validate().unwrap_err())
    }

    #[test]
    fn test_invalid_log_level() {
        let error = invalid("[server]\nlog_level = \"verbose\"\n");
        assert!(error.contains("verbose"));
    }

    #[test]
    fn test_invalid_usb_filter_formats() {
        for filter in ["046d:c52b", "0x046d", "0xZZZZ:*", "0x12345:*"] {
            let toml = format!("[server]\n[usb]\nfilters = [\"{}\"]\n", filter);
            let error = invalid(&toml);
            assert!(error.contains("Invalid"), "{}: {}", filter, error);
        }
    }

    #[test]
    fn test_zero_limits_rejected() {
        invalid("[server]\nmax_connections = 0\n");
        invalid("[server]\n[usb]\npoll_interval_ms = 0\n");
    }

    #[test]
    fn test_invalid_claimer_section() {
        let error = invalid("[server]\n[claimer]\nmax_message_size = 4\n");
        assert!(error.contains("claimer"));

        let error = invalid("[server]\n[claimer]\nauthorized_clients = [\"\"]\n");
        assert!(error.contains("authorized_clients"));
    }
}

mod persistence {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");

        let mut config = ServerConfig::default();
        config.server.port = 5000;
        config.usb.filters = vec!["0x1234:*".to_string()];
        config.claimer.client_id = "usbipd-test".to_string();
        config.claimer.authorized_clients = vec!["usbipd-test".to_string()];
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.server.port, 5000);
        assert_eq!(loaded.usb.filters, vec!["0x1234:*".to_string()]);
        assert_eq!(loaded.claimer, config.claimer);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[server]\nport = 0\n").unwrap();

        assert!(ServerConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let error = ServerConfig::load(Some(dir.path().join("absent.toml"))).unwrap_err();
        assert!(format!("{:#}", error).contains("Failed to read config file"));
    }
}
