//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use cm_protocol::config::{ClientConfig, DiscoveryConfig, NetworkConfig, TransportConfig, MAX_PAYLOAD_SIZE};
use cm_protocol::core::emsg::Universe;
use cm_protocol::transport::TransportKind;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_universe() {
    let mut config = NetworkConfig::default();
    config.client.universe = Universe::Invalid;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Universe must not be Invalid")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_zero_reconnect_attempts_with_auto_reconnect() {
    let mut config = NetworkConfig::default();
    config.client.auto_reconnect = true;
    config.client.max_reconnect_attempts = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max reconnect attempts must be greater than 0")));

    config.client.auto_reconnect = false;
    assert!(config.validate().is_empty());
}

#[test]
fn test_reconnect_delay_bounds() {
    let mut config = NetworkConfig::default();
    config.client.reconnect_delay = Duration::from_secs(10);
    config.client.max_reconnect_delay = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max reconnect delay cannot be shorter")));
}

#[test]
fn test_bad_seed_server() {
    let mut config = NetworkConfig::default();
    config.discovery.seed_servers = vec!["10.0.0.1:27017".into(), "no-port".into()];

    let errors = config.validate();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Invalid seed server format: 'no-port'"));
}

#[test]
fn test_discovery_window_bounds() {
    let mut config = NetworkConfig::default();
    config.discovery.window = Duration::from_millis(1);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Discovery window too short")));

    config.discovery.window = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Discovery window too long")));
}

#[test]
fn test_missing_store_directory() {
    let mut config = NetworkConfig::default();
    config.discovery.store_path = Some("/definitely/not/here/servers.toml".into());

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Server store directory does not exist")));
}

#[test]
fn test_payload_size_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max payload size cannot be 0")));

    config.transport.max_payload_size = 512;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max payload size too small")));

    config.transport.max_payload_size = MAX_PAYLOAD_SIZE + 1;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_no_logging_output() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_multiple_errors_collected() {
    let config = NetworkConfig {
        client: ClientConfig {
            connection_timeout: Duration::from_millis(10),
            channel_capacity: 0,
            ..ClientConfig::default()
        },
        discovery: DiscoveryConfig {
            window: Duration::from_millis(1),
            ..DiscoveryConfig::default()
        },
        transport: TransportConfig {
            channel_capacity: 0,
            ..TransportConfig::default()
        },
        ..NetworkConfig::default()
    };

    let errors = config.validate();
    assert!(errors.len() >= 4, "Should collect all errors: {errors:?}");

    let err = config.validate_strict().unwrap_err();
    assert!(err.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [client]
        universe = "Beta"
        job_timeout = 2500

        [discovery]
        seed_servers = ["10.0.0.1:27017", "10.0.0.2:27018"]
        seed_websocket_servers = ["cm1.example.net:443"]

        [transport]
        kind = "websocket"

        [logging]
        app_name = "probe"
        log_level = "debug"
        log_to_console = true
        log_to_file = false
        json_format = true
        "#,
    )
    .unwrap();

    assert_eq!(config.client.universe, Universe::Beta);
    assert_eq!(config.client.job_timeout, Duration::from_millis(2500));
    assert_eq!(config.client.max_reconnect_attempts, ClientConfig::default().max_reconnect_attempts);
    assert_eq!(config.discovery.seed_servers.len(), 2);
    assert_eq!(config.transport.kind, TransportKind::WebSocket);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_bad_toml_is_config_error() {
    let err = NetworkConfig::from_toml("[client]\nuniverse = 7").unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_example_config_roundtrips_through_file() {
    let example = NetworkConfig::example_config();
    assert!(example.contains("[discovery]"));
    assert!(!example.contains("password"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cm-protocol.toml");
    let config = NetworkConfig::default_with_overrides(|c| {
        c.discovery.seed_servers = vec!["192.168.1.5:27017".into()];
        c.client.heartbeat_interval = Duration::from_secs(30);
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.discovery.seed_servers, ["192.168.1.5:27017"]);
    assert_eq!(loaded.client.heartbeat_interval, Duration::from_secs(30));
}

#[test]
fn test_from_env_overrides() {
    std::env::set_var("CM_PROTOCOL_SEED_SERVERS", "10.1.0.1:27017, 10.1.0.2:27017,");
    std::env::set_var("CM_PROTOCOL_TRANSPORT", "udp");
    std::env::set_var("CM_PROTOCOL_JOB_TIMEOUT_MS", "1500");

    let config = NetworkConfig::from_env().unwrap();

    std::env::remove_var("CM_PROTOCOL_SEED_SERVERS");
    std::env::remove_var("CM_PROTOCOL_TRANSPORT");
    std::env::remove_var("CM_PROTOCOL_JOB_TIMEOUT_MS");

    assert_eq!(config.discovery.seed_servers, ["10.1.0.1:27017", "10.1.0.2:27017"]);
    assert_eq!(config.transport.kind, TransportKind::Udp);
    assert_eq!(config.client.job_timeout, Duration::from_millis(1500));
}
