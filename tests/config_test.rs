//! Configuration tests
//!
//! This module contains tests for the configuration system.

use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;

use mux_gate::config::{self, ConfigBuilder, ConfigValues, ServerConfig, ENV_PREFIX};
use mux_gate::SwitchError;

const ENV_VARS: &[&str] = &["LISTEN", "SSL", "PLAIN", "PROTOCOLS", "NPN_PROTOCOLS", "DEFAULT_PROTOCOL", "DETECT_TIMEOUT"];

fn clear_env() {
    for name in ENV_VARS {
        env::remove_var(format!("{}{}", ENV_PREFIX, name));
    }
}

/// Test default configuration
#[test]
fn test_default_config() {
    let config = ServerConfig::default();

    assert_eq!(config.listen().to_string(), "0.0.0.0:8443");
    assert!(config.ssl());
    assert!(!config.plain());
    assert_eq!(config.protocols(), vec!["h2", "spdy/3.1", "spdy/3", "spdy/2", "http/1.1", "http/1.0"]);
    assert_eq!(config.default_protocol(), None);
    assert_eq!(config.log_level(), "info");
    assert_eq!(config.detect_timeout(), Duration::from_secs(5));
    assert_eq!(config.max_header_size(), 64 * 1024);
    assert_eq!(config.max_body_size(), 8 * 1024 * 1024);
    assert!(!config.x_forwarded_for());
    assert_eq!(config.source("listen"), "default");
}

/// Test configuration from file
#[test]
fn test_file_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{
            "listen": "127.0.0.1:9000",
            "ssl": false,
            "plain": true,
            "alpn_protocols": ["h2", "http/1.1"],
            "npn_protocols": ["spdy/3", "h2"],
            "protocol": "spdy/3",
            "detect_timeout": 250,
            "max_body_size": 1024,
            "connection": { "max_concurrent_streams": 64, "engine_hint": "fast" }
        }"#,
    )
    .unwrap();

    let config = ConfigBuilder::new().with_defaults().with_file(&path).build().unwrap();

    assert_eq!(config.listen().to_string(), "127.0.0.1:9000");
    assert!(!config.ssl());
    assert!(config.plain());
    assert_eq!(config.protocols(), vec!["h2", "http/1.1", "spdy/3"]);
    assert_eq!(config.default_protocol(), Some("spdy/3"));
    assert_eq!(config.detect_timeout(), Duration::from_millis(250));
    assert_eq!(config.max_body_size(), 1024);

    let connection = config.connection();
    assert_eq!(connection.max_concurrent_streams, Some(64));
    assert_eq!(connection.extra.get("engine_hint").and_then(|v| v.as_str()), Some("fast"));

    assert_eq!(config.source("listen"), "file");
    assert_eq!(config.source("log_level"), "default");
}

/// Test that unknown keys in a file are rejected
#[test]
fn test_file_rejects_unknown_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, r#"{ "target": "127.0.0.1:6000" }"#).unwrap();

    let result = ConfigBuilder::new().with_defaults().with_file(&path).without_validation().build();
    assert!(matches!(result, Err(SwitchError::Config(_))));
}

/// Test configuration priority: defaults < file < environment < command line
#[test]
#[serial]
fn test_source_priority() {
    clear_env();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{ "listen": "127.0.0.1:7000", "ssl": false, "plain": true, "detect_timeout": 100 }"#,
    )
    .unwrap();

    env::set_var(format!("{}LISTEN", ENV_PREFIX), "127.0.0.1:7001");
    env::set_var(format!("{}PROTOCOLS", ENV_PREFIX), "h2, http/1.1");

    let cli = ConfigValues {
        listen: Some("127.0.0.1:7002".parse().unwrap()),
        ..ConfigValues::default()
    };
    let config = config::load(Some(&path), cli).unwrap();
    clear_env();

    assert_eq!(config.listen().to_string(), "127.0.0.1:7002");
    assert_eq!(config.source("listen"), "command line");
    assert_eq!(config.protocols(), vec!["h2", "http/1.1"]);
    assert_eq!(config.source("protocols"), "environment");
    assert_eq!(config.detect_timeout(), Duration::from_millis(100));
    assert_eq!(config.source("detect_timeout"), "file");
    assert!(!config.ssl());
}

/// Test boolean spellings in the environment
#[test]
#[serial]
fn test_env_flags() {
    clear_env();
    env::set_var(format!("{}SSL", ENV_PREFIX), "no");
    env::set_var(format!("{}PLAIN", ENV_PREFIX), "1");
    env::set_var(format!("{}DEFAULT_PROTOCOL", ENV_PREFIX), "h2");

    let config = ConfigBuilder::new().with_defaults().with_env(ENV_PREFIX).build().unwrap();
    clear_env();

    assert!(!config.ssl());
    assert!(config.plain());
    assert_eq!(config.default_protocol(), Some("h2"));
}

/// Test that TLS mode without certificate files fails validation
#[test]
#[serial]
fn test_tls_requires_certificates() {
    clear_env();

    let cli = ConfigValues {
        ssl: Some(true),
        cert: Some("/nonexistent/server.crt".into()),
        key: Some("/nonexistent/server.key".into()),
        ..ConfigValues::default()
    };
    let result = ConfigBuilder::new().with_defaults().with_cli(cli).build();
    assert!(matches!(result, Err(SwitchError::Config(_))));
}

/// Test that an empty protocol list is rejected
#[test]
fn test_empty_protocols_rejected() {
    let cli = ConfigValues {
        ssl: Some(false),
        protocols: Some(Vec::new()),
        ..ConfigValues::default()
    };
    let result = ConfigBuilder::new().with_defaults().with_cli(cli).build();
    assert!(matches!(result, Err(SwitchError::Config(_))));
}
