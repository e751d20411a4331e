//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use std::path::Path;

use log::warn;

use crate::config::error::{ConfigError, Result};
use crate::config::types::ServerConfig;
use crate::protocol::ProtocolVersion;

/// Validate the configuration
///
/// Hard errors are returned; questionable but usable settings are logged.
pub fn validate_config(config: &ServerConfig) -> Result<()> {
    validate_protocol_settings(config)?;
    validate_certificate_settings(config)?;
    validate_general_settings(config)?;

    for warning in check_warnings(config) {
        warn!("{}", warning);
    }

    Ok(())
}

fn validate_protocol_settings(config: &ServerConfig) -> Result<()> {
    if config.protocols().is_empty() {
        return Err(ConfigError::MissingRequiredValue("protocols".to_string()));
    }

    if !config.ssl() && !config.plain() && config.default_protocol().is_none() {
        warn!("Plaintext sniffing is off and no default protocol is set; every connection will be passed through");
    }

    Ok(())
}

fn validate_certificate_settings(config: &ServerConfig) -> Result<()> {
    if !config.ssl() {
        return Ok(());
    }

    validate_file_exists(config.cert())?;
    validate_file_exists(config.key())?;

    Ok(())
}

fn validate_general_settings(config: &ServerConfig) -> Result<()> {
    if config.detect_timeout().is_zero() {
        return Err(ConfigError::InvalidValue(
            "detect_timeout".to_string(),
            "Detection timeout must be greater than 0".to_string(),
        ));
    }

    if config.max_body_size() == 0 {
        return Err(ConfigError::InvalidValue(
            "max_body_size".to_string(),
            "Maximum body size must be greater than 0".to_string(),
        ));
    }

    if config.max_header_size() == 0 {
        return Err(ConfigError::InvalidValue(
            "max_header_size".to_string(),
            "Maximum header size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_file_exists(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    Ok(())
}

/// Check configuration for warnings
pub fn check_warnings(config: &ServerConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    match config.log_level() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => warnings.push(format!("Invalid log level '{}', using default 'info'", level)),
    }

    if let Some(protocol) = config.default_protocol() {
        if !config.protocols().iter().any(|p| p == protocol) {
            warnings.push(format!(
                "Default protocol '{}' is not in the offered protocol list",
                protocol
            ));
        }
    }

    for protocol in config.protocols() {
        let known = ProtocolVersion::from_identifier(&protocol).is_some()
            || protocol.starts_with("http/");
        if !known {
            warnings.push(format!(
                "Protocol '{}' is not multiplexed and will be passed through",
                protocol
            ));
        }
    }

    warnings
}
