//! Configuration sources
//!
//! This module defines traits and implementations for loading configuration
//! from different sources.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};

use crate::config::error::{ConfigError, Result};
use crate::config::types::{parse_protocol_list, parse_socket_addr, ConfigValues, ServerConfig, ValueSource};

/// Configuration source trait
pub trait ConfigSource {
    /// Load configuration from this source
    fn load(&self) -> Result<ServerConfig>;

    /// Get the source type
    fn source_type(&self) -> ValueSource;
}

/// Record every populated field of `config` as coming from `source`
fn track_sources(config: &mut ServerConfig, source: ValueSource) {
    let values = &config.values;
    let fields = [
        ("listen", values.listen.is_some()),
        ("ssl", values.ssl.is_some()),
        ("plain", values.plain.is_some()),
        ("protocols", values.protocols.is_some()),
        ("npn_protocols", values.npn_protocols.is_some()),
        ("default_protocol", values.default_protocol.is_some()),
        ("connection", values.connection.is_some()),
        ("log_level", values.log_level.is_some()),
        ("detect_timeout", values.detect_timeout.is_some()),
        ("max_header_size", values.max_header_size.is_some()),
        ("max_body_size", values.max_body_size.is_some()),
        ("x_forwarded_for", values.x_forwarded_for.is_some()),
        ("cert", values.cert.is_some()),
        ("key", values.key.is_some()),
    ];

    for (name, present) in fields {
        if present {
            config.sources.insert(name.to_string(), source);
        }
    }
}

/// Default configuration source
pub struct DefaultSource;

impl ConfigSource for DefaultSource {
    fn load(&self) -> Result<ServerConfig> {
        debug!("Loading default configuration");
        Ok(ServerConfig::default())
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Default
    }
}

/// File configuration source (JSON)
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    /// Create a new file source
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<ServerConfig> {
        debug!("Loading configuration from file: {}", self.path.display());

        if !self.path.exists() {
            warn!("Configuration file not found: {}", self.path.display());
            return Ok(ServerConfig::from_values(ConfigValues::default()));
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::FileReadError(self.path.clone(), e.to_string()))?;

        let values = serde_json::from_str::<ConfigValues>(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Error parsing {}: {}", self.path.display(), e))
        })?;

        let mut config = ServerConfig::from_values(values);
        config.config_file = Some(self.path.clone());
        track_sources(&mut config, self.source_type());

        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::File
    }
}

/// Environment variable configuration source
///
/// Variables are named `<prefix><FIELD>`, e.g. `MUX_GATE_LISTEN`.
/// Protocol lists are comma separated.
pub struct EnvSource {
    pub prefix: String,
}

impl EnvSource {
    /// Create a new environment source
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        let full_name = format!("{}{}", self.prefix, name);
        match env::var(&full_name) {
            Ok(value) => {
                debug!("Found environment variable {}={}", full_name, value);
                Some(value)
            }
            Err(_) => None,
        }
    }

    fn parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        let value = self.var(name)?;
        match parse_flag_or_value::<T>(&value) {
            Some(parsed) => Some(parsed),
            None => {
                warn!("Invalid {}{} in environment: {}", self.prefix, name, value);
                None
            }
        }
    }
}

/// Parse a value, accepting `1`/`0`/`yes`/`no` for booleans as well
fn parse_flag_or_value<T: FromStr>(value: &str) -> Option<T> {
    if let Ok(parsed) = value.trim().parse::<T>() {
        return Some(parsed);
    }

    let normalized = match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "on" => "true",
        "0" | "no" | "off" => "false",
        _ => return None,
    };
    normalized.parse::<T>().ok()
}

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<ServerConfig> {
        debug!("Loading configuration from environment variables with prefix: {}", self.prefix);

        let mut values = ConfigValues::default();

        if let Some(listen) = self.var("LISTEN") {
            match parse_socket_addr(&listen) {
                Ok(addr) => values.listen = Some(addr),
                Err(e) => warn!("Invalid listen address in environment: {}", e),
            }
        }

        values.ssl = self.parsed("SSL");
        values.plain = self.parsed("PLAIN");
        values.protocols = self.var("PROTOCOLS").map(|v| parse_protocol_list(&v));
        values.npn_protocols = self.var("NPN_PROTOCOLS").map(|v| parse_protocol_list(&v));
        values.default_protocol = self.var("DEFAULT_PROTOCOL");
        values.log_level = self.var("LOG_LEVEL");
        values.detect_timeout = self.parsed("DETECT_TIMEOUT");
        values.max_header_size = self.parsed("MAX_HEADER_SIZE");
        values.max_body_size = self.parsed("MAX_BODY_SIZE");
        values.x_forwarded_for = self.parsed("X_FORWARDED_FOR");
        values.cert = self.var("CERT").map(PathBuf::from);
        values.key = self.var("KEY").map(PathBuf::from);

        let mut config = ServerConfig::from_values(values);
        track_sources(&mut config, self.source_type());

        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Environment
    }
}

/// Command line configuration source
///
/// The binary parses its arguments with clap and hands the resulting values
/// over; fields left `None` fall through to lower priority sources.
pub struct CliSource {
    pub values: ConfigValues,
}

impl CliSource {
    /// Create a new command line source
    pub fn new(values: ConfigValues) -> Self {
        Self { values }
    }
}

impl ConfigSource for CliSource {
    fn load(&self) -> Result<ServerConfig> {
        debug!("Loading configuration from command line arguments");

        let mut config = ServerConfig {
            values: self.values.clone(),
            config_file: None,
            sources: HashMap::new(),
        };
        track_sources(&mut config, self.source_type());

        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::CommandLine
    }
}
