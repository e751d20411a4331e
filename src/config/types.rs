//! Configuration types
//!
//! This module contains the main configuration types used throughout the crate.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::defaults::{
    self, CERT_PATH_STR, DETECT_TIMEOUT_MS, KEY_PATH_STR, LISTEN_STR, LOG_LEVEL_STR, MAX_BODY_SIZE,
    MAX_HEADER_SIZE,
};
use crate::config::error::{ConfigError, Result};

/// Source of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueSource {
    /// Default value
    Default,
    /// From configuration file
    File,
    /// From environment variable
    Environment,
    /// From command line argument
    CommandLine,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Default => write!(f, "default"),
            ValueSource::File => write!(f, "file"),
            ValueSource::Environment => write!(f, "environment"),
            ValueSource::CommandLine => write!(f, "command line"),
        }
    }
}

/// Custom deserializer for socket addresses
fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<Option<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(addr_str) => parse_socket_addr(&addr_str)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Parse a socket address string
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // First try to parse as a socket address
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // If that fails, try to resolve using ToSocketAddrs
    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs.next().ok_or_else(|| ConfigError::InvalidValue(
            "socket_addr".to_string(),
            format!("Could not resolve address: {}", addr),
        )),
        Err(e) => Err(ConfigError::InvalidValue(
            "socket_addr".to_string(),
            format!("Invalid socket address '{}': {}", addr, e),
        )),
    }
}

/// Parse a comma separated protocol list, dropping empty entries
pub fn parse_protocol_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Session construction options
///
/// Known knobs are typed; anything else is forwarded verbatim to the
/// session engine in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Maximum concurrently open streams per session
    #[serde(default)]
    pub max_concurrent_streams: Option<u32>,

    /// Initial per-stream flow control window
    #[serde(default)]
    pub initial_window_size: Option<u32>,

    /// Largest frame payload the session accepts
    #[serde(default)]
    pub max_frame_size: Option<u32>,

    /// Engine specific options
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Configuration values
///
/// Contains all configuration values with their optional state.
///
/// # Protocol Configuration
///
/// `protocols` is the ALPN list and `npn_protocols` its legacy counterpart.
/// Both describe the same offer and are merged into one ordered list, ALPN
/// entries first; the first registered identifier wins during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigValues {
    // --- Network settings ---

    /// Listen address (host:port)
    #[serde(default, deserialize_with = "deserialize_socket_addr")]
    pub listen: Option<SocketAddr>,

    /// Terminate TLS on accepted connections
    #[serde(default)]
    pub ssl: Option<bool>,

    /// Sniff plaintext connections for SPDY and HTTP/2
    #[serde(default)]
    pub plain: Option<bool>,

    // --- Protocol settings ---

    /// Offered protocol identifiers, in preference order
    #[serde(default, alias = "alpn_protocols")]
    pub protocols: Option<Vec<String>>,

    /// Legacy NPN protocol list, merged after `protocols`
    #[serde(default)]
    pub npn_protocols: Option<Vec<String>>,

    /// Protocol forced when negotiation yields nothing
    #[serde(default, alias = "protocol")]
    pub default_protocol: Option<String>,

    /// Options forwarded to the session engine
    #[serde(default)]
    pub connection: Option<ConnectionOptions>,

    // --- General settings ---

    /// Log level (error, warn, info, debug, trace)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Time allowed for a plaintext prefix to become classifiable, in milliseconds
    #[serde(default)]
    pub detect_timeout: Option<u64>,

    /// Upper bound of an HTTP/1 request head, in bytes
    #[serde(default)]
    pub max_header_size: Option<usize>,

    /// Upper bound of an HTTP/1 request body, in bytes
    #[serde(default)]
    pub max_body_size: Option<usize>,

    /// Add `x-forwarded-for` to requests carried by multiplexed streams
    #[serde(default)]
    pub x_forwarded_for: Option<bool>,

    // --- Certificate settings ---

    /// Server certificate chain (PEM)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Server configuration
///
/// Immutable once a server has been created from it; shared as `Arc<ServerConfig>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Configuration values
    pub values: ConfigValues,

    /// Configuration file path
    pub config_file: Option<PathBuf>,

    /// Source tracking for configuration values
    pub sources: HashMap<String, ValueSource>,
}

impl Deref for ServerConfig {
    type Target = ConfigValues;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl Serialize for ServerConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let values = ConfigValues::deserialize(deserializer)?;
        Ok(Self::from_values(values))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut config = Self::from_values(ConfigValues::default());

        // Apply default values and track their source
        config.set_default_values();

        config
    }
}

impl ServerConfig {
    /// Wrap raw values without applying defaults
    pub fn from_values(values: ConfigValues) -> Self {
        Self {
            values,
            config_file: None,
            sources: HashMap::new(),
        }
    }

    /// Set default values for all configuration options
    pub fn set_default_values(&mut self) {
        macro_rules! default_field {
            ($name:ident, $value:expr) => {
                if self.values.$name.is_none() {
                    self.values.$name = Some($value);
                    self.sources.insert(stringify!($name).to_string(), ValueSource::Default);
                }
            };
        }

        if self.values.listen.is_none() {
            // LISTEN_STR is a literal socket address, parsing cannot fail
            if let Ok(addr) = LISTEN_STR.parse::<SocketAddr>() {
                self.values.listen = Some(addr);
                self.sources.insert("listen".to_string(), ValueSource::Default);
            }
        }

        default_field!(ssl, true);
        default_field!(plain, false);
        default_field!(protocols, defaults::protocols());
        default_field!(log_level, LOG_LEVEL_STR.to_string());
        default_field!(detect_timeout, DETECT_TIMEOUT_MS);
        default_field!(max_header_size, MAX_HEADER_SIZE);
        default_field!(max_body_size, MAX_BODY_SIZE);
        default_field!(x_forwarded_for, false);
        default_field!(cert, PathBuf::from(CERT_PATH_STR));
        default_field!(key, PathBuf::from(KEY_PATH_STR));
    }

    /// Get the source of a configuration value
    pub fn source(&self, name: &str) -> String {
        match self.sources.get(name) {
            Some(source) => source.to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Get the listen address
    pub fn listen(&self) -> SocketAddr {
        self.values
            .listen
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8443)))
    }

    /// Whether accepted connections are TLS
    pub fn ssl(&self) -> bool {
        self.values.ssl.unwrap_or(true)
    }

    /// Whether plaintext connections are sniffed
    pub fn plain(&self) -> bool {
        self.values.plain.unwrap_or(false)
    }

    /// Merged protocol list: ALPN entries first, then NPN extras, without duplicates
    pub fn protocols(&self) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        let alpn = self.values.protocols.iter().flatten();
        let npn = self.values.npn_protocols.iter().flatten();

        for protocol in alpn.chain(npn) {
            if !protocol.is_empty() && !merged.contains(protocol) {
                merged.push(protocol.clone());
            }
        }

        merged
    }

    /// Protocol forced when negotiation yields nothing
    pub fn default_protocol(&self) -> Option<&str> {
        self.values.default_protocol.as_deref().filter(|p| !p.is_empty())
    }

    /// Options forwarded to the session engine
    pub fn connection(&self) -> ConnectionOptions {
        self.values.connection.clone().unwrap_or_default()
    }

    /// Get the log level
    pub fn log_level(&self) -> &str {
        self.values.log_level.as_deref().unwrap_or(LOG_LEVEL_STR)
    }

    /// Time allowed for a plaintext prefix to become classifiable
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.values.detect_timeout.unwrap_or(DETECT_TIMEOUT_MS))
    }

    /// Upper bound of an HTTP/1 request head
    pub fn max_header_size(&self) -> usize {
        self.values.max_header_size.unwrap_or(MAX_HEADER_SIZE)
    }

    /// Upper bound of an HTTP/1 request body
    pub fn max_body_size(&self) -> usize {
        self.values.max_body_size.unwrap_or(MAX_BODY_SIZE)
    }

    /// Whether `x-forwarded-for` is added to multiplexed requests
    pub fn x_forwarded_for(&self) -> bool {
        self.values.x_forwarded_for.unwrap_or(false)
    }

    /// Get the certificate path
    pub fn cert(&self) -> &Path {
        self.values.cert.as_deref().unwrap_or_else(|| Path::new(CERT_PATH_STR))
    }

    /// Get the private key path
    pub fn key(&self) -> &Path {
        self.values.key.as_deref().unwrap_or_else(|| Path::new(KEY_PATH_STR))
    }

    /// Get the configuration file path
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Merge two configurations
    ///
    /// Fields set in `other` override this configuration and are attributed to `source`.
    pub fn merge(&self, other: &ServerConfig, source: ValueSource) -> Self {
        let mut result = self.clone();

        macro_rules! merge_field {
            ($name:ident) => {
                if other.values.$name.is_some() {
                    result.values.$name = other.values.$name.clone();
                    result.sources.insert(stringify!($name).to_string(), source);
                }
            };
        }

        merge_field!(listen);
        merge_field!(ssl);
        merge_field!(plain);
        merge_field!(protocols);
        merge_field!(npn_protocols);
        merge_field!(default_protocol);
        merge_field!(connection);
        merge_field!(log_level);
        merge_field!(detect_timeout);
        merge_field!(max_header_size);
        merge_field!(max_body_size);
        merge_field!(x_forwarded_for);
        merge_field!(cert);
        merge_field!(key);

        if let Some(path) = &other.config_file {
            result.config_file = Some(path.clone());
        }

        result
    }

    /// Log the configuration
    pub fn log(&self) {
        debug!("=== Configuration ===");
        debug!("  Listen address: {} (from {})", self.listen(), self.source("listen"));
        debug!("  TLS: {} (from {})", self.ssl(), self.source("ssl"));
        debug!("  Plaintext sniffing: {} (from {})", self.plain(), self.source("plain"));
        debug!("  Protocols: {} (from {})", self.protocols().join(","), self.source("protocols"));

        if let Some(protocol) = self.default_protocol() {
            debug!("  Default protocol: {} (from {})", protocol, self.source("default_protocol"));
        }

        debug!("  Log level: {} (from {})", self.log_level(), self.source("log_level"));
        debug!("  Detect timeout: {:?} (from {})", self.detect_timeout(), self.source("detect_timeout"));
        debug!("  Max header size: {} bytes (from {})", self.max_header_size(), self.source("max_header_size"));
        debug!("  Max body size: {} bytes (from {})", self.max_body_size(), self.source("max_body_size"));
        debug!("  X-Forwarded-For: {} (from {})", self.x_forwarded_for(), self.source("x_forwarded_for"));

        if self.ssl() {
            debug!("  Certificate: {} (from {})", self.cert().display(), self.source("cert"));
            debug!("  Private key: {} (from {})", self.key().display(), self.source("key"));
        }

        if let Some(file) = self.config_file() {
            debug!("  Configuration file: {}", file.display());
        }

        debug!("=====================");
    }
}
