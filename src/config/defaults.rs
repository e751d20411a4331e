//! Default configuration values
//!
//! Single source of truth for defaults, shared by the config types, the
//! environment source and the command line.

use crate::protocol::DEFAULT_PROTOCOLS;

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "MUX_GATE_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default listen address as string
pub const LISTEN_STR: &str = "0.0.0.0:8443";

/// Default certificate path as string
pub const CERT_PATH_STR: &str = "certs/server.crt";

/// Default private key path as string
pub const KEY_PATH_STR: &str = "certs/server.key";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default time allowed for a plaintext client to send a classifiable prefix (ms)
pub const DETECT_TIMEOUT_MS: u64 = 5_000;

/// Default upper bound of an HTTP/1 request head (bytes)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Default upper bound of an HTTP/1 request body (bytes)
pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Default protocol list, in preference order
pub fn protocols() -> Vec<String> {
    DEFAULT_PROTOCOLS.iter().map(|p| p.to_string()).collect()
}
