//! Protocol detection module
//!
//! This module decides which application protocol a connection speaks:
//! the prefix sniffer classifies plaintext bytes, the resolver combines that
//! with TLS negotiation and the configured default.

mod negotiation;
mod sniffer;

pub use negotiation::{
    DetectionSource, ProtocolFamily, ProtocolVersion, Resolution, Resolver, Selection,
};
pub use sniffer::{DetectionResult, PrefixSniffer, ProtocolDetector, H2_PREFACE, SPDY_CONTROL_MARKER};

/// HTTP/2 identifier
pub const H2: &str = "h2";
/// SPDY family label used when the version is left to the wire
pub const SPDY: &str = "spdy";
/// SPDY draft 2
pub const SPDY_2: &str = "spdy/2";
/// SPDY draft 3
pub const SPDY_3: &str = "spdy/3";
/// SPDY draft 3.1
pub const SPDY_3_1: &str = "spdy/3.1";
/// HTTP/1.1
pub const HTTP_1_1: &str = "http/1.1";
/// HTTP/1.0
pub const HTTP_1_0: &str = "http/1.0";

/// Protocols offered when none are configured, in preference order
pub const DEFAULT_PROTOCOLS: &[&str] = &[H2, SPDY_3_1, SPDY_3, SPDY_2, HTTP_1_1, HTTP_1_0];
