//! Negotiation resolver
//!
//! Reconciles the TLS-negotiated protocol, the server's configured default and
//! the sniffed protocol into the single identifier that governs a connection,
//! then maps that identifier onto a session family and pinned version.

use std::fmt;

use log::{debug, trace};

use super::{H2, SPDY_2, SPDY_3, SPDY_3_1};

/// Multiplexed protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// SPDY, binary framed with a control bit
    Spdy,
    /// HTTP/2, announced by the client connection preface
    Http2,
}

impl ProtocolFamily {
    /// Version reported when the session has not settled on one yet
    pub fn default_version(&self) -> ProtocolVersion {
        match self {
            ProtocolFamily::Spdy => ProtocolVersion::Spdy31,
            ProtocolFamily::Http2 => ProtocolVersion::Http2,
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Spdy => write!(f, "spdy"),
            ProtocolFamily::Http2 => write!(f, "http2"),
        }
    }
}

/// Known protocol versions a session can be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// spdy/2
    Spdy2,
    /// spdy/3
    Spdy3,
    /// spdy/3.1
    Spdy31,
    /// h2
    Http2,
}

impl ProtocolVersion {
    /// Numeric version as reported to applications
    pub fn number(&self) -> f32 {
        match self {
            ProtocolVersion::Spdy2 => 2.0,
            ProtocolVersion::Spdy3 => 3.0,
            ProtocolVersion::Spdy31 => 3.1,
            ProtocolVersion::Http2 => 4.0,
        }
    }

    /// Family this version belongs to
    pub fn family(&self) -> ProtocolFamily {
        match self {
            ProtocolVersion::Http2 => ProtocolFamily::Http2,
            _ => ProtocolFamily::Spdy,
        }
    }

    /// Pin a version from an exact protocol identifier
    pub fn from_identifier(protocol: &str) -> Option<Self> {
        match protocol {
            SPDY_2 => Some(ProtocolVersion::Spdy2),
            SPDY_3 => Some(ProtocolVersion::Spdy3),
            SPDY_3_1 => Some(ProtocolVersion::Spdy31),
            H2 => Some(ProtocolVersion::Http2),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Spdy2 => write!(f, "{}", SPDY_2),
            ProtocolVersion::Spdy3 => write!(f, "{}", SPDY_3),
            ProtocolVersion::Spdy31 => write!(f, "{}", SPDY_3_1),
            ProtocolVersion::Http2 => write!(f, "{}", H2),
        }
    }
}

/// Where a connection's protocol identifier came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    /// TLS next-protocol negotiation
    Negotiated,
    /// Statically configured default protocol
    Default,
    /// Prefix sniffing of plaintext bytes
    Sniffed,
    /// Nothing determined a protocol
    Undetermined,
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionSource::Negotiated => write!(f, "negotiated"),
            DetectionSource::Default => write!(f, "default"),
            DetectionSource::Sniffed => write!(f, "sniffed"),
            DetectionSource::Undetermined => write!(f, "undetermined"),
        }
    }
}

/// Outcome of the first resolution step, taken before any byte is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The protocol is known without looking at the bytes
    Decided {
        /// Protocol identifier
        protocol: String,
        /// How it was decided
        source: DetectionSource,
    },
    /// The leading bytes must be sniffed
    Sniff,
    /// No protocol can be determined; the socket passes through
    Undetermined,
}

/// What the rest of the connection's life looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Hand the socket unchanged to the default handler
    PassThrough {
        /// The identifier that resolved to pass-through, if any
        protocol: Option<String>,
    },
    /// Bootstrap a multiplexed session
    Multiplexed {
        /// Protocol identifier
        protocol: String,
        /// Session family
        family: ProtocolFamily,
        /// Pinned version, `None` lets the engine read it from the wire
        version: Option<ProtocolVersion>,
    },
}

impl Resolution {
    /// Map a protocol identifier onto a family and pinned version
    ///
    /// Identifiers mentioning `spdy` belong to the SPDY family, the literal
    /// `h2` to HTTP/2; everything else (including `http/1.x`, unknown
    /// identifiers and no identifier at all) passes through.
    pub fn classify(protocol: Option<&str>) -> Self {
        let Some(protocol) = protocol else {
            return Resolution::PassThrough { protocol: None };
        };

        let family = if protocol.contains(super::SPDY) {
            ProtocolFamily::Spdy
        } else if protocol == H2 {
            ProtocolFamily::Http2
        } else {
            trace!("Protocol {} passes through to the default handler", protocol);
            return Resolution::PassThrough { protocol: Some(protocol.to_string()) };
        };

        let version = ProtocolVersion::from_identifier(protocol);
        if version.is_none() {
            debug!("No pinned version for {}, leaving it to the session", protocol);
        }

        Resolution::Multiplexed {
            protocol: protocol.to_string(),
            family,
            version,
        }
    }

    /// Whether a session has to be bootstrapped
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Resolution::Multiplexed { .. })
    }

    /// Protocol identifier, if any
    pub fn protocol(&self) -> Option<&str> {
        match self {
            Resolution::PassThrough { protocol } => protocol.as_deref(),
            Resolution::Multiplexed { protocol, .. } => Some(protocol),
        }
    }
}

/// Negotiation resolver
///
/// Holds the server-wide inputs of the decision; per-connection inputs are
/// passed to [`Resolver::select`].
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    /// Statically configured default protocol
    default_protocol: Option<String>,
    /// Whether plaintext connections are sniffed
    sniff_plaintext: bool,
}

impl Resolver {
    /// Create a new resolver
    ///
    /// # Parameters
    ///
    /// * `default_protocol` - Protocol forced when TLS negotiation yields nothing
    /// * `sniff_plaintext` - Sniff plaintext connections when no default applies
    pub fn new(default_protocol: Option<String>, sniff_plaintext: bool) -> Self {
        Self {
            default_protocol: default_protocol.filter(|p| !p.is_empty()),
            sniff_plaintext,
        }
    }

    /// Decide as much as possible before reading application bytes
    ///
    /// Rule order: an authoritative TLS negotiation result, then the
    /// configured default, then sniffing for plaintext connections.
    ///
    /// # Parameters
    ///
    /// * `secure` - Whether the connection went through a TLS handshake
    /// * `negotiated` - Protocol selected during the handshake, if any
    pub fn select(&self, secure: bool, negotiated: Option<&str>) -> Selection {
        if secure {
            if let Some(protocol) = negotiated.filter(|p| !p.is_empty()) {
                return Selection::Decided {
                    protocol: protocol.to_string(),
                    source: DetectionSource::Negotiated,
                };
            }
        }

        if let Some(protocol) = &self.default_protocol {
            return Selection::Decided {
                protocol: protocol.clone(),
                source: DetectionSource::Default,
            };
        }

        if !secure && self.sniff_plaintext {
            Selection::Sniff
        } else {
            Selection::Undetermined
        }
    }

    /// Configured default protocol
    pub fn default_protocol(&self) -> Option<&str> {
        self.default_protocol.as_deref()
    }

    /// Whether plaintext connections are sniffed
    pub fn sniffs_plaintext(&self) -> bool {
        self.sniff_plaintext
    }
}
