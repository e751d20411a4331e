//! Socket model handed to default connection handlers
//!
//! Raw accepted connections and adapted logical streams both reach the
//! default handlers as a [`Socket`]: a byte duplex plus a description of
//! where it came from.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::stream::StreamHandle;

/// Byte duplex usable by handlers
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased duplex
pub type BoxedIo = Box<dyn Duplex>;

/// What a socket really is underneath
#[derive(Clone)]
pub enum SocketHandle {
    /// An accepted connection, possibly behind TLS
    Raw,
    /// One logical stream of a multiplexed session
    Stream(StreamHandle),
}

impl SocketHandle {
    /// The stream handle, when the socket is an adapted stream
    pub fn stream(&self) -> Option<&StreamHandle> {
        match self {
            SocketHandle::Raw => None,
            SocketHandle::Stream(handle) => Some(handle),
        }
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketHandle::Raw => write!(f, "Raw"),
            SocketHandle::Stream(handle) => f
                .debug_struct("Stream")
                .field("id", &handle.stream_id())
                .field("version", &handle.protocol_version())
                .finish(),
        }
    }
}

/// Socket description
#[derive(Debug, Clone)]
pub struct SocketInfo {
    /// Id of the accepted connection (shared by all streams of a session)
    pub connection_id: Uuid,
    /// Remote peer of the accepted connection
    pub peer_addr: Option<SocketAddr>,
    /// Whether the accepted connection went through TLS
    pub encrypted: bool,
    /// Readable from construction
    pub readable: bool,
    /// Writable from construction
    pub writable: bool,
    /// Whether writing may continue after the peer finished sending
    pub allow_half_open: bool,
    /// Protocol identifier the connection resolved to, if any
    pub protocol: Option<String>,
    /// Raw connection or adapted stream
    pub handle: SocketHandle,
}

impl SocketInfo {
    /// Describe a raw accepted connection
    pub fn raw(connection_id: Uuid, peer_addr: Option<SocketAddr>, encrypted: bool) -> Self {
        Self {
            connection_id,
            peer_addr,
            encrypted,
            readable: true,
            writable: true,
            allow_half_open: false,
            protocol: None,
            handle: SocketHandle::Raw,
        }
    }

    /// Whether this socket is an adapted logical stream
    pub fn is_stream(&self) -> bool {
        matches!(self.handle, SocketHandle::Stream(_))
    }
}

/// Socket handed to default handlers
pub struct Socket {
    /// Byte duplex
    pub io: BoxedIo,
    /// Socket description
    pub info: SocketInfo,
}

impl Socket {
    /// Create a new socket
    pub fn new(io: BoxedIo, info: SocketInfo) -> Self {
        Self { io, info }
    }

    /// Split into duplex and description
    pub fn into_parts(self) -> (BoxedIo, SocketInfo) {
        (self.io, self.info)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("io", &"<duplex>")
            .field("info", &self.info)
            .finish()
    }
}
