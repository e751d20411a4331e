//! Session engine interface
//!
//! The multiplexed session engine (framing, flow control, header
//! compression) is an external collaborator. It consumes a raw byte duplex
//! and emits discrete logical streams; this module defines the seam.

use std::future::Future;

use http::{HeaderMap, Method, Request, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{Result, SwitchError};
use crate::config::ConnectionOptions;
use crate::protocol::{ProtocolFamily, ProtocolVersion};
use crate::server::BoxedIo;

/// Options a session is constructed with
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Protocol family to speak
    pub family: ProtocolFamily,
    /// Server role (always true for accepted connections)
    pub is_server: bool,
    /// Pass-through options from the server configuration
    pub connection: ConnectionOptions,
}

impl SessionOptions {
    /// Server-role options for `family`
    pub fn server(family: ProtocolFamily, connection: ConnectionOptions) -> Self {
        Self {
            family,
            is_server: true,
            connection,
        }
    }
}

/// Request head of an inbound logical stream
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method
    pub method: Method,
    /// Request target, including the authority when the peer sent one
    pub uri: Uri,
    /// Request headers (pseudo headers excluded)
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Path and query, `/` when absent
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
    }

    /// Authority from the URI, falling back to the `host` header
    pub fn authority(&self) -> Option<&str> {
        self.uri
            .authority()
            .map(|a| a.as_str())
            .or_else(|| self.headers.get(http::header::HOST).and_then(|h| h.to_str().ok()))
    }
}

/// Session event
pub enum SessionEvent<S> {
    /// A new logical stream, announced once, before any of its data is read
    Stream(S),
    /// The session failed; the connection must be destroyed
    Error(SwitchError),
}

/// Factory of multiplexed sessions
pub trait SessionEngine: Send + Sync + 'static {
    /// Session type
    type Session: Session;

    /// Construct a session over `io`
    ///
    /// On failure the engine drops `io`, which closes the connection.
    fn create_session(&self, io: BoxedIo, options: SessionOptions) -> Result<Self::Session>;
}

/// One multiplexed session over one connection
pub trait Session: Send + 'static {
    /// Logical stream type
    type Stream: LogicalStream;

    /// Pin the protocol version instead of reading it from the wire
    fn pin_version(&mut self, version: ProtocolVersion);

    /// Version in effect, if settled
    fn version(&self) -> Option<ProtocolVersion>;

    /// Wait for the next session event
    ///
    /// `None` means the underlying socket closed. The returned future must be
    /// cancel safe: dropping it before completion loses no event.
    fn next_event(&mut self) -> impl Future<Output = Option<SessionEvent<Self::Stream>>> + Send;
}

/// One request/response pair inside a session
///
/// Reading yields the request body; writing sends response body data.
/// Shutting down the write side ends the stream.
pub trait LogicalStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Stream id within the session
    fn id(&self) -> u32;

    /// Request head
    fn head(&self) -> &RequestHead;

    /// Whether the peer already ended its side (no request body follows)
    fn is_end_stream(&self) -> bool;

    /// Send the response head
    fn respond(&mut self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()>;

    /// Start a server-initiated stream associated with this one
    fn push(&mut self, request: Request<()>) -> Result<Box<dyn PushedStream>>;

    /// Abort the stream
    fn reset(&mut self);
}

/// Server-initiated stream; writing sends its body, shutdown ends it
pub trait PushedStream: AsyncWrite + Send + Unpin {
    /// Send the pushed response head
    fn respond(&mut self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(uri: &str) -> RequestHead {
        RequestHead {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_request_head_path() {
        assert_eq!(head("https://example.com/a?b=1").path(), "/a?b=1");
        assert_eq!(head("https://example.com").path(), "/");
        assert_eq!(head("/only/path").path(), "/only/path");
    }

    #[test]
    fn test_request_head_authority() {
        assert_eq!(head("https://example.com:8443/").authority(), Some("example.com:8443"));

        let mut relative = head("/");
        assert_eq!(relative.authority(), None);
        relative.headers.insert(http::header::HOST, "fallback".parse().unwrap());
        assert_eq!(relative.authority(), Some("fallback"));
    }

    #[test]
    fn test_server_options() {
        let options = SessionOptions::server(ProtocolFamily::Http2, ConnectionOptions::default());
        assert!(options.is_server);
        assert_eq!(options.family, ProtocolFamily::Http2);
    }
}
