//! Request/response shim
//!
//! Binds each request/response pair to the transport it arrived on. Pairs
//! from raw sockets answer with the HTTP/1.x serializer; pairs from adapted
//! streams answer through the stream's control handle and expose it to the
//! application.

use http::header::HOST;
use http::uri::{Authority, Scheme};
use http::{Method, Request};

use super::response::{PlainWriter, ResponseWriter, ServerResponse, StreamWriter};
use crate::common::{Result, SwitchError};
use crate::server::{BoxedIo, SocketHandle, SocketInfo};
use crate::stream::StreamHandle;

/// Transport facts attached to every request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestProtocol {
    /// Whether the request arrived over a multiplexed stream
    pub multiplexed: bool,
    /// Session version number, `1.0` for plain HTTP/1.x
    pub version: f32,
}

impl Default for RequestProtocol {
    fn default() -> Self {
        Self {
            multiplexed: false,
            version: 1.0,
        }
    }
}

/// Transport accessors on requests
pub trait RequestExt {
    /// Transport facts, plain HTTP/1.x when the request was never bound
    fn protocol(&self) -> RequestProtocol;

    /// Whether the request arrived over a multiplexed stream
    fn is_multiplexed(&self) -> bool {
        self.protocol().multiplexed
    }

    /// Control handle of the carrying stream
    fn stream_handle(&self) -> Option<&StreamHandle>;
}

impl<B> RequestExt for Request<B> {
    fn protocol(&self) -> RequestProtocol {
        self.extensions().get::<RequestProtocol>().copied().unwrap_or_default()
    }

    fn stream_handle(&self) -> Option<&StreamHandle> {
        self.extensions().get::<StreamHandle>()
    }
}

/// Bind a request/response pair to the socket it arrived on
///
/// # Parameters
///
/// * `request` - Parsed request, receives the transport extensions
/// * `info` - Description of the carrying socket
/// * `io` - Carrying socket
/// * `keep_alive` - Whether a raw connection stays open after the response
///
/// # Errors
///
/// Fails when the request was already bound.
pub fn install<'io, B>(
    request: &mut Request<B>,
    info: &SocketInfo,
    io: &'io mut BoxedIo,
    keep_alive: bool,
) -> Result<ServerResponse<'io>> {
    if request.extensions().get::<RequestProtocol>().is_some() {
        return Err(SwitchError::Http("request is already bound to a response".to_string()));
    }

    let push_base = push_base(request, info.encrypted);

    let writer: Box<dyn ResponseWriter + 'io> = match &info.handle {
        SocketHandle::Raw => {
            request.extensions_mut().insert(RequestProtocol::default());
            let head_request = request.method() == Method::HEAD;
            Box::new(PlainWriter::new(io, request.version(), keep_alive, head_request))
        }
        SocketHandle::Stream(handle) => {
            request.extensions_mut().insert(RequestProtocol {
                multiplexed: true,
                version: handle.protocol_version().number(),
            });
            request.extensions_mut().insert(handle.clone());
            Box::new(StreamWriter::new(io, handle.clone()))
        }
    };

    Ok(ServerResponse::new(writer, push_base))
}

fn push_base<B>(request: &Request<B>, encrypted: bool) -> Option<(Scheme, Authority)> {
    let authority = match request.uri().authority() {
        Some(authority) => authority.clone(),
        None => request.headers().get(HOST)?.to_str().ok()?.parse().ok()?,
    };
    let scheme = if encrypted { Scheme::HTTPS } else { Scheme::HTTP };
    Some((scheme, authority))
}
