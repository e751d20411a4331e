//! HTTP/2 session engine
//!
//! Reference [`SessionEngine`] built on the `h2` crate. Only the HTTP/2
//! family is supported; asking it for a SPDY session fails construction,
//! which closes the connection.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use h2::server::{self, Connection, Handshake, SendPushedResponse, SendResponse};
use h2::{Reason, RecvStream, SendStream};
use http::{HeaderMap, Request, Response, StatusCode};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::engine::{
    LogicalStream, PushedStream, RequestHead, Session, SessionEngine, SessionEvent, SessionOptions,
};
use crate::common::{Result, SwitchError};
use crate::protocol::{ProtocolFamily, ProtocolVersion};
use crate::server::BoxedIo;
use crate::web::strip_hop_by_hop;

/// Valid range of SETTINGS_MAX_FRAME_SIZE
const MAX_FRAME_SIZE_RANGE: std::ops::RangeInclusive<u32> = 16_384..=16_777_215;

/// Largest valid SETTINGS_INITIAL_WINDOW_SIZE
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 session engine
#[derive(Debug, Clone, Default)]
pub struct H2Engine;

impl H2Engine {
    /// Create a new engine
    pub fn new() -> Self {
        Self
    }
}

impl SessionEngine for H2Engine {
    type Session = H2Session;

    fn create_session(&self, io: BoxedIo, options: SessionOptions) -> Result<H2Session> {
        if options.family != ProtocolFamily::Http2 {
            return Err(SwitchError::Session(format!(
                "{} sessions are not supported by the HTTP/2 engine",
                options.family
            )));
        }

        if !options.is_server {
            return Err(SwitchError::Session("client sessions are not supported".to_string()));
        }

        let connection = &options.connection;
        let mut builder = server::Builder::new();

        if let Some(streams) = connection.max_concurrent_streams {
            builder.max_concurrent_streams(streams);
        }

        if let Some(window) = connection.initial_window_size {
            if window > MAX_WINDOW_SIZE {
                return Err(SwitchError::Config(format!("initial_window_size {} is out of range", window)));
            }
            builder.initial_window_size(window);
        }

        if let Some(frame) = connection.max_frame_size {
            if !MAX_FRAME_SIZE_RANGE.contains(&frame) {
                return Err(SwitchError::Config(format!("max_frame_size {} is out of range", frame)));
            }
            builder.max_frame_size(frame);
        }

        for key in connection.extra.keys() {
            debug!("Ignoring session option {} not understood by the HTTP/2 engine", key);
        }

        Ok(H2Session {
            state: State::Handshaking(Box::pin(builder.handshake(io))),
            version: None,
        })
    }
}

enum State {
    Handshaking(Pin<Box<Handshake<BoxedIo, Bytes>>>),
    Ready(Connection<BoxedIo, Bytes>),
    Closed,
}

/// HTTP/2 session over one connection
pub struct H2Session {
    state: State,
    version: Option<ProtocolVersion>,
}

impl Session for H2Session {
    type Stream = H2Stream;

    fn pin_version(&mut self, version: ProtocolVersion) {
        if version != ProtocolVersion::Http2 {
            debug!("HTTP/2 session ignores pinned version {}", version);
            return;
        }
        self.version = Some(version);
    }

    fn version(&self) -> Option<ProtocolVersion> {
        Some(self.version.unwrap_or(ProtocolVersion::Http2))
    }

    async fn next_event(&mut self) -> Option<SessionEvent<H2Stream>> {
        loop {
            match &mut self.state {
                State::Handshaking(handshake) => match handshake.as_mut().await {
                    Ok(connection) => {
                        trace!("HTTP/2 handshake complete");
                        self.state = State::Ready(connection);
                    }
                    Err(e) => {
                        self.state = State::Closed;
                        return Some(SessionEvent::Error(e.into()));
                    }
                },
                State::Ready(connection) => match connection.accept().await {
                    Some(Ok((request, respond))) => {
                        return Some(SessionEvent::Stream(H2Stream::new(request, respond)));
                    }
                    Some(Err(e)) => {
                        self.state = State::Closed;
                        if e.is_go_away() && e.reason() == Some(Reason::NO_ERROR) {
                            return None;
                        }
                        return Some(SessionEvent::Error(e.into()));
                    }
                    None => {
                        self.state = State::Closed;
                        return None;
                    }
                },
                State::Closed => return None,
            }
        }
    }
}

/// Write as much of `data` as the flow-control window allows
fn poll_send(send: &mut SendStream<Bytes>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
    if data.is_empty() {
        return Poll::Ready(Ok(0));
    }

    send.reserve_capacity(data.len());
    loop {
        match ready!(send.poll_capacity(cx)) {
            Some(Ok(0)) => {}
            Some(Ok(capacity)) => {
                let len = capacity.min(data.len());
                send.send_data(Bytes::copy_from_slice(&data[..len]), false)
                    .map_err(|e| io::Error::from(SwitchError::from(e)))?;
                return Poll::Ready(Ok(len));
            }
            Some(Err(e)) => return Poll::Ready(Err(SwitchError::from(e).into())),
            None => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")));
            }
        }
    }
}

fn build_response(status: StatusCode, headers: &HeaderMap) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.headers_mut() = strip_hop_by_hop(headers);
    response
}

/// One HTTP/2 request/response pair
pub struct H2Stream {
    id: u32,
    head: RequestHead,
    body: RecvStream,
    respond: SendResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
    received: Bytes,
    recv_done: bool,
    send_done: bool,
}

impl H2Stream {
    fn new(request: Request<RecvStream>, respond: SendResponse<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let recv_done = body.is_end_stream();

        Self {
            id: respond.stream_id().as_u32(),
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
            },
            body,
            respond,
            send: None,
            received: Bytes::new(),
            recv_done,
            send_done: false,
        }
    }
}

impl LogicalStream for H2Stream {
    fn id(&self) -> u32 {
        self.id
    }

    fn head(&self) -> &RequestHead {
        &self.head
    }

    fn is_end_stream(&self) -> bool {
        self.recv_done
    }

    fn respond(&mut self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()> {
        if self.send.is_some() || self.send_done {
            return Err(SwitchError::Http(format!("response head of stream {} already sent", self.id)));
        }

        let send = self
            .respond
            .send_response(build_response(status, headers), end_of_stream)?;

        if end_of_stream {
            self.send_done = true;
        } else {
            self.send = Some(send);
        }
        Ok(())
    }

    fn push(&mut self, request: Request<()>) -> Result<Box<dyn PushedStream>> {
        let pushed = self.respond.push_request(request)?;
        Ok(Box::new(H2Pushed { respond: pushed, send: None }))
    }

    fn reset(&mut self) {
        match self.send.as_mut() {
            Some(send) => send.send_reset(Reason::CANCEL),
            None if !self.send_done => self.respond.send_reset(Reason::CANCEL),
            None => {}
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.received.is_empty() {
                let len = this.received.len().min(buf.remaining());
                buf.put_slice(&this.received[..len]);
                this.received.advance(len);
                return Poll::Ready(Ok(()));
            }

            if this.recv_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.body.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.body.flow_control().release_capacity(data.len());
                    this.received = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(SwitchError::from(e).into())),
                None => this.recv_done = true,
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.send.as_mut() {
            Some(send) => poll_send(send, cx, data),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response head not sent",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the connection
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut send) = this.send.take() {
            send.send_data(Bytes::new(), true)
                .map_err(|e| io::Error::from(SwitchError::from(e)))?;
            this.send_done = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Server-pushed HTTP/2 stream
struct H2Pushed {
    respond: SendPushedResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
}

impl PushedStream for H2Pushed {
    fn respond(&mut self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()> {
        if self.send.is_some() {
            return Err(SwitchError::Http("pushed response head already sent".to_string()));
        }

        let send = self
            .respond
            .send_response(build_response(status, headers), end_of_stream)?;
        if !end_of_stream {
            self.send = Some(send);
        }
        Ok(())
    }
}

impl AsyncWrite for H2Pushed {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.send.as_mut() {
            Some(send) => poll_send(send, cx, data),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pushed response head not sent",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut send) = this.send.take() {
            send.send_data(Bytes::new(), true)
                .map_err(|e| io::Error::from(SwitchError::from(e)))?;
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;

    fn options(family: ProtocolFamily, connection: ConnectionOptions) -> SessionOptions {
        SessionOptions::server(family, connection)
    }

    fn io() -> BoxedIo {
        let (_, server) = tokio::io::duplex(64);
        Box::new(server)
    }

    #[tokio::test]
    async fn test_spdy_family_rejected() {
        let result = H2Engine::new().create_session(io(), options(ProtocolFamily::Spdy, ConnectionOptions::default()));
        assert!(matches!(result, Err(SwitchError::Session(_))));
    }

    #[tokio::test]
    async fn test_invalid_frame_size_rejected() {
        let connection = ConnectionOptions {
            max_frame_size: Some(1024),
            ..Default::default()
        };
        let result = H2Engine::new().create_session(io(), options(ProtocolFamily::Http2, connection));
        assert!(matches!(result, Err(SwitchError::Config(_))));
    }

    #[tokio::test]
    async fn test_version_is_http2() {
        let mut session = H2Engine::new()
            .create_session(io(), options(ProtocolFamily::Http2, ConnectionOptions::default()))
            .unwrap();
        session.pin_version(ProtocolVersion::Spdy3);
        assert_eq!(session.version(), Some(ProtocolVersion::Http2));
    }

    #[tokio::test]
    async fn test_closed_socket_ends_session() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut session = H2Engine::new()
            .create_session(Box::new(server), options(ProtocolFamily::Http2, ConnectionOptions::default()))
            .unwrap();
        // The handshake fails on a closed socket
        assert!(matches!(session.next_event().await, Some(SessionEvent::Error(_))));
        assert!(session.next_event().await.is_none());
    }
}
