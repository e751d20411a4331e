//! Stream-socket adapter
//!
//! Wraps one logical stream so it satisfies the same contract as an accepted
//! connection: a readable and writable byte duplex that default handlers can
//! treat as a one-request socket.
//!
//! The read side presents the stream's request as an HTTP/1.1 message (a
//! synthesized request head followed by the body, chunk-encoded when the
//! length is unknown). The write side sends response body data, emitting an
//! implicit `200` head if nothing was sent yet.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BufMut, BytesMut};
use futures::future::BoxFuture;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Request, StatusCode};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use uuid::Uuid;

use crate::common::{Result, SwitchError};
use crate::protocol::ProtocolVersion;
use crate::server::{Dispatcher, Socket, SocketHandle, SocketInfo};
use crate::session::{LogicalStream, PushedStream, RequestHead};

/// Largest body slice pulled from the stream per read
const READ_CHUNK: usize = 8 * 1024;

/// Header appended when forwarding the parent connection's peer address
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Control surface of an adapted stream
///
/// Bound to the request (as an extension) and to the response of the pair
/// the stream carries.
pub trait StreamControl: Send + Sync {
    /// Stream id within its session
    fn stream_id(&self) -> u32;

    /// Version of the owning session
    fn protocol_version(&self) -> ProtocolVersion;

    /// Send the response head
    fn respond(&self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()>;

    /// Whether a response head went out already
    fn has_responded(&self) -> bool;

    /// Start a server push associated with this stream
    fn push(&self, request: Request<()>) -> Result<Box<dyn PushedStream>>;

    /// Tear the stream down; idempotent
    fn destroy(&self);

    /// Whether the stream was torn down
    fn is_destroyed(&self) -> bool;

    /// Resolves once the stream is torn down or dropped
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Shared handle to an adapted stream
pub type StreamHandle = Arc<dyn StreamControl>;

/// Connection-level facts every stream of a session inherits
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Id of the accepted connection
    pub connection_id: Uuid,
    /// Peer of the accepted connection
    pub peer_addr: Option<SocketAddr>,
    /// Whether the accepted connection went through TLS
    pub encrypted: bool,
    /// Protocol identifier the connection resolved to
    pub protocol: String,
    /// Session version reported to applications
    pub version: ProtocolVersion,
    /// Append `x-forwarded-for` to synthesized request heads
    pub x_forwarded_for: bool,
}

struct Inner<S> {
    stream: Option<S>,
    /// Synthesized head and chunk framing not yet handed to the reader
    pending: BytesMut,
    chunked: bool,
    body_done: bool,
    ready: bool,
    responded: bool,
    ended: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// State shared by the adapter socket and its handles
pub struct StreamShared<S> {
    id: u32,
    version: ProtocolVersion,
    inner: Mutex<Inner<S>>,
    destroyed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl<S: LogicalStream> StreamShared<S> {
    fn new(stream: S, ctx: &StreamContext) -> Arc<Self> {
        let head = stream.head();
        let end_of_stream = stream.is_end_stream();
        let chunked = !end_of_stream && !head.headers.contains_key(CONTENT_LENGTH);
        let forwarded_for = ctx.peer_addr.filter(|_| ctx.x_forwarded_for);
        let pending = synthesize_head(head, chunked, forwarded_for);

        trace!(
            "Stream {} of connection {}: {} {} (chunked: {})",
            stream.id(),
            ctx.connection_id,
            head.method,
            head.path(),
            chunked
        );

        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: stream.id(),
            version: ctx.version,
            inner: Mutex::new(Inner {
                stream: Some(stream),
                pending,
                chunked,
                body_done: end_of_stream,
                ready: false,
                responded: false,
                ended: false,
                read_waker: None,
                write_waker: None,
            }),
            destroyed: AtomicBool::new(false),
            closed_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make buffered and trailing inbound data visible to the reader
    fn signal_ready(&self) {
        let waker = {
            let mut inner = self.lock();
            inner.ready = true;
            inner.read_waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<S: LogicalStream> StreamControl for StreamShared<S> {
    fn stream_id(&self) -> u32 {
        self.id
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn respond(&self, status: StatusCode, headers: &HeaderMap, end_of_stream: bool) -> Result<()> {
        if self.is_destroyed() {
            return Err(SwitchError::Session(format!("stream {} was destroyed", self.id)));
        }

        let mut inner = self.lock();
        if inner.responded {
            return Err(SwitchError::Http(format!("response head of stream {} already sent", self.id)));
        }

        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| SwitchError::Session(format!("stream {} is gone", self.id)))?;
        stream.respond(status, headers, end_of_stream)?;

        inner.responded = true;
        inner.ended = end_of_stream;
        Ok(())
    }

    fn has_responded(&self) -> bool {
        self.lock().responded
    }

    fn push(&self, request: Request<()>) -> Result<Box<dyn PushedStream>> {
        if self.is_destroyed() {
            return Err(SwitchError::Session(format!("stream {} was destroyed", self.id)));
        }

        let mut inner = self.lock();
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| SwitchError::Session(format!("stream {} is gone", self.id)))?;
        stream.push(request)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (stream, ended, wakers) = {
            let mut inner = self.lock();
            let wakers = [inner.read_waker.take(), inner.write_waker.take()];
            (inner.stream.take(), inner.ended, wakers)
        };

        if let Some(mut stream) = stream {
            if !ended {
                stream.reset();
            }
        }

        debug!("Stream {} destroyed", self.id);
        self.closed_tx.send_replace(true);

        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed_tx.subscribe();
        Box::pin(async move {
            // Err means every sender is gone, i.e. the stream was dropped
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }
}

/// Render the stream's request as an HTTP/1.1 request head
fn synthesize_head(head: &RequestHead, chunked: bool, forwarded_for: Option<SocketAddr>) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);

    out.put_slice(head.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(head.path().as_bytes());
    out.put_slice(b" HTTP/1.1\r\n");

    if !head.headers.contains_key(HOST) {
        if let Some(authority) = head.uri.authority() {
            put_header(&mut out, HOST.as_str(), authority.as_str().as_bytes());
        }
    }

    for (name, value) in head.headers.iter() {
        if *name == TRANSFER_ENCODING || (forwarded_for.is_some() && *name == X_FORWARDED_FOR) {
            continue;
        }
        put_header(&mut out, name.as_str(), value.as_bytes());
    }

    if let Some(peer) = forwarded_for {
        let mut chain: Vec<u8> = Vec::new();
        for value in head.headers.get_all(X_FORWARDED_FOR) {
            chain.extend_from_slice(value.as_bytes());
            chain.extend_from_slice(b", ");
        }
        chain.extend_from_slice(peer.ip().to_string().as_bytes());
        put_header(&mut out, X_FORWARDED_FOR.as_str(), &chain);
    }

    if chunked {
        put_header(&mut out, TRANSFER_ENCODING.as_str(), b"chunked");
    }

    out.put_slice(b"\r\n");
    out
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

/// Socket-like duplex over one logical stream
pub struct StreamSocket<S> {
    shared: Arc<StreamShared<S>>,
}

impl<S: LogicalStream> StreamSocket<S> {
    /// Control handle of the wrapped stream
    pub fn handle(&self) -> StreamHandle {
        self.shared.clone()
    }
}

fn broken_pipe(id: u32) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("stream {} is closed", id))
}

impl<S: LogicalStream> AsyncRead for StreamSocket<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.get_mut().shared;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut inner = shared.lock();
        loop {
            if shared.is_destroyed() {
                return Poll::Ready(Ok(()));
            }

            if !inner.ready {
                inner.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            if !inner.pending.is_empty() {
                let len = inner.pending.len().min(buf.remaining());
                buf.put_slice(&inner.pending[..len]);
                inner.pending.advance(len);
                return Poll::Ready(Ok(()));
            }

            if inner.body_done {
                return Poll::Ready(Ok(()));
            }

            let Some(stream) = inner.stream.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            let mut chunk = [0u8; READ_CHUNK];
            let want = buf.remaining().min(READ_CHUNK);
            let mut body = ReadBuf::new(&mut chunk[..want]);

            match Pin::new(stream).poll_read(cx, &mut body) {
                Poll::Pending => {
                    inner.read_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let data = body.filled();
                    if data.is_empty() {
                        inner.body_done = true;
                        if inner.chunked {
                            inner.pending.put_slice(b"0\r\n\r\n");
                        }
                    } else if inner.chunked {
                        let size = format!("{:x}\r\n", data.len());
                        inner.pending.put_slice(size.as_bytes());
                        inner.pending.put_slice(data);
                        inner.pending.put_slice(b"\r\n");
                    } else {
                        inner.pending.put_slice(data);
                    }
                }
            }
        }
    }
}

impl<S: LogicalStream> AsyncWrite for StreamSocket<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.get_mut().shared;
        if shared.is_destroyed() {
            return Poll::Ready(Err(broken_pipe(shared.id)));
        }

        let mut inner = shared.lock();
        if inner.ended {
            return Poll::Ready(Err(broken_pipe(shared.id)));
        }

        let needs_head = !inner.responded;
        let Some(stream) = inner.stream.as_mut() else {
            return Poll::Ready(Err(broken_pipe(shared.id)));
        };

        if needs_head {
            trace!("Implicit 200 response head on stream {}", shared.id);
            if let Err(e) = stream.respond(StatusCode::OK, &HeaderMap::new(), false) {
                return Poll::Ready(Err(e.into()));
            }
        }

        let result = Pin::new(stream).poll_write(cx, data);
        inner.responded = true;
        if result.is_pending() {
            inner.write_waker = Some(cx.waker().clone());
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let shared = &self.get_mut().shared;
        if shared.is_destroyed() {
            return Poll::Ready(Ok(()));
        }

        let mut inner = shared.lock();
        match inner.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let shared = &self.get_mut().shared;
        if shared.is_destroyed() {
            return Poll::Ready(Ok(()));
        }

        let mut inner = shared.lock();
        if inner.ended {
            return Poll::Ready(Ok(()));
        }

        let responded = inner.responded;
        let Some(stream) = inner.stream.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        if !responded {
            // Nothing was written: the head alone ends the stream
            let result = stream.respond(StatusCode::OK, &HeaderMap::new(), true);
            inner.responded = true;
            inner.ended = true;
            return Poll::Ready(result.map_err(io::Error::from));
        }

        let result = Pin::new(stream).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = result {
            inner.ended = true;
        }
        result
    }
}

/// Adapt one announced stream and hand it to the default handlers
///
/// The adapter is handed to the dispatcher first and only afterwards told
/// that its inbound data is visible, so no byte can be read before a handler
/// owns the socket.
///
/// # Returns
///
/// A weak reference for session teardown and the handler's future.
pub fn dispatch<S: LogicalStream>(
    stream: S,
    ctx: &StreamContext,
    dispatcher: &Dispatcher,
) -> (Weak<StreamShared<S>>, BoxFuture<'static, ()>) {
    let shared = StreamShared::new(stream, ctx);
    let handle: StreamHandle = shared.clone();

    let info = SocketInfo {
        connection_id: ctx.connection_id,
        peer_addr: ctx.peer_addr,
        encrypted: ctx.encrypted,
        readable: true,
        writable: true,
        allow_half_open: true,
        protocol: Some(ctx.protocol.clone()),
        handle: SocketHandle::Stream(handle),
    };
    let socket = Socket::new(Box::new(StreamSocket { shared: shared.clone() }), info);

    let task = dispatcher.dispatch(socket);
    shared.signal_ready();

    (Arc::downgrade(&shared), task)
}
