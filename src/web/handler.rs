//! HTTP default handler
//!
//! Parses HTTP/1.x requests off a socket, binds each request/response pair
//! and hands it to the [`Application`]. Raw connections are kept alive
//! between requests; adapted streams carry exactly one request.

use std::future::Future;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Request, StatusCode, Version};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::shim;
use super::ServerResponse;
use crate::common::{Result, SwitchError};
use crate::config::MAX_BODY_SIZE;
use crate::server::{BoxedIo, DefaultHandler, Socket, SocketInfo};

/// Most headers a single request may carry
const MAX_HEADERS: usize = 100;

/// Request handler the HTTP layer drives
pub trait Application: Send + Sync + 'static {
    /// Answer one request
    ///
    /// An error before the response head went out is answered with `500`.
    fn call(&self, request: Request<Bytes>, response: &mut ServerResponse<'_>) -> impl Future<Output = Result<()>> + Send;
}

/// Default handler speaking HTTP/1.x over sockets and adapted streams
pub struct HttpHandler<A> {
    app: Arc<A>,
    limits: Limits,
}

/// Size bounds applied while reading a request
#[derive(Debug, Clone, Copy)]
struct Limits {
    header: usize,
    body: usize,
}

impl<A: Application> HttpHandler<A> {
    /// Create a new handler
    ///
    /// # Parameters
    ///
    /// * `app` - Application answering requests
    /// * `max_header_size` - Largest accepted request head in bytes
    pub fn new(app: A, max_header_size: usize) -> Self {
        Self {
            app: Arc::new(app),
            limits: Limits {
                header: max_header_size,
                body: MAX_BODY_SIZE,
            },
        }
    }

    /// Set the largest accepted request body in bytes
    ///
    /// Larger bodies are answered with `413` before they are buffered.
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.limits.body = max_body_size;
        self
    }
}

impl<A: Application> DefaultHandler for HttpHandler<A> {
    fn handle(&self, socket: Socket) -> BoxFuture<'static, ()> {
        let app = self.app.clone();
        let limits = self.limits;

        Box::pin(async move {
            let id = socket.info.connection_id;
            if let Err(e) = serve(app, socket, limits).await {
                if e.is_disconnect() {
                    debug!("Peer of connection {} went away: {}", id, e);
                } else {
                    warn!("HTTP error on connection {}: {}", id, e);
                }
            }
        })
    }
}

/// Failure while reading a request
#[derive(Debug)]
enum ReadError {
    Malformed(String),
    TooLarge,
    BodyTooLarge,
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}

async fn serve<A: Application>(app: Arc<A>, socket: Socket, limits: Limits) -> Result<()> {
    let (mut io, info) = socket.into_parts();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let request = match read_request(&mut io, &mut buf, limits).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(ReadError::Io(e)) => return Err(e.into()),
            Err(ReadError::Malformed(reason)) => {
                debug!("Malformed request on connection {}: {}", info.connection_id, reason);
                reject(&mut io, StatusCode::BAD_REQUEST).await?;
                return Err(SwitchError::Http(reason));
            }
            Err(ReadError::TooLarge) => {
                reject(&mut io, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE).await?;
                return Err(SwitchError::Http("request head too large".to_string()));
            }
            Err(ReadError::BodyTooLarge) => {
                reject(&mut io, StatusCode::PAYLOAD_TOO_LARGE).await?;
                return Err(SwitchError::Http(format!(
                    "request body exceeds {} bytes",
                    limits.body
                )));
            }
        };

        let keep_alive = !info.is_stream() && wants_keep_alive(&request);
        if !respond(&*app, request, &info, &mut io, keep_alive).await? {
            if !info.is_stream() {
                io.shutdown().await?;
            }
            return Ok(());
        }
    }
}

/// Run the application for one request
///
/// # Returns
///
/// Whether the connection can carry another request
async fn respond<A: Application>(
    app: &A,
    mut request: Request<Bytes>,
    info: &SocketInfo,
    io: &mut BoxedIo,
    keep_alive: bool,
) -> Result<bool> {
    let mut response = shim::install(&mut request, info, io, keep_alive)?;

    if let Err(e) = app.call(request, &mut response).await {
        if response.head_sent() {
            return Err(e);
        }
        warn!("Application failed on connection {}: {}", info.connection_id, e);
        response.write_head(StatusCode::INTERNAL_SERVER_ERROR, Default::default())?;
        response.end(b"").await?;
        return Ok(false);
    }

    response.end(b"").await?;
    Ok(response.keep_alive())
}

async fn reject(io: &mut BoxedIo, status: StatusCode) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("Error")
    );
    io.write_all(head.as_bytes()).await?;
    io.shutdown().await?;
    Ok(())
}

fn wants_keep_alive<B>(request: &Request<B>) -> bool {
    let connection = request
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    match request.version() {
        Version::HTTP_11 => !connection.contains("close"),
        _ => connection.contains("keep-alive"),
    }
}

/// Parse the head at the front of `buf`
///
/// # Returns
///
/// The request head and its length in bytes, `None` while incomplete
fn parse_head(buf: &[u8], max_header_size: usize) -> std::result::Result<Option<(Request<()>, usize)>, ReadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= max_header_size {
                return Err(ReadError::TooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ReadError::TooLarge),
        Err(e) => return Err(ReadError::Malformed(e.to_string())),
    };

    if len > max_header_size {
        return Err(ReadError::TooLarge);
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(version);

    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ReadError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| ReadError::Malformed(e.to_string()))?;
        builder = builder.header(name, value);
    }

    let request = builder.body(()).map_err(|e| ReadError::Malformed(e.to_string()))?;
    Ok(Some((request, len)))
}

async fn fill(io: &mut BoxedIo, buf: &mut BytesMut) -> std::result::Result<(), ReadError> {
    buf.reserve(4096);
    if io.read_buf(buf).await? == 0 {
        return Err(ReadError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

/// Read one request with its body
///
/// # Returns
///
/// `None` when the peer closed the connection between requests
async fn read_request(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    limits: Limits,
) -> std::result::Result<Option<Request<Bytes>>, ReadError> {
    let (head, len) = loop {
        if !buf.is_empty() {
            if let Some(parsed) = parse_head(&buf[..], limits.header)? {
                break parsed;
            }
        }

        buf.reserve(4096);
        if io.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ReadError::Malformed("connection closed mid-request".to_string()));
        }
    };
    buf.advance(len);

    let chunked = head
        .headers()
        .get_all(TRANSFER_ENCODING)
        .iter()
        .last()
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().ends_with("chunked"))
        .unwrap_or(false);

    let body = if chunked {
        read_chunked(io, buf, limits).await?
    } else if let Some(length) = head.headers().get(CONTENT_LENGTH) {
        let length: usize = length
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ReadError::Malformed("invalid content-length".to_string()))?;
        if length > limits.body {
            return Err(ReadError::BodyTooLarge);
        }
        while buf.len() < length {
            fill(io, buf).await?;
        }
        buf.split_to(length).freeze()
    } else {
        Bytes::new()
    };

    let (parts, ()) = head.into_parts();
    Ok(Some(Request::from_parts(parts, body)))
}

async fn read_line(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    max_len: usize,
) -> std::result::Result<BytesMut, ReadError> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() > max_len {
            return Err(ReadError::TooLarge);
        }
        fill(io, buf).await?;
    }
}

async fn read_chunked(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    limits: Limits,
) -> std::result::Result<Bytes, ReadError> {
    let mut body = BytesMut::new();

    loop {
        let line = read_line(io, buf, limits.header).await?;
        let size = line[..].split(|b| *b == b';').next().unwrap_or_default();
        let size = std::str::from_utf8(size)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| ReadError::Malformed("invalid chunk size".to_string()))?;

        if size == 0 {
            // Trailers are read and dropped
            while !read_line(io, buf, limits.header).await?.is_empty() {}
            return Ok(body.freeze());
        }

        if size > limits.body - body.len() {
            return Err(ReadError::BodyTooLarge);
        }
        let end = size.checked_add(2).ok_or(ReadError::BodyTooLarge)?;

        while buf.len() < end {
            fill(io, buf).await?;
        }
        if &buf[size..end] != b"\r\n" {
            return Err(ReadError::Malformed("missing chunk terminator".to_string()));
        }
        body.extend_from_slice(&buf[..size]);
        buf.advance(end);
    }
}
