//! Server responses
//!
//! [`ServerResponse`] is what applications write to. The bytes go out
//! through a [`ResponseWriter`]: an HTTP/1.1 serializer for raw sockets or a
//! writer routed through the logical stream for multiplexed requests.

use bytes::BytesMut;
use futures::future::BoxFuture;
use http::header::{self, HeaderName, HeaderValue, CONTENT_LENGTH};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, Method, Request, StatusCode, Version};
use tokio::io::AsyncWriteExt;

use crate::common::{Result, SwitchError};
use crate::server::BoxedIo;
use crate::session::PushedStream;
use crate::stream::StreamHandle;

/// Connection-specific headers that never cross a multiplexed stream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

/// Copy `headers` without connection-specific entries
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut stripped = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            stripped.append(name.clone(), value.clone());
        }
    }
    stripped
}

/// Transport behind a [`ServerResponse`]
pub trait ResponseWriter: Send {
    /// Whether the response travels over a multiplexed stream
    fn is_multiplexed(&self) -> bool;

    /// Send the status line and headers
    ///
    /// `body_len` is the body length when it is known up front; `Some(0)`
    /// means the head is the whole response.
    fn send_head<'a>(
        &'a mut self,
        status: StatusCode,
        headers: &'a HeaderMap,
        body_len: Option<u64>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Send body bytes
    fn write_body<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Terminate the body
    fn finish(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Start a server push
    fn push(&mut self, request: Request<()>) -> Result<PushResponse>;

    /// Whether the transport can carry another request afterwards
    fn keep_alive(&self) -> bool;
}

/// HTTP/1.x serializer writing straight to a raw socket
pub struct PlainWriter<'io> {
    io: &'io mut BoxedIo,
    version: Version,
    keep_alive: bool,
    head_request: bool,
    chunked: bool,
}

impl<'io> PlainWriter<'io> {
    /// Create a writer answering a request of `version`
    pub fn new(io: &'io mut BoxedIo, version: Version, keep_alive: bool, head_request: bool) -> Self {
        Self {
            io,
            version,
            keep_alive,
            head_request,
            chunked: false,
        }
    }

    fn serialize_head(&mut self, status: StatusCode, headers: &HeaderMap, body_len: Option<u64>) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_str().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.extend_from_slice(b"\r\n");

        let has_length = headers.contains_key(CONTENT_LENGTH);
        if !has_length {
            match body_len {
                Some(len) => append_header(&mut out, CONTENT_LENGTH.as_str(), len.to_string().as_bytes()),
                None if self.version == Version::HTTP_11 => {
                    self.chunked = !self.head_request;
                    if self.chunked {
                        append_header(&mut out, header::TRANSFER_ENCODING.as_str(), b"chunked");
                    }
                }
                // Body delimited by closing the connection
                None => self.keep_alive = false,
            }
        }

        for (name, value) in headers.iter() {
            if *name == header::CONNECTION || *name == header::TRANSFER_ENCODING {
                continue;
            }
            append_header(&mut out, name.as_str(), value.as_bytes());
        }

        if !self.keep_alive {
            append_header(&mut out, header::CONNECTION.as_str(), b"close");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

fn append_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

impl ResponseWriter for PlainWriter<'_> {
    fn is_multiplexed(&self) -> bool {
        false
    }

    fn send_head<'a>(
        &'a mut self,
        status: StatusCode,
        headers: &'a HeaderMap,
        body_len: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let head = self.serialize_head(status, headers, body_len);
            self.io.write_all(&head).await?;
            Ok(())
        })
    }

    fn write_body<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if data.is_empty() || self.head_request {
                return Ok(());
            }

            if self.chunked {
                let size = format!("{:x}\r\n", data.len());
                self.io.write_all(size.as_bytes()).await?;
                self.io.write_all(data).await?;
                self.io.write_all(b"\r\n").await?;
            } else {
                self.io.write_all(data).await?;
            }
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.chunked {
                self.io.write_all(b"0\r\n\r\n").await?;
            }
            self.io.flush().await?;
            Ok(())
        })
    }

    fn push(&mut self, _request: Request<()>) -> Result<PushResponse> {
        Err(SwitchError::Http("server push requires a multiplexed stream".to_string()))
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Writer routed through a logical stream
///
/// The head goes through the stream's control handle, the body through the
/// adapter socket; shutting the socket down ends the stream.
pub struct StreamWriter<'io> {
    io: &'io mut BoxedIo,
    handle: StreamHandle,
    ended: bool,
}

impl<'io> StreamWriter<'io> {
    /// Create a writer for the stream behind `handle`
    pub fn new(io: &'io mut BoxedIo, handle: StreamHandle) -> Self {
        Self {
            io,
            handle,
            ended: false,
        }
    }
}

impl ResponseWriter for StreamWriter<'_> {
    fn is_multiplexed(&self) -> bool {
        true
    }

    fn send_head<'a>(
        &'a mut self,
        status: StatusCode,
        headers: &'a HeaderMap,
        body_len: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut headers = strip_hop_by_hop(headers);
            if let Some(len) = body_len {
                if !headers.contains_key(CONTENT_LENGTH) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
            }

            let end_of_stream = body_len == Some(0);
            self.handle.respond(status, &headers, end_of_stream)?;
            self.ended = end_of_stream;
            Ok(())
        })
    }

    fn write_body<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !data.is_empty() {
                self.io.write_all(data).await?;
            }
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.ended {
                self.io.shutdown().await?;
                self.ended = true;
            }
            Ok(())
        })
    }

    fn push(&mut self, request: Request<()>) -> Result<PushResponse> {
        let stream = self.handle.push(request)?;
        Ok(PushResponse::new(stream))
    }

    fn keep_alive(&self) -> bool {
        false
    }
}

/// Response handed to applications
///
/// `write_head` records the status and headers; they go out with the first
/// body write or with `end`, whichever comes first.
pub struct ServerResponse<'a> {
    writer: Box<dyn ResponseWriter + 'a>,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
    finished: bool,
    push_base: Option<(Scheme, Authority)>,
}

impl<'a> ServerResponse<'a> {
    /// Create a response over `writer`
    ///
    /// `push_base` is the scheme and authority pushed resources are resolved against.
    pub fn new(writer: Box<dyn ResponseWriter + 'a>, push_base: Option<(Scheme, Authority)>) -> Self {
        Self {
            writer,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            finished: false,
            push_base,
        }
    }

    /// Whether the response travels over a multiplexed stream
    pub fn is_multiplexed(&self) -> bool {
        self.writer.is_multiplexed()
    }

    /// Current status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers collected so far
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the head went out
    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    /// Whether the response was ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Set a single header, replacing previous values
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        if self.head_sent {
            return Err(SwitchError::Http("headers already sent".to_string()));
        }
        self.headers.insert(name, value);
        Ok(())
    }

    /// Set the status and merge `headers` into the response head
    pub fn write_head(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        if self.head_sent {
            return Err(SwitchError::Http("headers already sent".to_string()));
        }

        self.status = status;
        let mut last = None;
        for (name, value) in headers {
            // `None` names continue the previous header
            let name = match name {
                Some(name) => {
                    self.headers.remove(&name);
                    last = Some(name.clone());
                    name
                }
                None => match &last {
                    Some(name) => name.clone(),
                    None => continue,
                },
            };
            self.headers.append(name, value);
        }
        Ok(())
    }

    /// Send body bytes, sending the head first if needed
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SwitchError::Http("write after end".to_string()));
        }

        if !self.head_sent {
            self.head_sent = true;
            self.writer.send_head(self.status, &self.headers, None).await?;
        }

        self.writer.write_body(data).await
    }

    /// Send `data` as the last body bytes and end the response
    pub async fn end(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        if !self.head_sent {
            self.head_sent = true;
            self.writer
                .send_head(self.status, &self.headers, Some(data.len() as u64))
                .await?;
        }

        self.writer.write_body(data).await?;
        self.finished = true;
        self.writer.finish().await
    }

    /// Push `path` to the client, associated with this response
    ///
    /// # Errors
    ///
    /// Fails on non-multiplexed transports, when the request carried no
    /// authority, or when the peer refuses pushes.
    pub fn push(&mut self, path: &str, headers: HeaderMap) -> Result<PushResponse> {
        let (scheme, authority) = self
            .push_base
            .clone()
            .ok_or_else(|| SwitchError::Http("cannot push without a request authority".to_string()))?;

        let uri = http::Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path)
            .build()?;

        let mut request = Request::builder().method(Method::GET).uri(uri).body(())?;
        *request.headers_mut() = strip_hop_by_hop(&headers);

        self.writer.push(request)
    }

    /// Whether the connection can carry another request
    pub fn keep_alive(&self) -> bool {
        self.writer.keep_alive()
    }
}

/// Server-initiated response
pub struct PushResponse {
    stream: Box<dyn PushedStream>,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
    finished: bool,
}

impl PushResponse {
    /// Wrap a pushed stream
    pub fn new(stream: Box<dyn PushedStream>) -> Self {
        Self {
            stream,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            finished: false,
        }
    }

    /// Set the pushed status and headers
    pub fn write_head(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        if self.head_sent {
            return Err(SwitchError::Http("pushed headers already sent".to_string()));
        }
        self.status = status;
        self.headers = headers;
        Ok(())
    }

    /// Send pushed body bytes
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SwitchError::Http("write after end".to_string()));
        }
        if !self.head_sent {
            self.head_sent = true;
            self.stream.respond(self.status, &strip_hop_by_hop(&self.headers), false)?;
        }
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// End the pushed response
    pub async fn end(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if !self.head_sent {
            self.head_sent = true;
            return self.stream.respond(self.status, &strip_hop_by_hop(&self.headers), true);
        }
        self.stream.shutdown().await?;
        Ok(())
    }
}
