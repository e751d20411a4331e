//! Peeking buffer layered ahead of plaintext sockets
//!
//! Bytes read for sniffing are kept and replayed to whoever reads the stream
//! next, so classification never consumes application data.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Read granularity while sniffing
const PEEK_CHUNK: usize = 1024;

/// Stream wrapper replaying previously peeked bytes
#[derive(Debug)]
pub struct PeekStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> PeekStream<S> {
    /// Wrap a stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// Bytes peeked so far and not yet replayed
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Read more bytes into the peek buffer
    ///
    /// # Returns
    ///
    /// The number of bytes added; zero means the peer closed its side.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buffer.reserve(PEEK_CHUNK);
        self.inner.read_buf(&mut self.buffer).await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if !this.buffer.is_empty() {
            let len = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..len]);
            this.buffer.advance(len);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peeked_bytes_are_replayed() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut peek = PeekStream::new(server);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let n = peek.fill().await.unwrap();
        assert!(n > 0);
        assert_eq!(peek.buffered()[0], b'G');

        client.write_all(b"\r\n").await.unwrap();
        drop(client);

        let mut all = Vec::new();
        peek.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET / HTTP/1.1\r\n\r\n");
        assert!(peek.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_fill_reports_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut peek = PeekStream::new(server);
        assert_eq!(peek.fill().await.unwrap(), 0);
    }
}
