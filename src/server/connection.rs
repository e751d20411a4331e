//! Connection pipeline
//!
//! Takes one accepted socket from TLS handshake or sniffing through protocol
//! resolution to either the default handlers or a multiplexed session.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use metrics::counter;
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use uuid::Uuid;

use super::handler::Dispatcher;
use super::peek::PeekStream;
use super::socket::{BoxedIo, Socket, SocketInfo};
use crate::common::{Result, SwitchError};
use crate::protocol::{
    DetectionResult, DetectionSource, PrefixSniffer, ProtocolDetector, Resolution, Resolver, Selection,
};
use crate::session::{Bootstrapper, SessionEngine};

/// Per-connection facts, created on accept
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Connection id
    pub id: Uuid,
    /// Remote peer
    pub peer_addr: Option<SocketAddr>,
    /// Whether the connection went through TLS
    pub encrypted: bool,
    /// Resolved protocol identifier, `None` when unrecognized
    pub protocol: Option<String>,
    /// How the identifier was determined
    pub source: DetectionSource,
}

/// Connection pipeline shared by every accepted connection
pub struct ConnectionPipeline<E: SessionEngine> {
    tls: Option<Arc<SslAcceptor>>,
    resolver: Resolver,
    sniffer: Box<dyn ProtocolDetector>,
    detect_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    bootstrapper: Bootstrapper<E>,
}

impl<E: SessionEngine> ConnectionPipeline<E> {
    /// Create a new pipeline
    ///
    /// # Parameters
    ///
    /// * `tls` - TLS acceptor, `None` for plaintext listeners
    /// * `resolver` - Negotiation resolver
    /// * `detect_timeout` - Time a peer gets to finish the TLS handshake, or
    ///   to send classifiable bytes on a plaintext connection
    /// * `dispatcher` - Default handlers
    /// * `bootstrapper` - Session bootstrapper
    pub fn new(
        tls: Option<Arc<SslAcceptor>>,
        resolver: Resolver,
        detect_timeout: Duration,
        dispatcher: Arc<Dispatcher>,
        bootstrapper: Bootstrapper<E>,
    ) -> Self {
        Self {
            tls,
            resolver,
            sniffer: Box::new(PrefixSniffer::default()),
            detect_timeout,
            dispatcher,
            bootstrapper,
        }
    }

    /// Replace the plaintext sniffer
    pub fn with_sniffer(mut self, sniffer: impl ProtocolDetector + 'static) -> Self {
        self.sniffer = Box::new(sniffer);
        self
    }

    /// Handle a single accepted connection until it closes
    ///
    /// # Parameters
    ///
    /// * `stream` - Accepted byte stream
    /// * `peer_addr` - Remote peer, if known
    ///
    /// # Returns
    ///
    /// Returns an error when the handshake, sniffing or the session failed;
    /// the socket is closed in every case.
    pub async fn handle_connection<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();

        let (io, encrypted, negotiated): (BoxedIo, bool, Option<String>) = match &self.tls {
            Some(acceptor) => {
                let ssl = Ssl::new(acceptor.context()).map_err(SwitchError::Ssl)?;
                let mut stream = SslStream::new(ssl, stream).map_err(SwitchError::Ssl)?;

                timeout(self.detect_timeout, Pin::new(&mut stream).accept())
                    .await
                    .map_err(|_| {
                        SwitchError::TlsHandshake(format!(
                            "not completed within {} ms",
                            self.detect_timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| SwitchError::TlsHandshake(e.to_string()))?;

                let negotiated = stream
                    .ssl()
                    .selected_alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned());
                debug!("TLS handshake with {:?} done, negotiated {:?}", peer_addr, negotiated);

                let io: BoxedIo = Box::new(stream);
                (io, true, negotiated)
            }
            None => {
                let io: BoxedIo = Box::new(stream);
                (io, false, None)
            }
        };

        let (io, resolution, source) = match self.resolver.select(encrypted, negotiated.as_deref()) {
            Selection::Decided { protocol, source } => (io, Resolution::classify(Some(&protocol)), source),
            Selection::Sniff => {
                let (io, label) = self.sniff(io).await?;
                (io, Resolution::classify(Some(label)), DetectionSource::Sniffed)
            }
            Selection::Undetermined => (io, Resolution::classify(None), DetectionSource::Undetermined),
        };

        let ctx = ConnectionContext {
            id,
            peer_addr,
            encrypted,
            protocol: resolution.protocol().map(str::to_string),
            source,
        };

        debug!(
            "Connection {} from {:?} resolved to {} ({})",
            id,
            peer_addr,
            ctx.protocol.as_deref().unwrap_or("<none>"),
            source
        );
        counter!(
            "mux_gate.connections",
            "protocol" => ctx.protocol.clone().unwrap_or_else(|| "none".to_string())
        )
        .increment(1);

        match resolution {
            Resolution::PassThrough { .. } => {
                let mut info = SocketInfo::raw(id, peer_addr, encrypted);
                info.protocol = ctx.protocol.clone();
                self.dispatcher.dispatch(Socket::new(io, info)).await;
                Ok(())
            }
            Resolution::Multiplexed { family, version, .. } => {
                self.bootstrapper.run(io, &ctx, family, version).await
            }
        }
    }

    /// Peek at the leading plaintext bytes until the sniffer is definitive
    ///
    /// The returned duplex replays every peeked byte to its next reader.
    async fn sniff(&self, io: BoxedIo) -> Result<(BoxedIo, &'static str)> {
        let mut peek = PeekStream::new(io);

        let label = timeout(self.detect_timeout, detect(self.sniffer.as_ref(), &mut peek))
            .await
            .map_err(|_| {
                SwitchError::Detection(format!("no classification within {} ms", self.detect_timeout.as_millis()))
            })??;

        let io: BoxedIo = Box::new(peek);
        Ok((io, label))
    }
}

async fn detect(sniffer: &dyn ProtocolDetector, peek: &mut PeekStream<BoxedIo>) -> Result<&'static str> {
    loop {
        if let DetectionResult::Protocol(label) = sniffer.detect(peek.buffered()) {
            return Ok(label);
        }

        if peek.fill().await? == 0 {
            return Err(SwitchError::Detection(format!(
                "connection closed after {} byte(s), before classification",
                peek.buffered().len()
            )));
        }
        trace!("Sniffing {} buffered byte(s)", peek.buffered().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::server::handler::{DefaultHandler, MockDefaultHandler};
    use crate::session::H2Engine;
    use futures::FutureExt;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pipeline(
        resolver: Resolver,
        handler: MockDefaultHandler,
    ) -> ConnectionPipeline<H2Engine> {
        let handlers: Vec<Arc<dyn DefaultHandler>> = vec![Arc::new(handler)];
        let dispatcher = Arc::new(Dispatcher::new(handlers).unwrap());
        let bootstrapper = Bootstrapper::new(
            Arc::new(H2Engine::new()),
            dispatcher.clone(),
            ConnectionOptions::default(),
            false,
        );
        ConnectionPipeline::new(None, resolver, Duration::from_millis(200), dispatcher, bootstrapper)
    }

    #[tokio::test]
    async fn test_plain_http_passes_through_with_bytes() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = seen.clone();

        let mut handler = MockDefaultHandler::new();
        handler.expect_accepts().return_const(true);
        handler.expect_handle().times(1).returning(move |socket| {
            let seen = seen_in_handler.clone();
            async move {
                let (mut io, info) = socket.into_parts();
                let mut data = vec![0u8; 16];
                io.read_exact(&mut data).await.unwrap();
                *seen.lock().unwrap() = Some((data, info.protocol.clone(), info.is_stream()));
            }
            .boxed()
        });

        let pipeline = pipeline(Resolver::new(None, true), handler);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        pipeline.handle_connection(server, None).await.unwrap();

        let (data, protocol, is_stream) = seen.lock().unwrap().take().unwrap();
        assert_eq!(&data, b"GET / HTTP/1.1\r\n");
        assert_eq!(protocol.as_deref(), Some("http/1.1"));
        assert!(!is_stream);
    }

    #[tokio::test]
    async fn test_sniff_eof_is_detection_error() {
        let mut handler = MockDefaultHandler::new();
        handler.expect_handle().never();

        let pipeline = pipeline(Resolver::new(None, true), handler);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"PRI * HTTP").await.unwrap();
        drop(client);

        let err = pipeline.handle_connection(server, None).await.unwrap_err();
        assert!(matches!(err, SwitchError::Detection(_)));
    }

    #[tokio::test]
    async fn test_sniff_timeout_is_detection_error() {
        let mut handler = MockDefaultHandler::new();
        handler.expect_handle().never();

        let pipeline = pipeline(Resolver::new(None, true), handler);
        let (_client, server) = tokio::io::duplex(1024);

        let err = pipeline.handle_connection(server, None).await.unwrap_err();
        assert!(matches!(err, SwitchError::Detection(_)));
    }

    #[tokio::test]
    async fn test_no_sniffing_without_plain_mode() {
        let mut handler = MockDefaultHandler::new();
        handler.expect_accepts().return_const(true);
        handler
            .expect_handle()
            .times(1)
            .withf(|socket| socket.info.protocol.is_none())
            .returning(|_| futures::future::ready(()).boxed());

        let pipeline = pipeline(Resolver::new(None, false), handler);
        let (_client, server) = tokio::io::duplex(1024);

        pipeline.handle_connection(server, None).await.unwrap();
    }
}
