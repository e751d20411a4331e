//! Server facade
//!
//! Composes a TCP listener, an optional TLS acceptor, the negotiation
//! resolver, a session engine and the default handlers into one server.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::connection::ConnectionPipeline;
use super::handler::{DefaultHandler, Dispatcher};
use super::message::{create_channel, ServerHandle, ServerMessage};
use crate::common::{Result, SwitchError};
use crate::config::ServerConfig;
use crate::protocol::Resolver;
use crate::session::{Bootstrapper, SessionEngine};
use crate::tls::{create_tls_acceptor, get_cert_subject};

/// Time in-flight connections get to finish after a shutdown request
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol-switching server
pub struct Server<E: SessionEngine> {
    /// Server configuration
    config: Arc<ServerConfig>,
    /// Pipeline every accepted connection runs through
    pipeline: Arc<ConnectionPipeline<E>>,
}

impl<E: SessionEngine> Server<E> {
    /// Create a new server
    ///
    /// # Parameters
    ///
    /// * `config` - Server configuration
    /// * `engine` - Multiplexed session engine
    /// * `handlers` - Ordered default handlers, at least one
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no handler is given, and a TLS
    /// error when the certificate or key cannot be loaded.
    pub fn new(config: Arc<ServerConfig>, engine: E, handlers: Vec<Arc<dyn DefaultHandler>>) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(handlers)?);
        let protocols = config.protocols();

        let tls = if config.ssl() {
            let acceptor = create_tls_acceptor(config.cert(), config.key(), &protocols)?;
            match get_cert_subject(config.cert()) {
                Ok(subject) => info!("Serving certificate {}", subject),
                Err(e) => warn!("Could not read certificate subject: {}", e),
            }
            Some(Arc::new(acceptor))
        } else {
            if !config.plain() && config.default_protocol().is_none() {
                warn!("Neither TLS nor plaintext sniffing is enabled, every connection passes through");
            }
            None
        };

        let resolver = Resolver::new(config.default_protocol().map(str::to_string), config.plain());
        let bootstrapper = Bootstrapper::new(
            Arc::new(engine),
            dispatcher.clone(),
            config.connection(),
            config.x_forwarded_for(),
        );
        let pipeline = ConnectionPipeline::new(tls, resolver, config.detect_timeout(), dispatcher, bootstrapper);

        debug!("Server created with protocols {:?}", protocols);

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
        })
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the process exits
    ///
    /// # Errors
    ///
    /// Returns an error if it cannot bind to the listen address.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen()).await.map_err(SwitchError::Io)?;
        let (_sender, receiver) = create_channel();
        let (stopped, _) = watch::channel(false);
        self.serve(listener, receiver, stopped).await
    }

    /// Bind the configured address and serve in the background
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.listen()).await.map_err(SwitchError::Io)?;
        self.start_with_listener(listener)
    }

    /// Serve an already bound listener in the background
    ///
    /// # Returns
    ///
    /// Returns a handle to stop the server with
    pub fn start_with_listener(self, listener: TcpListener) -> Result<ServerHandle> {
        let local_addr = listener.local_addr().map_err(SwitchError::Io)?;
        let (sender, receiver) = create_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);

        tokio::spawn(async move {
            if let Err(e) = self.serve(listener, receiver, stopped_tx).await {
                error!("Server error: {}", e);
            }
        });

        Ok(ServerHandle::new(sender, local_addr, stopped_rx))
    }

    /// Accept loop
    async fn serve(
        self,
        listener: TcpListener,
        mut receiver: mpsc::Receiver<ServerMessage>,
        stopped: watch::Sender<bool>,
    ) -> Result<()> {
        let local_addr = listener.local_addr().map_err(SwitchError::Io)?;
        info!(
            "Listening on {} ({})",
            local_addr,
            if self.config.ssl() { "tls" } else if self.config.plain() { "plaintext, sniffing" } else { "plaintext" }
        );

        let mut tasks = JoinSet::new();

        loop {
            select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let pipeline = Arc::clone(&self.pipeline);
                        tasks.spawn(async move {
                            handle(&pipeline, stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },

                Some(message) = receiver.recv() => match message {
                    ServerMessage::Shutdown => {
                        info!("Received shutdown message");
                        break;
                    }
                },

                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        error!("Connection task error: {}", e);
                    }
                }
            }
        }

        drop(listener);

        if !tasks.is_empty() {
            info!("Waiting for {} connection(s) to complete...", tasks.len());
        }
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Connection task error during shutdown: {}", e);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("Shutdown timeout reached, {} connection(s) still active", tasks.len());
            tasks.shutdown().await;
        }

        info!("Server shutdown complete");
        stopped.send_replace(true);
        Ok(())
    }
}

async fn handle<E: SessionEngine>(pipeline: &ConnectionPipeline<E>, stream: TcpStream, peer_addr: std::net::SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer_addr, e);
    }

    match pipeline.handle_connection(stream, Some(peer_addr)).await {
        Ok(()) => debug!("Connection from {} closed", peer_addr),
        Err(e) if e.is_disconnect() => debug!("Connection from {} dropped: {}", peer_addr, e),
        Err(SwitchError::Detection(reason)) => debug!("Could not classify {}: {}", peer_addr, reason),
        Err(SwitchError::TlsHandshake(reason)) => warn!("TLS handshake with {} failed: {}", peer_addr, reason),
        Err(e) => warn!("Connection from {} failed: {}", peer_addr, e),
    }
}
