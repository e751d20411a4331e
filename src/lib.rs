//! mux-gate: protocol-detecting connection front end
//!
//! Decides per accepted connection whether it speaks SPDY, HTTP/2 or plain
//! HTTP/1.x, from TLS next-protocol negotiation, a configured default or
//! the leading plaintext bytes, before any request reaches the application.
//!
//! Connections resolving to a multiplexed protocol are handed to a
//! [`SessionEngine`]; each logical stream it announces is adapted into a
//! socket and delivered to the same default handlers that receive plain
//! connections, so one-request-per-socket code serves every protocol.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use http::Request;
//! use mux_gate::config::{self, ConfigValues};
//! use mux_gate::server::DefaultHandler;
//! use mux_gate::session::H2Engine;
//! use mux_gate::web::{Application, HttpHandler, RequestExt, ServerResponse};
//! use mux_gate::{Result, Server};
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     async fn call(&self, request: Request<Bytes>, response: &mut ServerResponse<'_>) -> Result<()> {
//!         let body = format!("hello over version {}\n", request.protocol().version);
//!         response.end(body.as_bytes()).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(config::load(None, ConfigValues::default())?);
//!     let handler: Arc<dyn DefaultHandler> = Arc::new(HttpHandler::new(Hello, config.max_header_size()));
//!
//!     let server = Server::new(config, H2Engine::new(), vec![handler])?;
//!     server.run().await
//! }
//! ```

pub mod common;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod web;

// Re-export commonly used structures and functions for convenience
pub use common::{Result, SwitchError};
pub use config::{parse_socket_addr, ServerConfig};
pub use server::{DefaultHandler, Server, ServerHandle, Socket};
pub use session::SessionEngine;
pub use tls::create_tls_acceptor;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
