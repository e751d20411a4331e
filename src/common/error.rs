//! Error handling module
//!
//! This module defines the error types and result type aliases used in the crate.

use thiserror::Error;
use std::io;

/// mux-gate error type
#[derive(Error, Debug)]
pub enum SwitchError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection ended or timed out before its protocol could be classified
    #[error("Protocol detection incomplete: {0}")]
    Detection(String),

    /// Error raised by the multiplexed session engine
    #[error("Session error: {0}")]
    Session(String),

    /// HTTP request parsing or response misuse
    #[error("HTTP error: {0}")]
    Http(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl SwitchError {
    /// Whether this error only means the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            SwitchError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<h2::Error> for SwitchError {
    fn from(err: h2::Error) -> Self {
        if err.is_io() {
            match err.into_io() {
                Some(io_err) => SwitchError::Io(io_err),
                None => SwitchError::Session("h2 I/O error".to_string()),
            }
        } else {
            SwitchError::Session(err.to_string())
        }
    }
}

impl From<http::Error> for SwitchError {
    fn from(err: http::Error) -> Self {
        SwitchError::Http(err.to_string())
    }
}

impl From<SwitchError> for io::Error {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `SwitchError`.
pub type Result<T> = std::result::Result<T, SwitchError>;
