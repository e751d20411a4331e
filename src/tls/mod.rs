//! TLS handling module
//!
//! This module builds the TLS acceptor and inspects certificates.

mod acceptor;
mod cert;

pub use acceptor::{create_tls_acceptor, encode_alpn_protocols};
pub use cert::{get_cert_fingerprint, get_cert_subject, load_cert};
