//! TLS acceptor creation with ALPN protocol selection

use std::path::Path;

use log::{debug, info, trace};
use openssl::ssl::{select_next_proto, AlpnError, SslAcceptor, SslFiletype, SslMethod};

use crate::common::{Result, SwitchError};

/// Encode protocol identifiers in ALPN wire format (length-prefixed)
///
/// # Errors
///
/// Returns an error if an identifier is empty or longer than 255 bytes.
pub fn encode_alpn_protocols(protocols: &[String]) -> Result<Vec<u8>> {
    let mut wire = Vec::with_capacity(protocols.iter().map(|p| p.len() + 1).sum());

    for protocol in protocols {
        let len = u8::try_from(protocol.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| SwitchError::Config(format!("Invalid ALPN protocol identifier: {:?}", protocol)))?;
        wire.push(len);
        wire.extend_from_slice(protocol.as_bytes());
    }

    Ok(wire)
}

/// Create a TLS acceptor that negotiates one of `protocols`
///
/// The server's order wins: the first configured identifier the client also
/// offers is selected. When nothing overlaps the handshake completes without
/// a negotiated protocol.
///
/// # Example
///
/// ```no_run
/// # use std::path::Path;
/// # use mux_gate::tls::create_tls_acceptor;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let protocols = vec!["h2".to_string(), "http/1.1".to_string()];
/// let acceptor = create_tls_acceptor(
///     Path::new("certs/server.crt"),
///     Path::new("certs/server.key"),
///     &protocols,
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path, protocols: &[String]) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_certificate_chain_file(cert_path)?;
    acceptor.set_private_key_file(key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;

    let server_protocols: &'static [u8] = Box::leak(encode_alpn_protocols(protocols)?.into_boxed_slice());
    acceptor.set_alpn_select_callback(move |_ssl, client_protocols| {
        match select_next_proto(server_protocols, client_protocols) {
            Some(selected) => {
                trace!("ALPN selected {}", String::from_utf8_lossy(selected));
                Ok(selected)
            }
            None => Err(AlpnError::NOACK),
        }
    });

    info!("TLS acceptor ready, offering {}", protocols.join(","));
    debug!("Certificate: {}, key: {}", cert_path.display(), key_path.display());

    Ok(acceptor.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert::tests::write_self_signed;

    #[test]
    fn test_encode_alpn_protocols() {
        let wire = encode_alpn_protocols(&["h2".to_string(), "spdy/3".to_string()]).unwrap();
        assert_eq!(wire, b"\x02h2\x06spdy/3");
    }

    #[test]
    fn test_encode_rejects_invalid_identifiers() {
        assert!(encode_alpn_protocols(&[String::new()]).is_err());
        assert!(encode_alpn_protocols(&["x".repeat(256)]).is_err());
    }

    #[test]
    fn test_server_preference_wins() {
        let server = encode_alpn_protocols(&["spdy/3.1".to_string(), "http/1.1".to_string()]).unwrap();
        let client = b"\x08http/1.1\x08spdy/3.1";
        assert_eq!(select_next_proto(&server, client), Some(&b"spdy/3.1"[..]));
        assert_eq!(select_next_proto(&server, b"\x02h2"), None);
    }

    #[test]
    fn test_create_tls_acceptor() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path());

        let protocols = vec!["h2".to_string()];
        assert!(create_tls_acceptor(&cert, &key, &protocols).is_ok());
        assert!(create_tls_acceptor(&dir.path().join("missing.crt"), &key, &protocols).is_err());
    }
}
