//! Certificate handling module
//!
//! Helpers for inspecting the server certificate at startup.

use std::fs;
use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::x509::X509;

use crate::common::{Result, SwitchError};

/// Load the first certificate of a PEM file
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no PEM certificate.
pub fn load_cert(cert_path: &Path) -> Result<X509> {
    let pem = fs::read(cert_path)?;
    let cert = X509::from_pem(&pem)?;
    Ok(cert)
}

/// Get certificate subject information
///
/// # Returns
///
/// The subject as comma separated `KEY=value` pairs, e.g. `CN=localhost`
pub fn get_cert_subject(cert_path: &Path) -> Result<String> {
    let cert = load_cert(cert_path)?;

    let mut parts = Vec::new();
    for entry in cert.subject_name().entries() {
        let key = entry.object().nid().short_name()?;
        let value = entry.data().as_utf8()?;
        parts.push(format!("{}={}", key, value));
    }

    if parts.is_empty() {
        return Err(SwitchError::Other(format!(
            "Certificate {} has an empty subject",
            cert_path.display()
        )));
    }

    Ok(parts.join(", "))
}

/// Get the SHA-256 certificate fingerprint, colon separated upper-case hex
pub fn get_cert_fingerprint(cert_path: &Path) -> Result<String> {
    let cert = load_cert(cert_path)?;
    let digest = cert.digest(MessageDigest::sha256())?;

    Ok(digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}
