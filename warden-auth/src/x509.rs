//! Public key extraction from TLS certificates.
//!
//! Servers present a self-signed X.509 certificate derived from their host
//! key. Clients read the Ed25519 key back out and compare it with the key
//! certified by the host CA.

use x509_parser::prelude::*;

use crate::identity::{KeyError, PublicKey};

/// Single certificates larger than this are rejected before parsing.
pub const MAX_CERT_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum X509Error {
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    #[error("failed to parse X.509 certificate: {0}")]
    Parse(String),

    #[error("certificate key is not Ed25519: {0}")]
    Key(#[from] KeyError),
}

/// Extract the Ed25519 subject key from a DER-encoded X.509 certificate.
///
/// # Errors
///
/// Fails for oversized or malformed input, or a key that is not 32 bytes.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Result<PublicKey, X509Error> {
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(X509Error::TooLarge(cert_der.len()));
    }

    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| X509Error::Parse(format!("{e:?}")))?;

    Ok(PublicKey::from_bytes(&cert.public_key().subject_public_key.data)?)
}
