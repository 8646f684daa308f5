//! TLS server side.
//!
//! Every listener presents a self-signed X.509 certificate for the host's
//! Ed25519 key. Clients only use TLS to learn that key; trust is decided by
//! the host certificate sent in the handshake.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use warden_auth::{Fingerprint, PrivateKey, SecretBytes};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const VALIDITY_DAYS: i64 = 365;

/// Self-signed certificate and key in DER form.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_der: CertificateDer<'static>,
    key_der: Arc<SecretBytes>,
    pub fingerprint: Fingerprint,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid host key: {0}")]
    Key(String),
    #[error("failed to generate certificate: {0}")]
    Generation(String),
    #[error("failed to build TLS config: {0}")]
    Config(String),
}

impl TlsIdentity {
    /// Self-sign a certificate for `key` naming `common_name`.
    pub fn self_signed(key: &PrivateKey, common_name: &str) -> Result<Self, TlsError> {
        let pkcs8 = key.to_pkcs8_der().map_err(|e| TlsError::Key(e.to_string()))?;
        let key_pair =
            KeyPair::try_from(pkcs8.as_bytes()).map_err(|e| TlsError::Key(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::Generation(e.to_string()))?;

        Ok(Self {
            cert_der: cert.der().clone(),
            key_der: Arc::new(pkcs8),
            fingerprint: Fingerprint::from_public_key(&key.public_key()),
        })
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![self.cert_der.clone()], key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}
