//! TLS client side.
//!
//! Servers present a self-signed certificate for their host key. The TLS
//! layer only checks that the server holds that key; whether the key is
//! trusted is decided after the handshake against the host certificate in
//! the server's hello (see [`crate::conn::HostTrust`]).

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use warden_auth::{extract_public_key_from_cert, PublicKey};

use crate::error::{ClientError, Result};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name sent in SNI; certificates are never checked against it.
const TLS_SERVER_NAME: &str = "warden";

/// Accepts any well-formed Ed25519 server certificate and checks handshake
/// signatures against it.
#[derive(Debug)]
pub struct HostKeyVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl HostKeyVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }
}

impl ServerCertVerifier for HostKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        extract_public_key_from_cert(end_entity.as_ref()).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client config shared by every outbound Warden connection.
pub fn client_config() -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ClientError::Tls(e.to_string()))?
    .dangerous()
    .with_custom_certificate_verifier(HostKeyVerifier::new())
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Dial `addr` and run the TLS handshake.
///
/// Returns the stream and the Ed25519 key the server proved possession of.
pub async fn connect(addr: &str) -> Result<(TlsStream<TcpStream>, PublicKey)> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout("connect"))??;
    tcp.set_nodelay(true)?;
    wrap(tcp).await
}

/// Run the TLS client handshake over an already-connected stream.
pub async fn wrap<S>(io: S) -> Result<(TlsStream<S>, PublicKey)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(client_config()?);
    let server_name =
        ServerName::try_from(TLS_SERVER_NAME).map_err(|e| ClientError::Tls(e.to_string()))?;

    let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, io))
        .await
        .map_err(|_| ClientError::Timeout("TLS handshake"))??;

    let key = {
        let (_, session) = stream.get_ref();
        let cert = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ClientError::Tls("server sent no certificate".into()))?;
        extract_public_key_from_cert(cert.as_ref())
            .map_err(|e| ClientError::Tls(e.to_string()))?
    };
    Ok((stream, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_auth::PrivateKey;

    fn self_signed(key: &PrivateKey) -> CertificateDer<'static> {
        let der = key.to_pkcs8_der().unwrap();
        let key_pair = rcgen::KeyPair::try_from(der.as_bytes()).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["warden".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        cert.der().clone()
    }

    #[test]
    fn verifier_accepts_ed25519_certificate() {
        let key = PrivateKey::generate();
        let cert = self_signed(&key);

        let verifier = HostKeyVerifier::new();
        let result = verifier.verify_server_cert(
            &cert,
            &[],
            &ServerName::try_from("warden").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
        assert_eq!(
            extract_public_key_from_cert(cert.as_ref()).unwrap(),
            key.public_key()
        );
    }

    #[test]
    fn verifier_rejects_garbage() {
        let verifier = HostKeyVerifier::new();
        let result = verifier.verify_server_cert(
            &CertificateDer::from(vec![1u8, 2, 3]),
            &[],
            &ServerName::try_from("warden").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }
}
