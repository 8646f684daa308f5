//! Trust roots for verifying certificates.

use serde::{Deserialize, Serialize};

use crate::cert::{CertError, CertKind, Certificate};
use crate::identity::PublicKey;

/// Public keys of the host and user certificate authorities.
///
/// Several keys per kind may be trusted at once while a rotation is in
/// progress. The two sets are never consulted for each other's certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedAuthorities {
    #[serde(default)]
    pub host: Vec<PublicKey>,
    #[serde(default)]
    pub user: Vec<PublicKey>,
}

impl TrustedAuthorities {
    #[must_use]
    pub fn keys(&self, kind: CertKind) -> &[PublicKey] {
        match kind {
            CertKind::Host => &self.host,
            CertKind::User => &self.user,
        }
    }

    /// Verify a certificate of the given kind against the matching trust root.
    ///
    /// # Errors
    ///
    /// Returns `CertError::UntrustedAuthority` when no key of that kind
    /// signed it, or the first verification error from the signing key.
    pub fn verify(&self, cert: &Certificate, kind: CertKind, now: i64) -> Result<(), CertError> {
        if cert.kind() != kind {
            return Err(CertError::WrongKind {
                expected: kind,
                actual: cert.kind(),
            });
        }
        let authority = self
            .keys(kind)
            .iter()
            .find(|key| *key == cert.signature_key())
            .ok_or(CertError::UntrustedAuthority(kind))?;
        cert.verify(authority, kind, now)
    }

    /// Decide whether to trust a server that presented `host_cert` over a
    /// TLS session keyed with `tls_key`.
    #[must_use]
    pub fn evaluate_host(
        &self,
        host_cert: &Certificate,
        tls_key: &PublicKey,
        now: i64,
    ) -> TrustDecision {
        if let Err(e) = self.verify(host_cert, CertKind::Host, now) {
            return TrustDecision::Untrusted(e);
        }
        if host_cert.public_key() != tls_key {
            return TrustDecision::KeyMismatch {
                certified: host_cert.public_key().clone(),
                presented: tls_key.clone(),
            };
        }
        TrustDecision::Trusted
    }
}

/// Outcome of checking a server's host certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrustDecision {
    /// Certificate chains to a trusted host CA and matches the TLS key.
    Trusted,
    /// Certificate did not verify against any trusted host CA.
    Untrusted(CertError),
    /// Certificate is genuine but certifies a different key than the one
    /// the server proved possession of (potential MITM).
    KeyMismatch {
        certified: PublicKey,
        presented: PublicKey,
    },
}
