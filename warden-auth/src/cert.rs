//! Host and user certificates.
//!
//! A [`Certificate`] is an OpenSSH `ssh-ed25519-cert-v01@openssh.com`
//! certificate: it binds a public key to a key ID, one principal and a
//! [`Role`] for a validity window, and is signed by exactly one certificate
//! authority key. The OpenSSH certificate type field keeps host and user
//! certificates apart, so a host certificate never verifies as a user
//! certificate or vice versa.
//!
//! Mapping onto the OpenSSH fields:
//!
//! | OpenSSH field      | Host certificate | User certificate |
//! |--------------------|------------------|------------------|
//! | `key_id`           | host ID          | username         |
//! | `valid_principals` | hostname         | login            |
//! | `role@warden` ext. | admin/proxy/node | admin/user       |
//! | `valid_before`     | `i64::MAX` when the TTL is zero            ||
//!
//! Certificates travel and are stored in the one-line OpenSSH text form,
//! so `ssh-keygen -L -f` can inspect them.

use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssh_key::certificate::{Builder, CertType};
use ssh_key::HashAlg;

use crate::identity::{PrivateKey, PublicKey};
use crate::role::Role;

/// Extension carrying the certificate's role.
pub const ROLE_EXTENSION: &str = "role@warden";

/// Certificates are backdated by this much to tolerate clock skew.
pub const CLOCK_SKEW_SECS: i64 = 60;

/// OpenSSH's "forever" once clamped to what a Unix time can hold.
const NEVER_EXPIRES: u64 = i64::MAX as u64;

/// Which authority a certificate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertKind {
    Host,
    User,
}

impl CertKind {
    fn cert_type(self) -> CertType {
        match self {
            CertKind::Host => CertType::Host,
            CertKind::User => CertType::User,
        }
    }
}

impl From<CertType> for CertKind {
    fn from(cert_type: CertType) -> Self {
        match cert_type {
            CertType::Host => CertKind::Host,
            CertType::User => CertKind::User,
        }
    }
}

impl std::fmt::Display for CertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertKind::Host => f.write_str("host"),
            CertKind::User => f.write_str("user"),
        }
    }
}

/// End of a certificate's validity window.
///
/// A zero TTL at issuance produces `Never`; there is no implicit default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "at")]
pub enum Expiry {
    Never,
    At(i64),
}

impl Expiry {
    fn from_valid_before(valid_before: u64) -> Self {
        if valid_before >= NEVER_EXPIRES {
            Expiry::Never
        } else {
            Expiry::At(i64::try_from(valid_before).unwrap_or(i64::MAX))
        }
    }

    #[must_use]
    pub fn is_expired(self, now: i64) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(at) => now >= at,
        }
    }
}

/// Errors from certificate issuance, parsing and verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CertError {
    /// Not a well-formed OpenSSH certificate, or one we cannot use.
    #[error("malformed certificate: {0}")]
    Malformed(String),

    #[error("expected a {expected} certificate, got a {actual} certificate")]
    WrongKind { expected: CertKind, actual: CertKind },

    #[error("certificate is not signed by a trusted {0} authority")]
    UntrustedAuthority(CertKind),

    #[error("invalid certificate signature")]
    InvalidSignature,

    #[error("certificate not valid before {valid_after}")]
    NotYetValid { valid_after: i64 },

    #[error("certificate expired at {expired_at}")]
    Expired { expired_at: i64 },

    #[error("role {role} is not allowed on {kind} certificates")]
    InvalidRole { role: Role, kind: CertKind },

    /// Critical options restrict use in ways this gateway does not enforce.
    #[error("unsupported critical option {0:?}")]
    UnsupportedCriticalOption(String),
}

impl From<ssh_key::Error> for CertError {
    fn from(e: ssh_key::Error) -> Self {
        CertError::Malformed(e.to_string())
    }
}

/// Fields of a certificate before it is signed.
#[derive(Debug, Clone)]
pub(crate) struct CertTemplate<'a> {
    pub kind: CertKind,
    pub serial: u64,
    pub key_id: &'a str,
    pub principal: &'a str,
    pub role: Role,
    pub public_key: &'a PublicKey,
    pub ttl_secs: u64,
}

/// A signed OpenSSH host or user certificate.
///
/// Parsing a certificate does not make it trustworthy; call
/// [`Certificate::verify`] or `TrustedAuthorities::verify` first.
#[derive(Clone)]
pub struct Certificate {
    inner: ssh_key::Certificate,
    public_key: PublicKey,
    signature_key: PublicKey,
    role: Role,
    encoded: String,
}

impl Certificate {
    /// Sign a new certificate with an authority key.
    pub(crate) fn issue(
        authority: &PrivateKey,
        template: CertTemplate<'_>,
        now: i64,
    ) -> Result<Self, CertError> {
        if !template.role.valid_for(template.kind) {
            return Err(CertError::InvalidRole {
                role: template.role,
                kind: template.kind,
            });
        }

        let valid_after = u64::try_from(now.saturating_sub(CLOCK_SKEW_SECS)).unwrap_or(0);
        let valid_before = match template.ttl_secs {
            0 => NEVER_EXPIRES,
            ttl => u64::try_from(now)
                .unwrap_or(0)
                .saturating_add(ttl)
                .min(NEVER_EXPIRES - 1),
        };

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            template.public_key.to_key_data(),
            valid_after,
            valid_before,
        )?;
        builder
            .serial(template.serial)?
            .cert_type(template.kind.cert_type())?
            .key_id(template.key_id)?
            .valid_principal(template.principal)?
            .extension(ROLE_EXTENSION, template.role.as_str())?
            .comment(template.key_id)?;
        if template.kind == CertKind::User {
            builder.extension("permit-pty", "")?;
        }

        let inner = builder.sign(&authority.to_ssh_key())?;
        Self::from_inner(inner)
    }

    /// Parse the one-line OpenSSH form, `ssh-ed25519-cert-v01@openssh.com AAAA... [comment]`.
    ///
    /// # Errors
    ///
    /// `Malformed` for anything that is not an Ed25519 certificate carrying
    /// a known role and exactly one principal.
    pub fn from_openssh(encoded: &str) -> Result<Self, CertError> {
        Self::from_inner(ssh_key::Certificate::from_openssh(encoded.trim())?)
    }

    fn from_inner(inner: ssh_key::Certificate) -> Result<Self, CertError> {
        let public_key = PublicKey::from_key_data(inner.public_key())
            .map_err(|_| CertError::Malformed("subject key is not ed25519".into()))?;
        let signature_key = PublicKey::from_key_data(inner.signature_key())
            .map_err(|_| CertError::Malformed("signing key is not ed25519".into()))?;
        if inner.valid_principals().len() != 1 {
            return Err(CertError::Malformed(
                "certificate must name exactly one principal".into(),
            ));
        }
        let role = inner
            .extensions()
            .get(ROLE_EXTENSION)
            .ok_or_else(|| CertError::Malformed(format!("missing {ROLE_EXTENSION} extension")))?
            .parse::<Role>()
            .map_err(|e| CertError::Malformed(e.to_string()))?;
        let encoded = inner.to_openssh()?;
        Ok(Self {
            inner,
            public_key,
            signature_key,
            role,
            encoded,
        })
    }

    /// Verify this certificate against one authority key.
    ///
    /// The signature is checked before the validity window so an expired
    /// certificate is only reported as expired if it was ever genuine.
    ///
    /// # Errors
    ///
    /// Fails on kind, authority, signature, critical option, role or time
    /// mismatch.
    pub fn verify(&self, authority: &PublicKey, kind: CertKind, now: i64) -> Result<(), CertError> {
        if self.kind() != kind {
            return Err(CertError::WrongKind {
                expected: kind,
                actual: self.kind(),
            });
        }
        if self.signature_key != *authority {
            return Err(CertError::UntrustedAuthority(kind));
        }

        // Checking at valid_after isolates the signature and CA checks from
        // the window, which is reported separately below.
        let authority_fingerprint = authority.to_key_data().fingerprint(HashAlg::Sha256);
        self.inner
            .validate_at(self.inner.valid_after(), [&authority_fingerprint])
            .map_err(|_| CertError::InvalidSignature)?;

        if let Some(option) = self.inner.critical_options().keys().next() {
            return Err(CertError::UnsupportedCriticalOption(option.clone()));
        }
        if !self.role.valid_for(self.kind()) {
            return Err(CertError::InvalidRole {
                role: self.role,
                kind: self.kind(),
            });
        }
        if now < self.valid_after() {
            return Err(CertError::NotYetValid {
                valid_after: self.valid_after(),
            });
        }
        if let Expiry::At(expired_at) = self.expiry() {
            if now >= expired_at {
                return Err(CertError::Expired { expired_at });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn kind(&self) -> CertKind {
        self.inner.cert_type().into()
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.inner.serial()
    }

    /// Host ID for host certificates, username for user certificates.
    #[must_use]
    pub fn key_id(&self) -> &str {
        self.inner.key_id()
    }

    /// Hostname for host certificates, login for user certificates.
    #[must_use]
    pub fn principal(&self) -> &str {
        self.inner
            .valid_principals()
            .first()
            .map_or("", String::as_str)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    #[must_use]
    pub fn valid_after(&self) -> i64 {
        i64::try_from(self.inner.valid_after()).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn expiry(&self) -> Expiry {
        Expiry::from_valid_before(self.inner.valid_before())
    }

    #[must_use]
    pub fn signature_key(&self) -> &PublicKey {
        &self.signature_key
    }

    /// The one-line OpenSSH text form.
    #[must_use]
    pub fn to_openssh(&self) -> &str {
        &self.encoded
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for Certificate {}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("kind", &self.kind())
            .field("serial", &self.serial())
            .field("key_id", &self.key_id())
            .field("principal", &self.principal())
            .field("role", &self.role)
            .field("expiry", &self.expiry())
            .finish_non_exhaustive()
    }
}

impl Serialize for Certificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for Certificate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_openssh(&encoded).map_err(serde::de::Error::custom)
    }
}
