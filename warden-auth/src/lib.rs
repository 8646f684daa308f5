//! Authentication core for Warden.
//!
//! This crate is IO-free: no filesystem, no network, no logging. It holds
//! the [`ca::CertificateAuthority`], the OpenSSH certificates both trust roots
//! sign, the HOTP second factor, and the challenge/response verification
//! every Warden endpoint runs before serving a connection.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use warden_auth::ca::{CaConfig, CertificateAuthority};
//! use warden_auth::identity::PrivateKey;
//! use warden_auth::Role;
//!
//! let ca = CertificateAuthority::new(CaConfig::default()).unwrap();
//! ca.reset_user_certificate_authority(None);
//!
//! let key = PrivateKey::generate();
//! let cert = ca
//!     .generate_user_cert(&key.public_key(), "alice", Role::User, Duration::from_secs(3600))
//!     .unwrap();
//! assert!(ca.verify_user_cert(&cert, warden_auth::unix_now()).is_ok());
//! ```

pub mod authn;
pub mod ca;
pub mod cert;
pub mod identity;
pub mod otp;
pub mod password;
pub mod role;
pub mod trust;
pub mod x509;

pub use authn::{AuthMethod, AuthnError, Challenge, Credential, VerifiedIdentity};
pub use ca::{CaConfig, CaError, CertificateAuthority};
pub use cert::{CertError, CertKind, Certificate, Expiry};
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
pub use role::Role;
pub use trust::{TrustDecision, TrustedAuthorities};
pub use x509::{extract_public_key_from_cert, X509Error};

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
