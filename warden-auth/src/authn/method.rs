//! Client-side authentication methods.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::cert::Certificate;
use crate::identity::{PrivateKey, Signature};
use crate::role::Role;

use super::challenge::{Challenge, ProofKind};

enum Inner {
    Certificate {
        key: Arc<PrivateKey>,
        cert: Certificate,
    },
    Delegated {
        key: Arc<PrivateKey>,
        host_cert: Certificate,
        role: Role,
    },
    Password {
        password: Zeroizing<String>,
        otp: Zeroizing<String>,
    },
}

/// An opaque way for a client to authenticate a connection.
///
/// Cheap to clone; secrets stay inside.
#[derive(Clone)]
pub struct AuthMethod(Arc<Inner>);

/// What a method produces in answer to a server challenge.
#[derive(Debug)]
pub enum Credential<'a> {
    Certificate {
        cert: &'a Certificate,
        signature: Signature,
    },
    Delegated {
        host_cert: &'a Certificate,
        role: Role,
        signature: Signature,
    },
    Password {
        password: &'a str,
        otp: &'a str,
    },
}

impl AuthMethod {
    /// Authenticate with a certificate and the private key it certifies.
    #[must_use]
    pub fn certificate(key: Arc<PrivateKey>, cert: Certificate) -> Self {
        Self(Arc::new(Inner::Certificate { key, cert }))
    }

    /// Authenticate as a proxy acting for `role`-holding user.
    #[must_use]
    pub fn delegated(key: Arc<PrivateKey>, host_cert: Certificate, role: Role) -> Self {
        Self(Arc::new(Inner::Delegated {
            key,
            host_cert,
            role,
        }))
    }

    /// Authenticate with a password and the next one-time code.
    #[must_use]
    pub fn password(password: impl Into<String>, otp: impl Into<String>) -> Self {
        Self(Arc::new(Inner::Password {
            password: Zeroizing::new(password.into()),
            otp: Zeroizing::new(otp.into()),
        }))
    }

    /// The certificate backing this method, if any.
    #[must_use]
    pub fn certificate_ref(&self) -> Option<&Certificate> {
        match &*self.0 {
            Inner::Certificate { cert, .. } => Some(cert),
            Inner::Delegated { host_cert, .. } => Some(host_cert),
            Inner::Password { .. } => None,
        }
    }

    /// Answer a server challenge for `user`.
    #[must_use]
    pub fn respond(&self, challenge: &Challenge, user: &str) -> Credential<'_> {
        match &*self.0 {
            Inner::Certificate { key, cert } => {
                let message = challenge.signing_message(
                    ProofKind::Certificate,
                    cert.public_key(),
                    user,
                    None,
                );
                Credential::Certificate {
                    cert,
                    signature: key.sign(&message),
                }
            }
            Inner::Delegated {
                key,
                host_cert,
                role,
            } => {
                let message = challenge.signing_message(
                    ProofKind::Delegated,
                    host_cert.public_key(),
                    user,
                    Some(*role),
                );
                Credential::Delegated {
                    host_cert,
                    role: *role,
                    signature: key.sign(&message),
                }
            }
            Inner::Password { password, otp } => Credential::Password {
                password: password.as_str(),
                otp: otp.as_str(),
            },
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0 {
            Inner::Certificate { cert, .. } => f
                .debug_struct("AuthMethod::Certificate")
                .field("principal", &cert.principal())
                .field("role", &cert.role())
                .finish(),
            Inner::Delegated {
                host_cert, role, ..
            } => f
                .debug_struct("AuthMethod::Delegated")
                .field("proxy", &host_cert.key_id())
                .field("role", role)
                .finish(),
            Inner::Password { .. } => f.write_str("AuthMethod::Password([REDACTED])"),
        }
    }
}
