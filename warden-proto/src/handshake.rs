//! Connection handshake messages.
//!
//! 1. server -> client: [`ServerHello`]
//! 2. client -> server: [`ClientAuth`]
//! 3. server -> client: [`AuthReply`]

use serde::{Deserialize, Serialize};
use warden_auth::authn::{Challenge, Credential};
use warden_auth::{Certificate, PublicKey, Role, Signature};

use crate::session::ErrorCode;

pub const PROTOCOL_VERSION: u32 = 1;

/// Longest login accepted in a [`ClientAuth`].
pub const MAX_USER_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: u32,
    /// The server's host certificate; its key must match the TLS certificate.
    pub host_cert: Certificate,
    #[serde(with = "crate::b64::nonce")]
    pub nonce: [u8; 32],
}

impl ServerHello {
    pub fn new(host_cert: Certificate, challenge: &Challenge) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            host_cert,
            nonce: challenge.nonce,
        }
    }

    /// The challenge a client answers, bound to the key in `host_cert`.
    pub fn challenge(&self) -> Challenge {
        Challenge {
            nonce: self.nonce,
            server_key: self.host_cert.public_key().clone(),
        }
    }

    pub fn server_key(&self) -> &PublicKey {
        self.host_cert.public_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub user: String,
    pub claim: AuthClaim,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthClaim {
    Certificate {
        cert: Certificate,
        signature: Signature,
    },
    Delegated {
        host_cert: Certificate,
        role: Role,
        signature: Signature,
    },
    Password {
        password: String,
        otp: String,
    },
}

impl std::fmt::Debug for AuthClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthClaim::Certificate { cert, .. } => f
                .debug_struct("Certificate")
                .field("key_id", &cert.key_id())
                .finish_non_exhaustive(),
            AuthClaim::Delegated {
                host_cert, role, ..
            } => f
                .debug_struct("Delegated")
                .field("proxy", &host_cert.key_id())
                .field("role", role)
                .finish_non_exhaustive(),
            AuthClaim::Password { .. } => f.write_str("Password([REDACTED])"),
        }
    }
}

impl From<Credential<'_>> for AuthClaim {
    fn from(credential: Credential<'_>) -> Self {
        match credential {
            Credential::Certificate { cert, signature } => AuthClaim::Certificate {
                cert: cert.clone(),
                signature,
            },
            Credential::Delegated {
                host_cert,
                role,
                signature,
            } => AuthClaim::Delegated {
                host_cert: host_cert.clone(),
                role,
                signature,
            },
            Credential::Password { password, otp } => AuthClaim::Password {
                password: password.to_string(),
                otp: otp.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthReply {
    Ok { user: String, role: Role },
    Failed { code: ErrorCode, reason: String },
}
