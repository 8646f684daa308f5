//! Handshake verification errors.

use crate::cert::CertError;
use crate::role::Role;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthnError {
    #[error("certificate rejected: {0}")]
    Certificate(#[from] CertError),

    /// The certificate is valid but names someone else.
    #[error("certificate is not valid for login {0:?}")]
    PrincipalMismatch(String),

    #[error("invalid signature")]
    InvalidSignature,

    /// The certificate's role may not perform this kind of login.
    #[error("role {0} is not permitted here")]
    RoleNotPermitted(Role),
}
