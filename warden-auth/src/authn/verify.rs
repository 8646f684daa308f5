//! Verification of handshake proofs.

use crate::cert::{CertKind, Certificate};
use crate::identity::Signature;
use crate::role::Role;
use crate::trust::TrustedAuthorities;

use super::challenge::{Challenge, ProofKind};
use super::error::AuthnError;

/// How a [`VerifiedIdentity`] was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// A user certificate signed by the user CA.
    UserCertificate,
    /// A host certificate signed by the host CA.
    HostCertificate,
    /// A proxy vouched for the user with its host certificate.
    Delegated { proxy: String },
    /// Password and one-time code checked by the certificate authority.
    Password,
}

/// An identity that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    principal: String,
    role: Role,
    source: IdentitySource,
}

impl VerifiedIdentity {
    /// Crate-private so identities only come out of the verify functions
    /// and the certificate authority.
    pub(crate) fn new(principal: impl Into<String>, role: Role, source: IdentitySource) -> Self {
        Self {
            principal: principal.into(),
            role,
            source,
        }
    }

    /// Username for users, host ID for hosts.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.source == IdentitySource::HostCertificate
    }
}

/// Verify a certificate login.
///
/// User certificates must name `user` as their principal; host certificates
/// log in under their key ID.
///
/// # Errors
///
/// Fails if the certificate does not verify, names someone else, or the
/// signature over the challenge is wrong.
#[must_use = "verification result must be checked"]
pub fn verify_certificate(
    trust: &TrustedAuthorities,
    challenge: &Challenge,
    user: &str,
    cert: &Certificate,
    signature: &Signature,
    now: i64,
) -> Result<VerifiedIdentity, AuthnError> {
    let kind = cert.kind();
    trust.verify(cert, kind, now)?;

    let expected_principal = match kind {
        CertKind::User => cert.principal(),
        CertKind::Host => cert.key_id(),
    };
    if expected_principal != user {
        return Err(AuthnError::PrincipalMismatch(user.to_string()));
    }

    let message = challenge.signing_message(ProofKind::Certificate, cert.public_key(), user, None);
    if !cert.public_key().verify(&message, signature) {
        return Err(AuthnError::InvalidSignature);
    }

    let source = match kind {
        CertKind::User => IdentitySource::UserCertificate,
        CertKind::Host => IdentitySource::HostCertificate,
    };
    Ok(VerifiedIdentity::new(user, cert.role(), source))
}

/// Verify a proxy vouching for an already-authenticated user.
///
/// # Errors
///
/// Fails unless `host_cert` is a trusted host certificate whose role may
/// delegate, the claimed role is a user role, and the signature matches.
#[must_use = "verification result must be checked"]
pub fn verify_delegated(
    trust: &TrustedAuthorities,
    challenge: &Challenge,
    user: &str,
    role: Role,
    host_cert: &Certificate,
    signature: &Signature,
    now: i64,
) -> Result<VerifiedIdentity, AuthnError> {
    trust.verify(host_cert, CertKind::Host, now)?;

    if !host_cert.role().can_delegate() {
        return Err(AuthnError::RoleNotPermitted(host_cert.role()));
    }
    if !role.valid_for(CertKind::User) {
        return Err(AuthnError::RoleNotPermitted(role));
    }

    let message =
        challenge.signing_message(ProofKind::Delegated, host_cert.public_key(), user, Some(role));
    if !host_cert.public_key().verify(&message, signature) {
        return Err(AuthnError::InvalidSignature);
    }

    Ok(VerifiedIdentity::new(
        user,
        role,
        IdentitySource::Delegated {
            proxy: host_cert.key_id().to_string(),
        },
    ))
}
