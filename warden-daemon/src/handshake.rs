//! Server side of the connection handshake.
//!
//! Every endpoint runs the same exchange after TLS: send a [`ServerHello`]
//! carrying a fresh challenge, read the client's [`ClientAuth`], verify it,
//! and answer with an [`AuthReply`]. What each endpoint accepts is its
//! [`Policy`]. A rejected client gets `AuthReply::Failed` and the caller
//! closes the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use warden_auth::authn::{verify_certificate, verify_delegated, IdentitySource};
use warden_auth::{CaError, CertificateAuthority, Challenge, VerifiedIdentity};
use warden_core::{AuditAction, AuditEvent, AuditLog, AuditTarget, NodeId};
use warden_proto::handshake::MAX_USER_LEN;
use warden_proto::{
    expect_handshake_message, send_message, AuthClaim, AuthReply, ClientAuth, ErrorCode,
    ServerHello,
};

use crate::access_point::TrustCache;
use crate::audit;
use crate::identity::HostIdentity;
use crate::rate_limit::LoginRateLimiter;

/// Upper bound on the whole exchange, TLS excluded.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which identities an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Session endpoint: users with a session role, directly or via a proxy.
    Node,
    /// Proxy endpoint: users presenting their own certificate.
    Proxy,
    /// Auth server: password logins, users and host services.
    Auth,
    /// Reverse-tunnel endpoint: host services only.
    Tunnel,
}

impl Policy {
    pub fn permits(self, identity: &VerifiedIdentity) -> bool {
        match (self, identity.source()) {
            (Policy::Node, IdentitySource::UserCertificate)
            | (Policy::Node, IdentitySource::Delegated { .. })
            | (Policy::Proxy, IdentitySource::UserCertificate) => {
                identity.role().can_open_sessions()
            }
            (Policy::Auth, IdentitySource::Password)
            | (Policy::Auth, IdentitySource::UserCertificate) => true,
            (Policy::Auth, IdentitySource::HostCertificate)
            | (Policy::Tunnel, IdentitySource::HostCertificate) => {
                identity.role().is_host_service()
            }
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("rejected {user:?} ({code}): {reason}")]
    Rejected {
        user: String,
        code: ErrorCode,
        reason: String,
    },
}

/// Password verification, available on the auth server only.
#[derive(Debug, Clone)]
pub struct PasswordLogin {
    pub ca: Arc<CertificateAuthority>,
    pub limiter: LoginRateLimiter,
}

/// Everything an endpoint needs to authenticate its clients.
#[derive(Clone)]
pub struct Authenticator {
    identity: HostIdentity,
    trust: Arc<TrustCache>,
    policy: Policy,
    passwords: Option<PasswordLogin>,
    audit: Arc<dyn AuditLog>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("host", &self.identity.id())
            .field("policy", &self.policy)
            .field("passwords", &self.passwords.is_some())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(
        identity: HostIdentity,
        trust: Arc<TrustCache>,
        policy: Policy,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            identity,
            trust,
            policy,
            passwords: None,
            audit,
        }
    }

    pub fn with_passwords(mut self, passwords: PasswordLogin) -> Self {
        self.passwords = Some(passwords);
        self
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn trust(&self) -> &Arc<TrustCache> {
        &self.trust
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Run the handshake on `io`.
    ///
    /// # Errors
    ///
    /// `Rejected` after the client has been sent `AuthReply::Failed`;
    /// `Io` or `Timeout` when the exchange itself broke.
    pub async fn accept<S>(&self, io: &mut S) -> Result<VerifiedIdentity, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.exchange(io))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    async fn exchange<S>(&self, io: &mut S) -> Result<VerifiedIdentity, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = Challenge::generate(self.identity.key().public_key());
        send_message(io, &ServerHello::new(self.identity.cert().clone(), &challenge)).await?;

        let auth: ClientAuth = expect_handshake_message(io).await?;
        let is_password = matches!(auth.claim, AuthClaim::Password { .. });

        let verdict = match self.verify(&challenge, &auth).await {
            Ok(identity) if self.policy.permits(&identity) => Ok(identity),
            Ok(identity) => {
                debug!(
                    user = %identity.principal(),
                    role = %identity.role(),
                    source = ?identity.source(),
                    policy = ?self.policy,
                    "identity not permitted on this endpoint"
                );
                Err((ErrorCode::PermissionDenied, "not permitted on this endpoint".to_string()))
            }
            Err(rejection) => Err(rejection),
        };

        match verdict {
            Ok(identity) => {
                send_message(
                    io,
                    &AuthReply::Ok {
                        user: identity.principal().to_string(),
                        role: identity.role(),
                    },
                )
                .await?;
                debug!(user = %identity.principal(), role = %identity.role(), "authenticated");
                if is_password {
                    self.audit_login(&auth.user, AuditAction::LoginSucceeded, None);
                }
                Ok(identity)
            }
            Err((code, reason)) => {
                info!(user = %auth.user, claim = ?auth.claim, %code, %reason, "authentication rejected");
                self.audit_login(&auth.user, AuditAction::LoginFailed, Some(code));
                send_message(
                    io,
                    &AuthReply::Failed {
                        code,
                        reason: reason.clone(),
                    },
                )
                .await?;
                Err(HandshakeError::Rejected {
                    user: auth.user,
                    code,
                    reason,
                })
            }
        }
    }

    async fn verify(
        &self,
        challenge: &Challenge,
        auth: &ClientAuth,
    ) -> Result<VerifiedIdentity, (ErrorCode, String)> {
        if auth.user.is_empty() || auth.user.len() > MAX_USER_LEN {
            return Err((ErrorCode::BadRequest, "invalid user name".into()));
        }
        let now = warden_auth::unix_now();

        match &auth.claim {
            AuthClaim::Certificate { cert, signature } => {
                let trust = self.current_trust().await?;
                verify_certificate(&trust, challenge, &auth.user, cert, signature, now)
                    .map_err(|e| (ErrorCode::AuthenticationFailed, e.to_string()))
            }
            AuthClaim::Delegated {
                host_cert,
                role,
                signature,
            } => {
                let trust = self.current_trust().await?;
                verify_delegated(&trust, challenge, &auth.user, *role, host_cert, signature, now)
                    .map_err(|e| (ErrorCode::AuthenticationFailed, e.to_string()))
            }
            AuthClaim::Password { password, otp } => {
                let Some(passwords) = &self.passwords else {
                    return Err((
                        ErrorCode::AuthenticationFailed,
                        "password login is not available here".into(),
                    ));
                };
                passwords
                    .limiter
                    .check(&auth.user)
                    .map_err(|e| (ErrorCode::RateLimited, e.to_string()))?;

                let ca = Arc::clone(&passwords.ca);
                let (user, password, otp) = (auth.user.clone(), password.clone(), otp.clone());
                tokio::task::spawn_blocking(move || ca.authenticate_password(&user, &password, &otp))
                    .await
                    .map_err(|e| (ErrorCode::Internal, e.to_string()))?
                    .map_err(|e| (password_error_code(&e), e.to_string()))
            }
        }
    }

    async fn current_trust(
        &self,
    ) -> Result<Arc<warden_auth::TrustedAuthorities>, (ErrorCode, String)> {
        self.trust.current().await.map_err(|e| {
            warn!(error = %e, "no trust roots available");
            (ErrorCode::Internal, "trust roots unavailable".to_string())
        })
    }

    fn audit_login(&self, user: &str, action: AuditAction, code: Option<ErrorCode>) {
        let mut event = AuditEvent::new(
            Some(user),
            action,
            AuditTarget::Node(NodeId::new(self.identity.id())),
        );
        if let Some(code) = code {
            event = event.with_metadata("code", code.to_string());
        }
        audit::emit(&self.audit, event);
    }
}

fn password_error_code(err: &CaError) -> ErrorCode {
    match err {
        CaError::InvalidOtp => ErrorCode::InvalidOtp,
        CaError::ReplayedOtp => ErrorCode::ReplayedOtp,
        CaError::NotInitialized(_) => ErrorCode::NotInitialized,
        _ => ErrorCode::AuthenticationFailed,
    }
}
