//! Authenticated connections.

use tracing::debug;
use warden_auth::{
    AuthMethod, Certificate, Fingerprint, PublicKey, Role, TrustDecision, TrustedAuthorities,
};
use warden_proto::{
    expect_handshake_message, recv_message, send_message, AuthClaim, AuthReply, ClientAuth,
    Request, Response, ServerHello, PROTOCOL_VERSION,
};

use crate::error::{ClientError, Result};
use crate::io::BoxedIo;
use crate::tls;

/// How a client decides whether to trust the server it reached.
#[derive(Debug, Clone)]
pub enum HostTrust {
    /// The host certificate must chain to one of these host CA keys.
    Authorities(TrustedAuthorities),
    /// The server's key must have this fingerprint. Used to bootstrap a
    /// login before the CA keys are known.
    Fingerprint(Fingerprint),
}

impl HostTrust {
    fn check(&self, hello: &ServerHello, tls_key: &PublicKey) -> Result<()> {
        match self {
            HostTrust::Authorities(trust) => {
                match trust.evaluate_host(&hello.host_cert, tls_key, warden_auth::unix_now()) {
                    TrustDecision::Trusted => Ok(()),
                    TrustDecision::Untrusted(e) => Err(ClientError::UntrustedHost(e.to_string())),
                    TrustDecision::KeyMismatch { .. } => Err(ClientError::UntrustedHost(
                        "host certificate does not match TLS key".into(),
                    )),
                    other => Err(ClientError::UntrustedHost(format!("{other:?}"))),
                }
            }
            HostTrust::Fingerprint(expected) => {
                if hello.server_key() != tls_key {
                    return Err(ClientError::UntrustedHost(
                        "host certificate does not match TLS key".into(),
                    ));
                }
                if Fingerprint::from_public_key(tls_key) != *expected {
                    return Err(ClientError::UntrustedHost(format!(
                        "fingerprint {} does not match",
                        tls_key.fingerprint()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A connection that completed the handshake.
pub struct Connection {
    io: BoxedIo,
    host_cert: Certificate,
    user: String,
    role: Role,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.host_cert.key_id())
            .field("user", &self.user)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `addr` over TLS, verify the server and authenticate as `user`.
    pub async fn dial(
        addr: &str,
        trust: &HostTrust,
        user: &str,
        method: &AuthMethod,
    ) -> Result<Self> {
        let (stream, tls_key) = tls::connect(addr).await?;
        debug!(%addr, server_key = %tls_key.fingerprint(), "TLS established");
        Self::handshake(Box::new(stream), &tls_key, trust, user, method).await
    }

    /// Run the application handshake over an established TLS stream whose
    /// server proved possession of `tls_key`.
    pub async fn handshake(
        mut io: BoxedIo,
        tls_key: &PublicKey,
        trust: &HostTrust,
        user: &str,
        method: &AuthMethod,
    ) -> Result<Self> {
        let hello: ServerHello = expect_handshake_message(&mut io).await?;
        if hello.version != PROTOCOL_VERSION {
            return Err(ClientError::Protocol(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        trust.check(&hello, tls_key)?;

        let claim = AuthClaim::from(method.respond(&hello.challenge(), user));
        send_message(
            &mut io,
            &ClientAuth {
                user: user.to_string(),
                claim,
            },
        )
        .await?;

        match expect_handshake_message::<_, AuthReply>(&mut io).await? {
            AuthReply::Ok { user, role } => {
                debug!(server = %hello.host_cert.key_id(), %user, %role, "authenticated");
                Ok(Self {
                    io,
                    host_cert: hello.host_cert,
                    user,
                    role,
                })
            }
            AuthReply::Failed { code, reason } => {
                Err(ClientError::AuthenticationFailed { code, reason })
            }
        }
    }

    pub fn host_cert(&self) -> &Certificate {
        &self.host_cert
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        send_message(&mut self.io, request).await?;
        Ok(())
    }

    /// Next response; a close before one arrives is `TransportClosed`.
    pub async fn recv(&mut self) -> Result<Response> {
        recv_message(&mut self.io)
            .await?
            .ok_or(ClientError::TransportClosed)
    }

    /// Send a request and wait for its single response, turning
    /// `Response::Error` into `ClientError::Remote`.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        self.send(request).await?;
        match self.recv().await? {
            Response::Error { code, message } => Err(ClientError::Remote { code, message }),
            response => Ok(response),
        }
    }

    pub fn into_io(self) -> BoxedIo {
        self.io
    }
}
