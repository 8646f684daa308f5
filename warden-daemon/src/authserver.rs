//! The auth server: CA and registry RPCs for users, nodes and proxies.
//!
//! Users log in with password and one-time code and exchange the login for
//! a short-lived user certificate. Hosts authenticate with their host
//! certificates to heartbeat and to fetch trust roots. Every change to the
//! authority (a consumed code, a new serial) is written back to storage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_auth::authn::IdentitySource;
use warden_auth::ca::CaState;
use warden_auth::{CaConfig, CaError, CertificateAuthority, PublicKey, Role, VerifiedIdentity};
use warden_client::BoxedIo;
use warden_core::{AuditAction, AuditEvent, AuditLog, AuditTarget, Node, NodeId};
use warden_proto::{recv_message, send_message, ErrorCode, Request, Response};

use crate::access_point::{LocalAccessPoint, TrustCache};
use crate::audit;
use crate::backend::{self, Backend, BackendError};
use crate::handshake::{Authenticator, PasswordLogin, Policy};
use crate::identity::HostIdentity;
use crate::listener::ConnectionHandler;
use crate::rate_limit::LoginRateLimiter;
use crate::registry::{Registry, RegistryError};

/// Storage key of the authority snapshot.
pub const CA_STATE_KEY: &str = "ca/state";

pub const DEFAULT_MAX_USER_CERT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Storage(#[from] BackendError),

    #[error(transparent)]
    Ca(#[from] CaError),
}

/// Load the authority from `backend`, or create one with fresh signing keys
/// and store it.
pub async fn open_authority(
    backend: Option<&dyn Backend>,
    config: CaConfig,
) -> Result<Arc<CertificateAuthority>, AuthorityError> {
    let ca = CertificateAuthority::new(config)?;

    let stored = match backend {
        Some(backend) => backend::get_json::<CaState>(backend, CA_STATE_KEY).await?,
        None => None,
    };
    match stored {
        Some(state) => {
            ca.import_state(&state)?;
            info!(users = state.users.len(), "loaded certificate authority");
        }
        None => {
            let host = ca.reset_host_certificate_authority(None);
            let user = ca.reset_user_certificate_authority(None);
            info!(host_ca = %host.fingerprint(), user_ca = %user.fingerprint(), "initialized certificate authority");
            if let Some(backend) = backend {
                backend::put_json(backend, CA_STATE_KEY, &ca.export_state()).await?;
            }
        }
    }
    // Either half may be missing from an older snapshot.
    if ca.host_ca_public_key().is_none() {
        ca.reset_host_certificate_authority(None);
    }
    if ca.user_ca_public_key().is_none() {
        ca.reset_user_certificate_authority(None);
    }
    Ok(Arc::new(ca))
}

pub struct AuthServer {
    ca: Arc<CertificateAuthority>,
    registry: Arc<Registry>,
    backend: Option<Arc<dyn Backend>>,
    auth: Authenticator,
    audit: Arc<dyn AuditLog>,
    max_user_cert_ttl: Duration,
    /// Held from snapshot to write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer")
            .field("host", &self.auth.identity().id())
            .field("registry", &self.registry)
            .field("persistent", &self.backend.is_some())
            .field("max_user_cert_ttl", &self.max_user_cert_ttl)
            .finish_non_exhaustive()
    }
}

impl AuthServer {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        registry: Arc<Registry>,
        backend: Option<Arc<dyn Backend>>,
        identity: HostIdentity,
        limiter: LoginRateLimiter,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let access = Arc::new(LocalAccessPoint::new(Arc::clone(&ca), Arc::clone(&registry)));
        let auth = Authenticator::new(
            identity,
            Arc::new(TrustCache::new(access)),
            Policy::Auth,
            Arc::clone(&audit),
        )
        .with_passwords(PasswordLogin {
            ca: Arc::clone(&ca),
            limiter,
        });
        Self {
            ca,
            registry,
            backend,
            auth,
            audit,
            max_user_cert_ttl: DEFAULT_MAX_USER_CERT_TTL,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_max_user_cert_ttl(mut self, ttl: Duration) -> Self {
        self.max_user_cert_ttl = ttl;
        self
    }

    /// Write the authority snapshot back to storage, if there is any.
    async fn persist(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let state = self.ca.export_state();
        if let Err(e) = backend::put_json(backend.as_ref(), CA_STATE_KEY, &state).await {
            warn!(error = %e, "failed to persist certificate authority");
        }
    }

    async fn dispatch(&self, identity: &VerifiedIdentity, request: Request) -> Response {
        match request {
            Request::GetCertAuthorities => Response::CertAuthorities {
                trust: self.ca.trusted_authorities(),
            },
            Request::GenerateUserCert {
                public_key,
                ttl_secs,
            } => self.generate_user_cert(identity, &public_key, ttl_secs).await,
            Request::UpsertServer { node, ttl_secs } => {
                self.upsert_server(identity, node, ttl_secs).await
            }
            Request::GetServers => Response::Servers {
                nodes: self.registry.get_servers(),
            },
            Request::FindServers { key, value } => Response::Servers {
                nodes: self.registry.find_servers(&key, &value),
            },
            other => {
                debug!(request = ?other, "unexpected request on auth endpoint");
                Response::error(ErrorCode::BadRequest, "not an auth server request")
            }
        }
    }

    async fn generate_user_cert(
        &self,
        identity: &VerifiedIdentity,
        public_key: &PublicKey,
        ttl_secs: u64,
    ) -> Response {
        if *identity.source() != IdentitySource::Password {
            return Response::error(
                ErrorCode::PermissionDenied,
                "user certificates are issued after a password login only",
            );
        }
        let requested = Duration::from_secs(ttl_secs);
        let ttl = if requested.is_zero() {
            self.max_user_cert_ttl
        } else {
            requested.min(self.max_user_cert_ttl)
        };

        let cert = match self
            .ca
            .generate_user_cert(public_key, identity.principal(), identity.role(), ttl)
        {
            Ok(cert) => cert,
            Err(e) => {
                warn!(user = %identity.principal(), error = %e, "failed to issue user certificate");
                return Response::error(ca_error_code(&e), e.to_string());
            }
        };
        self.persist().await;

        info!(user = %identity.principal(), role = %identity.role(), serial = cert.serial(), ttl_secs = ttl.as_secs(), "issued user certificate");
        audit::emit(
            &self.audit,
            AuditEvent::new(
                Some(identity.principal()),
                AuditAction::CertIssued,
                AuditTarget::User(identity.principal().to_string()),
            )
            .with_metadata("serial", cert.serial().to_string())
            .with_metadata("ttl_secs", ttl.as_secs().to_string()),
        );
        Response::UserCert { cert }
    }

    async fn upsert_server(&self, identity: &VerifiedIdentity, node: Node, ttl_secs: u64) -> Response {
        if !identity.is_host() || !identity.role().is_host_service() {
            return Response::error(ErrorCode::PermissionDenied, "heartbeats require a host certificate");
        }
        // A host may only advertise itself as reachable through its own tunnel.
        if let Some(agent) = &node.tunnel {
            if identity.role() != Role::Admin && agent.as_str() != identity.principal() {
                return Response::error(
                    ErrorCode::PermissionDenied,
                    format!("{} may not claim tunnel {agent}", identity.principal()),
                );
            }
        }

        let ttl = Duration::from_secs(ttl_secs);
        let stored = if identity.role() == Role::Admin {
            self.registry.upsert(node, ttl).await
        } else {
            // The ID must be the one the advertised address derives to, and
            // a live record stays with the host that wrote it.
            if node.id != NodeId::from_addr(&node.addr) {
                warn!(host = %identity.principal(), node = %node.id, addr = %node.addr, "rejected heartbeat with mismatched node id");
                return Response::error(
                    ErrorCode::PermissionDenied,
                    format!("{} may not register node {} at {}", identity.principal(), node.id, node.addr),
                );
            }
            self.registry.upsert_owned(node, ttl, identity.principal()).await
        };
        match stored {
            Ok(()) => Response::Ok,
            Err(RegistryError::Claimed { node, owner }) => {
                warn!(host = %identity.principal(), %node, %owner, "rejected heartbeat for a node owned by another host");
                Response::error(
                    ErrorCode::PermissionDenied,
                    format!("{} may not register node {node}", identity.principal()),
                )
            }
            Err(e) => {
                warn!(error = %e, "failed to store heartbeat");
                Response::error(ErrorCode::Internal, e.to_string())
            }
        }
    }
}

fn ca_error_code(err: &CaError) -> ErrorCode {
    match err {
        CaError::NotInitialized(_) => ErrorCode::NotInitialized,
        CaError::InvalidRole { .. } | CaError::InvalidUsername(_) => ErrorCode::BadRequest,
        _ => ErrorCode::Internal,
    }
}

#[async_trait]
impl ConnectionHandler for AuthServer {
    async fn handle(&self, mut io: BoxedIo, peer: SocketAddr) {
        let identity = match self.auth.accept(&mut io).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!(%peer, error = %e, "auth handshake failed");
                return;
            }
        };
        if *identity.source() == IdentitySource::Password {
            // The login consumed a one-time code.
            self.persist().await;
        }

        loop {
            let request = match recv_message::<_, Request>(&mut io).await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    debug!(%peer, error = %e, "auth connection failed");
                    return;
                }
            };
            let response = self.dispatch(&identity, request).await;
            if let Err(e) = send_message(&mut io, &response).await {
                debug!(%peer, error = %e, "failed to send response");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::RecordingAuditLog;
    use crate::backend::MemoryBackend;
    use warden_auth::password::PasswordCost;
    use warden_auth::{otp, AuthMethod, CertKind, PrivateKey};
    use warden_client::{ClientError, Connection, HostTrust};
    use warden_core::AgentId;

    const PEER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 40000);

    fn config() -> CaConfig {
        CaConfig {
            otp_lookahead: 10,
            password: PasswordCost {
                memory_kib: 1024,
                iterations: 1,
            },
        }
    }

    struct Fixture {
        ca: Arc<CertificateAuthority>,
        backend: Arc<MemoryBackend>,
        server: Arc<AuthServer>,
        audit: Arc<RecordingAuditLog>,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let ca = open_authority(Some(backend.as_ref()), config()).await.unwrap();
        let identity =
            HostIdentity::issue(&ca, "auth", "auth", Role::Admin, Duration::ZERO).unwrap();
        let audit = Arc::new(RecordingAuditLog::default());
        let server = AuthServer::new(
            Arc::clone(&ca),
            Arc::new(Registry::new(None)),
            Some(backend.clone() as Arc<dyn Backend>),
            identity,
            LoginRateLimiter::default(),
            audit.clone() as Arc<dyn AuditLog>,
        )
        .with_max_user_cert_ttl(Duration::from_secs(3600));
        Fixture {
            ca,
            backend,
            server: Arc::new(server),
            audit,
        }
    }

    impl Fixture {
        async fn connect(&self, user: &str, method: &AuthMethod) -> Result<Connection, ClientError> {
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.handle(Box::new(server_io), PEER).await });

            let tls_key = self.server.auth.identity().key().public_key();
            let trust = HostTrust::Authorities(self.ca.trusted_authorities());
            Connection::handshake(Box::new(client_io), &tls_key, &trust, user, method).await
        }

        fn enroll(&self, user: &str) -> Vec<u8> {
            let (url, _) = self.ca.upsert_password(user, "hunter2").unwrap();
            otp::secret_from_url(&url).unwrap()
        }

        fn host(&self, id: &str, role: Role) -> AuthMethod {
            HostIdentity::issue(&self.ca, id, id, role, Duration::ZERO)
                .unwrap()
                .auth_method()
        }
    }

    #[tokio::test]
    async fn test_password_login_issues_capped_user_cert() {
        let fx = fixture().await;
        let secret = fx.enroll("alice");

        let method = AuthMethod::password("hunter2", otp::hotp(&secret, 0));
        let mut conn = fx.connect("alice", &method).await.unwrap();

        let key = PrivateKey::generate();
        let response = conn
            .call(&Request::GenerateUserCert {
                public_key: key.public_key(),
                ttl_secs: 30 * 24 * 3600,
            })
            .await
            .unwrap();
        let Response::UserCert { cert } = response else {
            panic!("expected a certificate, got {response:?}");
        };
        assert_eq!(cert.kind(), CertKind::User);
        assert_eq!(cert.principal(), "alice");
        assert_eq!(cert.role(), Role::User);
        assert!(fx.ca.verify_user_cert(&cert, warden_auth::unix_now()).is_ok());
        assert!(fx
            .ca
            .verify_user_cert(&cert, warden_auth::unix_now() + 2 * 3600)
            .is_err());

        assert!(fx.audit.actions().contains(&AuditAction::CertIssued));
    }

    #[tokio::test]
    async fn test_login_persists_otp_counter() {
        let fx = fixture().await;
        let secret = fx.enroll("alice");

        let method = AuthMethod::password("hunter2", otp::hotp(&secret, 0));
        let mut conn = fx.connect("alice", &method).await.unwrap();
        // A round trip ensures the post-login write has happened.
        conn.call(&Request::GetCertAuthorities).await.unwrap();

        let state: CaState = backend::get_json(fx.backend.as_ref(), CA_STATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.users["alice"].otp_counter, 1);

        let reopened = open_authority(Some(fx.backend.as_ref()), config()).await.unwrap();
        assert_eq!(reopened.trusted_authorities(), fx.ca.trusted_authorities());
        let replay = reopened.check_password("alice", "hunter2", &otp::hotp(&secret, 0));
        assert!(matches!(replay, Err(CaError::ReplayedOtp)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_keep_latest_counter() {
        let fx = fixture().await;
        let secret = fx.enroll("alice");

        let mut writes = Vec::new();
        for counter in 0..32 {
            fx.ca
                .check_password("alice", "hunter2", &otp::hotp(&secret, counter))
                .unwrap();
            let server = Arc::clone(&fx.server);
            writes.push(tokio::spawn(async move { server.persist().await }));
        }
        for write in writes {
            write.await.unwrap();
        }

        let state: CaState = backend::get_json(fx.backend.as_ref(), CA_STATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.users["alice"].otp_counter, 32);
        assert_eq!(fx.ca.export_state().users["alice"].otp_counter, 32);
    }

    #[tokio::test]
    async fn test_certificate_login_cannot_mint_certs() {
        let fx = fixture().await;
        let key = Arc::new(PrivateKey::generate());
        let cert = fx
            .ca
            .generate_user_cert(&key.public_key(), "alice", Role::User, Duration::from_secs(60))
            .unwrap();
        let mut conn = fx
            .connect("alice", &AuthMethod::certificate(key, cert))
            .await
            .unwrap();

        let err = conn
            .call(&Request::GenerateUserCert {
                public_key: PrivateKey::generate().public_key(),
                ttl_secs: 60,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Remote {
                code: ErrorCode::PermissionDenied,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_heartbeats_need_host_certificate() {
        let fx = fixture().await;
        let mut host = fx.connect("n1", &fx.host("n1", Role::Node)).await.unwrap();
        let node = Node::new("127.0.0.1:3022", "node-1").with_label("role", "db");
        host.call(&Request::UpsertServer {
            node: node.clone(),
            ttl_secs: 30,
        })
        .await
        .unwrap();

        let response = host.call(&Request::GetServers).await.unwrap();
        assert_eq!(response, Response::Servers { nodes: vec![node.clone()] });

        let secret = fx.enroll("alice");
        let mut user = fx
            .connect("alice", &AuthMethod::password("hunter2", otp::hotp(&secret, 0)))
            .await
            .unwrap();
        let err = user
            .call(&Request::UpsertServer { node, ttl_secs: 30 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Remote {
                code: ErrorCode::PermissionDenied,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_host_cannot_claim_foreign_tunnel() {
        let fx = fixture().await;
        let mut host = fx.connect("n1", &fx.host("n1", Role::Node)).await.unwrap();

        let own = Node::new("127.0.0.1:3022", "node-1").with_tunnel(AgentId::new("n1"));
        host.call(&Request::UpsertServer { node: own, ttl_secs: 30 })
            .await
            .unwrap();

        let foreign = Node::new("127.0.0.1:4022", "node-2").with_tunnel(AgentId::new("n2"));
        let err = host
            .call(&Request::UpsertServer {
                node: foreign,
                ttl_secs: 30,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Remote {
                code: ErrorCode::PermissionDenied,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_host_cannot_overwrite_another_nodes_record() {
        let fx = fixture().await;
        let mut n1 = fx.connect("n1", &fx.host("n1", Role::Node)).await.unwrap();
        let mut n2 = fx.connect("n2", &fx.host("n2", Role::Node)).await.unwrap();
        let denied = |result: Result<Response, ClientError>| {
            matches!(
                result,
                Err(ClientError::Remote {
                    code: ErrorCode::PermissionDenied,
                    ..
                })
            )
        };

        // Spoofed ID pointing at an address the host does not advertise.
        let mut spoofed = Node::new("10.6.6.6:22", "evil");
        spoofed.id = NodeId::new("127.0.0.1_3022");
        let result = n2
            .call(&Request::UpsertServer {
                node: spoofed.clone(),
                ttl_secs: 30,
            })
            .await;
        assert!(denied(result));
        assert!(fx.server.registry.get_servers().is_empty());

        let real = Node::new("127.0.0.1:3022", "node-1");
        n1.call(&Request::UpsertServer {
            node: real.clone(),
            ttl_secs: 30,
        })
        .await
        .unwrap();

        // Same ID, same address, different host.
        let result = n2
            .call(&Request::UpsertServer {
                node: Node::new("127.0.0.1:3022", "evil"),
                ttl_secs: 30,
            })
            .await;
        assert!(denied(result));
        let result = n2
            .call(&Request::UpsertServer {
                node: spoofed,
                ttl_secs: 30,
            })
            .await;
        assert!(denied(result));

        assert_eq!(fx.server.registry.get_servers(), vec![real]);
    }

    #[tokio::test]
    async fn test_open_authority_without_storage() {
        let ca = open_authority(None, config()).await.unwrap();
        let trust = ca.trusted_authorities();
        assert_eq!(trust.host.len(), 1);
        assert_eq!(trust.user.len(), 1);
    }
}
