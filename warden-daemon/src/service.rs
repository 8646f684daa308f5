//! Wires the configured roles together and starts them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_auth::{CertificateAuthority, Fingerprint, PrivateKey, Role};
use warden_client::{HostTrust, TunnelClient};
use warden_core::{AccessPoint, AgentId, AuditLog, Node};

use crate::access_point::{LocalAccessPoint, TrustCache};
use crate::audit::TracingAuditLog;
use crate::authserver::{open_authority, AuthServer};
use crate::backend::{Backend, MemoryBackend, SqliteBackend};
use crate::config::{Config, StorageKind};
use crate::handshake::{Authenticator, Policy};
use crate::heartbeat::Heartbeat;
use crate::identity::{load_or_create_key, HostBundle, HostIdentity};
use crate::labels::LabelRunners;
use crate::listener::Listener;
use crate::rate_limit::LoginRateLimiter;
use crate::registry::Registry;
use crate::reversetunnel::{TunnelAgent, TunnelEndpoint, TunnelServer};
use crate::router::AccessRouter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const LIMITER_SHRINK_INTERVAL: Duration = Duration::from_secs(60);

/// Where this process gets host certificates from.
enum Certifier {
    /// The CA runs in-process: certify the host key once per role.
    Local {
        ca: Arc<CertificateAuthority>,
        key: Arc<PrivateKey>,
        id: String,
        hostname: String,
    },
    /// One certificate issued ahead of time by `wardend issue-host-cert`.
    Bundle(HostIdentity),
}

impl Certifier {
    fn identity(&self, role: Role) -> Result<HostIdentity> {
        match self {
            Certifier::Local {
                ca,
                key,
                id,
                hostname,
            } => {
                let cert = ca
                    .generate_host_cert(&key.public_key(), id, hostname, role, Duration::ZERO)
                    .with_context(|| format!("Failed to certify host for role {role}"))?;
                HostIdentity::new(Arc::clone(key), cert)
            }
            Certifier::Bundle(identity) => {
                let have = identity.cert().role();
                let fits = match role {
                    Role::Proxy => have.can_delegate(),
                    _ => have.is_host_service(),
                };
                anyhow::ensure!(
                    fits,
                    "host certificate has role {have}, which cannot act as {role}"
                );
                Ok(identity.clone())
            }
        }
    }
}

/// A started daemon.
#[derive(Debug)]
pub struct Running {
    pub fingerprint: Fingerprint,
    pub auth_addr: Option<SocketAddr>,
    pub node_addr: Option<SocketAddr>,
    pub proxy_addr: Option<SocketAddr>,
    pub tunnel_addr: Option<SocketAddr>,
    /// Present when the auth role runs in this process.
    pub ca: Option<Arc<CertificateAuthority>>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl Running {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every role to stop.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(error = %e, "service task panicked");
                }
            }
        }
    }
}

/// Starts the roles a [`Config`] enables.
pub struct Service {
    config: Config,
    key_passphrase: Option<String>,
    audit: Arc<dyn AuditLog>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("sealed_key", &self.key_passphrase.is_some())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            key_passphrase: None,
            audit: Arc::new(TracingAuditLog),
        }
    }

    /// Seal a newly created host key, and open an existing sealed one.
    pub fn with_key_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.key_passphrase = passphrase.filter(|p| !p.is_empty());
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn start(self, shutdown: CancellationToken) -> Result<Running> {
        let config = &self.config;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;
        let key = Arc::new(load_or_create_key(
            &config.host_key_path(),
            self.key_passphrase.as_deref(),
        )?);
        let fingerprint = key.public_key().fingerprint();

        let mut tasks = JoinSet::new();
        let mut running_auth = None;
        let mut running_ca = None;

        let (certifier, access): (Certifier, Arc<dyn AccessPoint>) = if config.auth.enabled {
            let backend: Arc<dyn Backend> = match config.auth.storage {
                StorageKind::Sqlite => Arc::new(
                    SqliteBackend::open(config.storage_path())
                        .await
                        .context("Failed to open storage")?,
                ),
                StorageKind::Memory => Arc::new(MemoryBackend::new()),
            };
            let ca = open_authority(Some(backend.as_ref()), config.auth.ca_config())
                .await
                .context("Failed to open certificate authority")?;

            let registry = Arc::new(Registry::new(Some(Arc::clone(&backend))));
            registry.load().await.context("Failed to load registry")?;
            tasks.spawn(Arc::clone(&registry).run_sweeper(SWEEP_INTERVAL, shutdown.clone()));

            let certifier = Certifier::Local {
                ca: Arc::clone(&ca),
                key: Arc::clone(&key),
                id: config.host_id().to_string(),
                hostname: config.hostname.clone(),
            };

            let limiter = LoginRateLimiter::new(
                config.auth.login_rate_per_second,
                config.auth.login_burst,
            );
            tasks.spawn(shrink_limiter(limiter.clone(), shutdown.clone()));

            let identity = certifier.identity(Role::Admin)?;
            let listener = Listener::bind("auth", &config.auth.listen_addr, identity.tls()).await?;
            running_auth = Some(listener.local_addr()?);
            let server = AuthServer::new(
                Arc::clone(&ca),
                Arc::clone(&registry),
                Some(backend),
                identity,
                limiter,
                Arc::clone(&self.audit),
            )
            .with_max_user_cert_ttl(Duration::from_secs(config.auth.max_user_cert_ttl_secs));
            tasks.spawn(listener.serve(Arc::new(server), shutdown.clone()));

            running_ca = Some(Arc::clone(&ca));
            let access: Arc<dyn AccessPoint> = Arc::new(LocalAccessPoint::new(ca, registry));
            (certifier, access)
        } else {
            let auth_server = config
                .auth_server
                .as_deref()
                .context("auth_server is required when [auth] is disabled")?;
            let bundle = HostBundle::load(&config.host_bundle_path())?;
            let identity = HostIdentity::new(Arc::clone(&key), bundle.cert)?;
            let client = TunnelClient::connect(
                auth_server,
                HostTrust::Authorities(bundle.trust),
                identity.id(),
                identity.auth_method(),
            )
            .await
            .with_context(|| format!("Failed to reach auth server {auth_server}"))?;
            info!(%auth_server, host = %identity.id(), "connected to auth server");
            let access: Arc<dyn AccessPoint> = Arc::new(client);
            (Certifier::Bundle(identity), access)
        };

        let trust = Arc::new(TrustCache::new(access));
        trust.current().await.context("Failed to fetch trust roots")?;

        let mut running_proxy = None;
        let mut running_tunnel = None;
        if config.proxy.enabled {
            let identity = certifier.identity(Role::Proxy)?;

            let tunnels = match &config.proxy.tunnel_listen_addr {
                Some(addr) => {
                    let server = TunnelServer::new(config.tunnel.mux_config(), Arc::clone(&self.audit));
                    let listener = Listener::bind("tunnel", addr, identity.tls()).await?;
                    running_tunnel = Some(listener.local_addr()?);
                    let auth = Authenticator::new(
                        identity.clone(),
                        Arc::clone(&trust),
                        Policy::Tunnel,
                        Arc::clone(&self.audit),
                    );
                    let endpoint = TunnelEndpoint::new(Arc::clone(&server), auth);
                    tasks.spawn(listener.serve(Arc::new(endpoint), shutdown.clone()));
                    Some(server)
                }
                None => None,
            };

            let listener = Listener::bind("proxy", &config.proxy.listen_addr, identity.tls()).await?;
            running_proxy = Some(listener.local_addr()?);
            let router =
                AccessRouter::proxy(identity, Arc::clone(&trust), tunnels, Arc::clone(&self.audit));
            tasks.spawn(listener.serve(Arc::new(router), shutdown.clone()));
        }

        let mut running_node = None;
        if config.node.enabled {
            let identity = certifier.identity(Role::Node)?;
            let listener = Listener::bind("node", &config.node.listen_addr, identity.tls()).await?;
            let bound = listener.local_addr()?;
            running_node = Some(bound);
            let advertise = config
                .node
                .advertise_addr
                .clone()
                .unwrap_or_else(|| bound.to_string());
            if bound.ip().is_unspecified() && config.node.advertise_addr.is_none() {
                warn!(addr = %advertise, "node listens on all interfaces without advertise_addr; proxies may not reach it");
            }

            let router =
                AccessRouter::node(identity.clone(), Arc::clone(&trust), Arc::clone(&self.audit));
            tasks.spawn(listener.serve(Arc::new(router), shutdown.clone()));

            let mut node = Node::new(advertise.clone(), config.hostname.clone());
            node.labels = config.node.labels.clone();
            if config.tunnel.enabled {
                node = node.with_tunnel(AgentId::new(identity.id()));
            }

            let runners = LabelRunners::spawn(config.node.command_labels(), shutdown.clone());
            let heartbeat = Heartbeat::new(Arc::clone(trust.access()), node)
                .with_labels(runners.subscribe())
                .with_interval(Duration::from_secs(config.node.heartbeat_interval_secs.max(1)))
                .with_ttl(Duration::from_secs(config.node.heartbeat_ttl_secs));
            let stop = shutdown.clone();
            tasks.spawn(async move {
                let _runners = runners;
                heartbeat.run(stop).await;
            });

            if config.tunnel.enabled {
                let proxy_addr = config
                    .tunnel
                    .proxy_addr
                    .clone()
                    .context("[tunnel] requires proxy_addr")?;
                let agent = TunnelAgent::new(identity, Arc::clone(&trust), proxy_addr, vec![advertise])
                    .with_config(config.tunnel.mux_config());
                tasks.spawn(agent.run(shutdown.clone()));
            }
        }

        info!(%fingerprint, host = %config.host_id(), "warden started");
        Ok(Running {
            fingerprint,
            auth_addr: running_auth,
            node_addr: running_node,
            proxy_addr: running_proxy,
            tunnel_addr: running_tunnel,
            ca: running_ca,
            shutdown,
            tasks,
        })
    }
}

async fn shrink_limiter(limiter: LoginRateLimiter, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(LIMITER_SHRINK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.shrink(),
            _ = shutdown.cancelled() => break,
        }
    }
}
