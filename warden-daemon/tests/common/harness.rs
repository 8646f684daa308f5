//! Test harnesses for end-to-end tests.
//!
//! A [`Cluster`] is one `Service` running the auth server and the proxy on
//! loopback with in-memory storage. Nodes are further `Service`s provisioned
//! the way `wardend issue-host-cert` would, so they reach the auth server
//! over the network with their own host certificates.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use warden_auth::{otp, AuthMethod, CertificateAuthority, Role};
use warden_client::{connect_to_proxy, ClientError, HostTrust, NodeClient, ProxyClient, TunnelClient};
use warden_core::{AuditAction, AuditError, AuditEvent, AuditLog, Node};
use warden_daemon::config::{CommandConfig, Config, StorageKind};
use warden_daemon::identity::{save_key, HostBundle};
use warden_daemon::{Running, Service};

/// How long to wait for heartbeats, command labels and tunnels to settle.
pub const SETTLE: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(100);

pub const PASSWORD: &str = "hunter2";

/// Keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLog {
    pub fn actions(&self) -> Vec<AuditAction> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.action)
            .collect()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditLog for RecordingAuditLog {
    fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Config for one role set on loopback, with cheap password hashing.
pub fn loopback_config(dir: &Path, hostname: &str) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.hostname = hostname.to_string();
    config.auth.listen_addr = "127.0.0.1:0".into();
    config.auth.password_memory_kib = 1024;
    config.auth.password_iterations = 1;
    config.node.listen_addr = "127.0.0.1:0".into();
    config.node.heartbeat_interval_secs = 1;
    config.proxy.listen_addr = "127.0.0.1:0".into();
    config.proxy.tunnel_listen_addr = Some("127.0.0.1:0".into());
    config.tunnel.keepalive_interval_secs = 1;
    config
}

/// Auth server and proxy in one process.
pub struct Cluster {
    _dir: TempDir,
    pub running: Running,
    pub ca: Arc<CertificateAuthority>,
    pub audit: Arc<RecordingAuditLog>,
}

impl Cluster {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = loopback_config(dir.path(), "proxy");
        config.auth.enabled = true;
        config.auth.storage = StorageKind::Memory;
        config.proxy.enabled = true;

        let audit = Arc::new(RecordingAuditLog::default());
        let running = Service::new(config)
            .with_audit_log(audit.clone() as Arc<dyn AuditLog>)
            .start(CancellationToken::new())
            .await
            .expect("Failed to start cluster");
        let ca = running.ca.clone().expect("auth role runs in-process");

        Self {
            _dir: dir,
            running,
            ca,
            audit,
        }
    }

    pub fn auth_addr(&self) -> String {
        self.running.auth_addr.expect("auth listener").to_string()
    }

    pub fn proxy_addr(&self) -> String {
        self.running.proxy_addr.expect("proxy listener").to_string()
    }

    pub fn tunnel_addr(&self) -> String {
        self.running.tunnel_addr.expect("tunnel listener").to_string()
    }

    pub fn trust(&self) -> HostTrust {
        HostTrust::Authorities(self.ca.trusted_authorities())
    }

    /// Set `user`'s password and return their OTP secret.
    pub fn enroll(&self, user: &str, role: Role) -> Vec<u8> {
        let (url, _) = self
            .ca
            .upsert_password(user, PASSWORD)
            .expect("Failed to enroll user");
        self.ca.set_user_role(user, role).expect("Failed to set role");
        otp::secret_from_url(&url).expect("enrollment URL carries the secret")
    }

    /// Log in with password and code `counter`.
    pub async fn password_login(
        &self,
        user: &str,
        secret: &[u8],
        counter: u64,
    ) -> Result<TunnelClient, ClientError> {
        let method = AuthMethod::password(PASSWORD, otp::hotp(secret, counter));
        TunnelClient::connect(&self.auth_addr(), self.trust(), user, method).await
    }

    /// Enroll `user` and exchange a password login for a user certificate.
    pub async fn login(&self, user: &str) -> AuthMethod {
        let secret = self.enroll(user, Role::User);
        let client = self
            .password_login(user, &secret, 0)
            .await
            .expect("Failed to log in");
        let (method, _key) = client
            .login(Duration::from_secs(600))
            .await
            .expect("Failed to obtain user certificate");
        method
    }

    pub async fn proxy(&self, user: &str, method: &AuthMethod) -> ProxyClient {
        connect_to_proxy(&self.proxy_addr(), &self.trust(), user, method)
            .await
            .expect("Failed to connect to proxy")
    }

    /// Provision and start a node that reaches this cluster's auth server.
    pub async fn start_node(&self, spec: NodeSpec) -> TestNode {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = loopback_config(dir.path(), &spec.hostname);
        config.auth_server = Some(self.auth_addr());
        config.node.enabled = true;
        config.node.labels = spec.labels;
        config.node.commands = spec.commands;
        if spec.tunnel {
            config.tunnel.enabled = true;
            config.tunnel.proxy_addr = Some(self.tunnel_addr());
        }
        provision_host(&self.ca, &config, &spec.id, Role::Node);

        let running = Service::new(config)
            .with_audit_log(self.audit.clone() as Arc<dyn AuditLog>)
            .start(CancellationToken::new())
            .await
            .expect("Failed to start node");
        let addr = running.node_addr.expect("node listener").to_string();
        TestNode {
            _dir: dir,
            running,
            id: spec.id,
            hostname: spec.hostname,
            addr,
        }
    }

    /// Poll the proxy's registry until `ready` holds.
    pub async fn wait_for_servers(
        &self,
        proxy: &mut ProxyClient,
        ready: impl Fn(&[Node]) -> bool,
    ) -> Vec<Node> {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            let nodes = proxy.get_servers().await.expect("Failed to list servers");
            if ready(&nodes) {
                return nodes;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "registry never settled: {nodes:?}"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Dial `target` through the proxy until a route exists.
    pub async fn wait_for_route(&self, proxy: &ProxyClient, target: &str) -> NodeClient {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            match proxy.connect_to_node(target).await {
                Ok(client) => return client,
                Err(e) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "no route to {target}: {e}"
                    );
                }
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

/// Write the host key and bundle a node loads from its data directory.
pub fn provision_host(ca: &CertificateAuthority, config: &Config, id: &str, role: Role) {
    let (stored, public_key) = ca.generate_key_pair(None).expect("Failed to generate key");
    let cert = ca
        .generate_host_cert(&public_key, id, &config.hostname, role, Duration::ZERO)
        .expect("Failed to issue host certificate");
    save_key(&config.host_key_path(), stored.as_bytes()).expect("Failed to save host key");
    HostBundle {
        cert,
        trust: ca.trusted_authorities(),
    }
    .save(&config.host_bundle_path())
    .expect("Failed to save host bundle");
}

pub struct NodeSpec {
    pub id: String,
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub commands: Vec<CommandConfig>,
    pub tunnel: bool,
}

impl NodeSpec {
    pub fn new(id: &str, hostname: &str) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            labels: BTreeMap::new(),
            commands: Vec::new(),
            tunnel: false,
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn command(mut self, name: &str, command: &[&str], period_secs: u64) -> Self {
        self.commands.push(CommandConfig {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            period_secs,
        });
        self
    }

    pub fn tunneled(mut self) -> Self {
        self.tunnel = true;
        self
    }
}

pub struct TestNode {
    _dir: TempDir,
    pub running: Running,
    pub id: String,
    pub hostname: String,
    pub addr: String,
}

impl TestNode {
    pub async fn stop(self) {
        self.running.shutdown();
        self.running.wait().await;
    }
}
