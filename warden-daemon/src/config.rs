//! Daemon configuration file.
//!
//! One TOML file describes which roles this process plays. Every field has a
//! default, so an empty file is valid: it starts nothing.
//!
//! ```toml
//! auth_server = "auth.example.com:3025"
//!
//! [node]
//! enabled = true
//! listen_addr = "0.0.0.0:3022"
//! labels = { role = "db-primary" }
//! commands = [{ name = "arch", command = ["uname", "-m"], period_secs = 60 }]
//!
//! [tunnel]
//! enabled = true
//! proxy_addr = "proxy.example.com:3024"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use warden_core::CommandLabel;

use crate::labels::Labels;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Host key, host certificate bundle and local storage live here.
    pub data_dir: PathBuf,
    /// Name this host is known by. Defaults to the system hostname.
    pub hostname: String,
    /// Host certificate key ID when this process issues its own.
    /// Defaults to the hostname.
    pub host_id: Option<String>,
    /// Auth server for roles that do not run one in-process.
    pub auth_server: Option<String>,
    pub auth: AuthConfig,
    pub node: NodeConfig,
    pub proxy: ProxyConfig,
    pub tunnel: TunnelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            hostname: default_hostname(),
            host_id: None,
            auth_server: None,
            auth: AuthConfig::default(),
            node: NodeConfig::default(),
            proxy: ProxyConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub storage: StorageKind,
    pub max_user_cert_ttl_secs: u64,
    pub otp_lookahead: u64,
    /// Password attempts per second per user, after the burst.
    pub login_rate_per_second: u32,
    pub login_burst: u32,
    /// Argon2id memory cost for new password hashes.
    pub password_memory_kib: u32,
    pub password_iterations: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let cost = warden_auth::password::PasswordCost::default();
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:3025".into(),
            storage: StorageKind::Sqlite,
            max_user_cert_ttl_secs: 12 * 60 * 60,
            otp_lookahead: 10,
            login_rate_per_second: 1,
            login_burst: 10,
            password_memory_kib: cost.memory_kib,
            password_iterations: cost.iterations,
        }
    }
}

impl AuthConfig {
    pub fn ca_config(&self) -> warden_auth::CaConfig {
        warden_auth::CaConfig {
            otp_lookahead: self.otp_lookahead,
            password: warden_auth::password::PasswordCost {
                memory_kib: self.password_memory_kib,
                iterations: self.password_iterations,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// Address the registry advertises. Defaults to the bound address.
    pub advertise_addr: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub commands: Vec<CommandConfig>,
    pub heartbeat_interval_secs: u64,
    /// Zero registers the node without expiry.
    pub heartbeat_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:3022".into(),
            advertise_addr: None,
            labels: BTreeMap::new(),
            commands: Vec::new(),
            heartbeat_interval_secs: crate::heartbeat::DEFAULT_INTERVAL.as_secs(),
            heartbeat_ttl_secs: crate::heartbeat::DEFAULT_TTL.as_secs(),
        }
    }
}

impl NodeConfig {
    pub fn command_labels(&self) -> Labels {
        self.commands
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    CommandLabel::new(Duration::from_secs(c.period_secs.max(1)), c.command.clone()),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

fn default_period_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// Reverse-tunnel listener; unset disables tunnels.
    pub tunnel_listen_addr: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:3023".into(),
            tunnel_listen_addr: Some("0.0.0.0:3024".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Reach this node through a reverse tunnel instead of directly.
    pub enabled: bool,
    pub proxy_addr: Option<String>,
    pub keepalive_interval_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_addr: None,
            keepalive_interval_secs: crate::reversetunnel::mux::DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
        }
    }
}

impl TunnelConfig {
    /// Keep-alive settings for both ends of a tunnel session.
    pub fn mux_config(&self) -> crate::reversetunnel::MuxConfig {
        crate::reversetunnel::MuxConfig::with_interval(Duration::from_secs(
            self.keepalive_interval_secs.max(1),
        ))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Read and validate `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tunnel.enabled {
            anyhow::ensure!(self.node.enabled, "[tunnel] requires [node] to be enabled");
            anyhow::ensure!(
                self.tunnel.proxy_addr.is_some(),
                "[tunnel] requires proxy_addr"
            );
        }
        let needs_auth = self.node.enabled || self.proxy.enabled;
        anyhow::ensure!(
            !needs_auth || self.auth.enabled || self.auth_server.is_some(),
            "node and proxy roles need auth_server unless [auth] is enabled"
        );
        for command in &self.node.commands {
            anyhow::ensure!(
                !command.command.is_empty(),
                "command label {:?} has an empty command",
                command.name
            );
        }
        Ok(())
    }

    /// Key ID for certificates this process issues to itself.
    pub fn host_id(&self) -> &str {
        self.host_id.as_deref().unwrap_or(&self.hostname)
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.data_dir.join("host.key")
    }

    pub fn host_bundle_path(&self) -> PathBuf {
        self.data_dir.join("host.json")
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("warden.db")
    }
}
