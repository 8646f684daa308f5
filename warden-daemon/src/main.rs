//! wardend - Warden auth server, proxy, node and tunnel agent

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use warden_auth::{CertificateAuthority, Role};
use warden_daemon::authserver::{open_authority, CA_STATE_KEY};
use warden_daemon::backend::{self, Backend, SqliteBackend};
use warden_daemon::config::{Config, StorageKind};
use warden_daemon::identity::{load_or_create_key, save_key, HostBundle};
use warden_daemon::Service;

/// Warden daemon
#[derive(Parser)]
#[command(name = "wardend", version, about)]
struct Cli {
    /// Config file; without one every role is disabled
    #[arg(long, short, env = "WARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Passphrase sealing the host key at rest
    #[arg(long, env = "WARDEN_KEY_PASSPHRASE", hide_env_values = true, global = true)]
    key_passphrase: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured roles (default if no command given)
    Start,

    /// Create or reset a user's password and one-time password secret
    Useradd {
        user: String,

        #[arg(long, default_value = "user")]
        role: Role,

        /// Password for the user
        #[arg(long, env = "WARDEN_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Issue a host key and certificate for another machine
    IssueHostCert {
        /// Certificate key ID; also the reverse-tunnel agent ID
        #[arg(long)]
        id: String,

        #[arg(long)]
        hostname: String,

        #[arg(long, default_value = "node")]
        role: Role,

        /// Certificate lifetime in seconds; 0 never expires
        #[arg(long, default_value = "0")]
        ttl: u64,

        /// Directory to write host.key and host.json into; becomes the
        /// other machine's data_dir
        #[arg(long)]
        out: PathBuf,
    },

    /// Print this host's key fingerprint
    Fingerprint,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => cmd_start(config, cli.key_passphrase).await,
        Commands::Useradd {
            user,
            role,
            password,
        } => cmd_useradd(&config, &user, role, &password).await,
        Commands::IssueHostCert {
            id,
            hostname,
            role,
            ttl,
            out,
        } => cmd_issue_host_cert(&config, &id, &hostname, role, ttl, &out).await,
        Commands::Fingerprint => {
            let key = load_or_create_key(&config.host_key_path(), cli.key_passphrase.as_deref())?;
            println!("{}", key.public_key().fingerprint());
            Ok(())
        }
    }
}

async fn cmd_start(config: Config, key_passphrase: Option<String>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let running = Service::new(config)
        .with_key_passphrase(key_passphrase)
        .start(shutdown.clone())
        .await?;

    println!("Host fingerprint: {}", running.fingerprint);
    if let Some(addr) = running.auth_addr {
        println!("Auth server:      {addr}");
    }
    if let Some(addr) = running.proxy_addr {
        println!("Proxy:            {addr}");
    }
    if let Some(addr) = running.tunnel_addr {
        println!("Tunnel listener:  {addr}");
    }
    if let Some(addr) = running.node_addr {
        println!("Node:             {addr}");
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    running.shutdown();
    running.wait().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// The CA and its storage, for offline administration on the auth host.
async fn open_local_authority(config: &Config) -> Result<(Arc<CertificateAuthority>, Arc<dyn Backend>)> {
    anyhow::ensure!(
        config.auth.enabled,
        "this host does not run the auth server ([auth] is disabled)"
    );
    anyhow::ensure!(
        config.auth.storage == StorageKind::Sqlite,
        "administration needs persistent storage; [auth] storage is memory"
    );
    std::fs::create_dir_all(&config.data_dir)?;
    let backend: Arc<dyn Backend> = Arc::new(
        SqliteBackend::open(config.storage_path())
            .await
            .context("Failed to open storage")?,
    );
    let ca = open_authority(Some(backend.as_ref()), config.auth.ca_config()).await?;
    Ok((ca, backend))
}

async fn cmd_useradd(config: &Config, user: &str, role: Role, password: &str) -> Result<()> {
    let (ca, backend) = open_local_authority(config).await?;
    let (url, _secret) = ca.upsert_password(user, password)?;
    ca.set_user_role(user, role)?;
    backend::put_json(backend.as_ref(), CA_STATE_KEY, &ca.export_state()).await?;

    println!("User {user} ({role}) enrolled.");
    println!("Add this key to an HOTP authenticator:");
    println!();
    println!("  {url}");
    println!();
    println!("A running auth server picks up the change on restart.");
    Ok(())
}

async fn cmd_issue_host_cert(
    config: &Config,
    id: &str,
    hostname: &str,
    role: Role,
    ttl: u64,
    out: &Path,
) -> Result<()> {
    let (ca, backend) = open_local_authority(config).await?;
    let (stored, public_key) = ca.generate_key_pair(None)?;
    let cert = ca.generate_host_cert(&public_key, id, hostname, role, Duration::from_secs(ttl))?;
    backend::put_json(backend.as_ref(), CA_STATE_KEY, &ca.export_state()).await?;

    let key_path = out.join("host.key");
    let bundle_path = out.join("host.json");
    let cert_path = out.join("host-cert.pub");
    save_key(&key_path, stored.as_bytes())?;
    std::fs::write(&cert_path, format!("{}\n", cert.to_openssh()))
        .with_context(|| format!("Failed to write {}", cert_path.display()))?;
    HostBundle {
        cert,
        trust: ca.trusted_authorities(),
    }
    .save(&bundle_path)?;

    println!("Host {id} ({role}) certified.");
    println!("  key:    {}", key_path.display());
    println!("  bundle: {}", bundle_path.display());
    println!("  cert:   {}", cert_path.display());
    println!("  fingerprint: {}", public_key.fingerprint());
    Ok(())
}
