//! Warden CLI - log in, list nodes, run commands and open shells

mod profile;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use warden_auth::{AuthMethod, Fingerprint};
use warden_client::{connect_to_node, connect_to_proxy, HostTrust, NodeClient, TunnelClient};
use warden_core::Node;

use crate::profile::Profile;

/// Warden - bastion access to your nodes
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Profile file (defaults to the user config directory)
    #[arg(long, env = "WARDEN_PROFILE", global = true)]
    profile: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with password and one-time code, saving a user certificate
    Login {
        /// Auth server address
        #[arg(long)]
        auth: String,

        /// Auth server key fingerprint, as printed by wardend
        #[arg(long)]
        fingerprint: String,

        /// Proxy to use for later commands
        #[arg(long)]
        proxy: Option<String>,

        /// Login name
        #[arg(long, short)]
        user: String,

        /// Certificate lifetime in seconds
        #[arg(long, default_value = "43200")]
        ttl: u64,
    },

    /// List nodes known to the proxy
    Ls {
        /// Only nodes with this label (KEY=VALUE)
        #[arg(long, value_name = "KEY=VALUE")]
        label: Option<String>,
    },

    /// Run a command on a node
    Exec {
        #[command(flatten)]
        target: Target,

        /// Command line (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Open an interactive shell on a node
    Shell {
        #[command(flatten)]
        target: Target,
    },

    /// Show the saved login
    Status,
}

#[derive(clap::Args)]
struct Target {
    /// Node ID, address or hostname, reached through the proxy
    #[arg(conflicts_with = "node")]
    target: Option<String>,

    /// Connect directly to this node address instead of via the proxy
    #[arg(long)]
    node: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let path = match &cli.profile {
        Some(path) => path.clone(),
        None => Profile::default_path()?,
    };

    match cli.command {
        Commands::Login {
            auth,
            fingerprint,
            proxy,
            user,
            ttl,
        } => cmd_login(&path, auth, &fingerprint, proxy, user, ttl).await,
        Commands::Ls { label } => cmd_ls(&path, label.as_deref(), cli.json).await,
        Commands::Exec { target, cmd } => cmd_exec(&path, &target, &cmd.join(" ")).await,
        Commands::Shell { target } => cmd_shell(&path, &target).await,
        Commands::Status => cmd_status(&path, cli.json),
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn cmd_login(
    path: &std::path::Path,
    auth: String,
    fingerprint: &str,
    proxy: Option<String>,
    user: String,
    ttl: u64,
) -> Result<()> {
    let fingerprint: Fingerprint = fingerprint.parse().context("Invalid fingerprint")?;
    let password = prompt("Password")?;
    let otp = prompt("One-time code")?;

    let client = TunnelClient::connect(
        &auth,
        HostTrust::Fingerprint(fingerprint),
        &user,
        AuthMethod::password(password, otp),
    )
    .await
    .context("Login failed")?;

    let trust = client
        .get_cert_authorities()
        .await
        .context("Failed to fetch certificate authorities")?;
    let (method, key) = client
        .login(Duration::from_secs(ttl))
        .await
        .context("Failed to obtain a user certificate")?;
    let cert = method
        .certificate_ref()
        .context("Auth server returned no certificate")?
        .clone();

    let profile = Profile {
        user,
        auth_addr: auth,
        proxy_addr: proxy,
        trust,
        cert,
    };
    profile.save(path, &key)?;
    eprintln!("Logged in as {} ({})", profile.user, profile.cert.role());
    Ok(())
}

struct Session {
    profile: Profile,
    trust: HostTrust,
    method: AuthMethod,
}

fn session(path: &std::path::Path) -> Result<Session> {
    let (profile, key) = Profile::load(path)?;
    if profile.cert.expiry().is_expired(warden_auth::unix_now()) {
        bail!("Certificate expired; run `warden login` again");
    }
    Ok(Session {
        trust: HostTrust::Authorities(profile.trust.clone()),
        method: profile.auth_method(key),
        profile,
    })
}

impl Session {
    fn proxy(&self) -> Result<&str> {
        self.profile
            .proxy_addr
            .as_deref()
            .context("No proxy configured; pass --proxy to `warden login` or use --node")
    }

    async fn node(&self, target: &Target) -> Result<NodeClient> {
        let user = &self.profile.user;
        if let Some(addr) = &target.node {
            return connect_to_node(addr, &self.trust, user, &self.method)
                .await
                .with_context(|| format!("Failed to connect to {addr}"));
        }
        let name = target
            .target
            .as_deref()
            .context("Name a target node or pass --node")?;
        let proxy = connect_to_proxy(self.proxy()?, &self.trust, user, &self.method)
            .await
            .context("Failed to connect to proxy")?;
        proxy
            .connect_to_node(name)
            .await
            .with_context(|| format!("Failed to reach {name}"))
    }
}

async fn cmd_ls(path: &std::path::Path, label: Option<&str>, json: bool) -> Result<()> {
    let session = session(path)?;
    let mut proxy = connect_to_proxy(
        session.proxy()?,
        &session.trust,
        &session.profile.user,
        &session.method,
    )
    .await
    .context("Failed to connect to proxy")?;

    let nodes = match label {
        Some(label) => {
            let (key, value) = label
                .split_once('=')
                .context("Label filter must be KEY=VALUE")?;
            proxy.find_servers(key, value).await?
        }
        None => proxy.get_servers().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
    } else {
        print_nodes(&nodes);
    }
    Ok(())
}

fn print_nodes(nodes: &[Node]) {
    println!("{:<24} {:<22} {:<16} LABELS", "ID", "ADDRESS", "HOSTNAME");
    for node in nodes {
        let mut labels: Vec<String> = node
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        labels.extend(
            node.cmd_labels
                .iter()
                .map(|(k, label)| format!("{k}={}", label.result.trim())),
        );
        println!(
            "{:<24} {:<22} {:<16} {}",
            node.id,
            node.addr,
            node.hostname,
            labels.join(",")
        );
    }
}

async fn cmd_exec(path: &std::path::Path, target: &Target, command: &str) -> Result<()> {
    let session = session(path)?;
    let mut node = session.node(target).await?;
    match node.run(command).await {
        Ok(output) => {
            print!("{output}");
            Ok(())
        }
        Err(warden_client::ClientError::CommandFailed { code, output }) => {
            print!("{output}");
            std::process::exit(code);
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_shell(path: &std::path::Path, target: &Target) -> Result<()> {
    let session = session(path)?;
    let mut node = session.node(target).await?;
    let mut shell = node.shell().await.context("Failed to start shell")?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 4096];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            n = stdin.read(&mut buf), if stdin_open => {
                let n = n.context("Failed to read stdin")?;
                if n == 0 {
                    stdin_open = false;
                    shell.close_input().await?;
                } else {
                    shell.write(&buf[..n]).await?;
                }
            }
            chunk = shell.read() => {
                match chunk? {
                    Some(data) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    None => break,
                }
            }
        }
    }

    let code = shell.exit_code().unwrap_or(0);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn cmd_status(path: &std::path::Path, json: bool) -> Result<()> {
    let (profile, _) = Profile::load(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile.cert)?);
        return Ok(());
    }
    println!("User:       {}", profile.user);
    println!("Role:       {}", profile.cert.role());
    println!("Auth:       {}", profile.auth_addr);
    if let Some(proxy) = &profile.proxy_addr {
        println!("Proxy:      {proxy}");
    }
    match profile.cert.expiry() {
        warden_auth::Expiry::Never => println!("Expires:    never"),
        warden_auth::Expiry::At(at) => println!("Expires:    {at} (unix)"),
    }
    println!("Key:        {}", profile.cert.public_key().fingerprint());
    Ok(())
}
