//! Tunnel agent: keeps a registration open at a tunnel server and serves
//! the streams it is asked to open.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_client::{Connection, HostTrust};

use super::mux::{IncomingStream, MuxConfig, MuxSession, Side};
use crate::access_point::TrustCache;
use crate::identity::HostIdentity;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error(transparent)]
    Client(#[from] warden_client::ClientError),

    #[error("no trust roots: {0}")]
    Trust(#[from] warden_core::AccessError),
}

/// Reverse-tunnel agent for one host.
pub struct TunnelAgent {
    identity: HostIdentity,
    trust: Arc<TrustCache>,
    server_addr: String,
    /// Targets the server may ask us to dial.
    allowed_targets: Vec<String>,
    config: MuxConfig,
}

impl std::fmt::Debug for TunnelAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAgent")
            .field("agent", &self.identity.id())
            .field("server", &self.server_addr)
            .field("allowed_targets", &self.allowed_targets)
            .finish_non_exhaustive()
    }
}

impl TunnelAgent {
    pub fn new(
        identity: HostIdentity,
        trust: Arc<TrustCache>,
        server_addr: impl Into<String>,
        allowed_targets: Vec<String>,
    ) -> Self {
        Self {
            identity,
            trust,
            server_addr: server_addr.into(),
            allowed_targets,
            config: MuxConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Stay registered until `shutdown`, reconnecting with exponential
    /// backoff whenever the tunnel drops.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.connect().await {
                Ok((session, incoming)) => {
                    info!(agent = %self.identity.id(), server = %self.server_addr, "tunnel established");
                    backoff = INITIAL_BACKOFF;
                    self.serve(session, incoming, &shutdown).await;
                    if shutdown.is_cancelled() {
                        return;
                    }
                    warn!(server = %self.server_addr, "tunnel lost, reconnecting");
                }
                Err(e) => {
                    warn!(server = %self.server_addr, error = %e, retry_in = ?backoff, "tunnel connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect(
        &self,
    ) -> Result<(MuxSession, tokio::sync::mpsc::Receiver<IncomingStream>), AgentError> {
        let trust = self.trust.current().await?;
        let (tls, server_key) = warden_client::tls::connect(&self.server_addr).await?;
        let conn = Connection::handshake(
            Box::new(tls),
            &server_key,
            &HostTrust::Authorities((*trust).clone()),
            self.identity.id(),
            &self.identity.auth_method(),
        )
        .await?;
        Ok(MuxSession::start(conn.into_io(), Side::Agent, self.config))
    }

    async fn serve(
        &self,
        session: MuxSession,
        mut incoming: tokio::sync::mpsc::Receiver<IncomingStream>,
        shutdown: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                request = incoming.recv() => match request {
                    Some(request) => {
                        let allowed = self.allowed_targets.iter().any(|t| t == request.target());
                        tokio::spawn(forward(request, allowed));
                    }
                    None => return,
                },
                _ = shutdown.cancelled() => {
                    session.close();
                    return;
                }
            }
        }
    }
}

/// Dial the requested target locally and pipe bytes both ways.
async fn forward(request: IncomingStream, allowed: bool) {
    let target = request.target().to_string();
    if !allowed {
        warn!(%target, "refusing tunnel stream to unlisted target");
        request.reject("target not allowed");
        return;
    }

    let tcp = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            request.reject(&e.to_string());
            return;
        }
        Err(_) => {
            request.reject("dial timed out");
            return;
        }
    };
    let _ = tcp.set_nodelay(true);

    let mut stream = match request.accept() {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%target, error = %e, "tunnel closed before stream was accepted");
            return;
        }
    };
    let mut tcp = tcp;
    match tokio::io::copy_bidirectional(&mut stream, &mut tcp).await {
        Ok((up, down)) => debug!(%target, up, down, "tunnel stream finished"),
        Err(e) => debug!(%target, error = %e, "tunnel stream ended with error"),
    }
}
