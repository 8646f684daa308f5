//! Tunnel server: holds agent registrations and dials through them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use warden_client::BoxedIo;
use warden_core::{AgentId, AuditAction, AuditEvent, AuditLog, AuditTarget};

use super::mux::{MuxConfig, MuxSession, MuxStream, Side};
use crate::audit;
use crate::handshake::{Authenticator, Policy};
use crate::listener::ConnectionHandler;
use crate::router::RouteError;

struct Registration {
    generation: u64,
    session: MuxSession,
}

/// Live agent registrations, at most one per agent ID.
pub struct TunnelServer {
    agents: DashMap<AgentId, Registration>,
    generation: AtomicU64,
    config: MuxConfig,
    audit: Arc<dyn AuditLog>,
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("agents", &self.agents.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TunnelServer {
    pub fn new(config: MuxConfig, audit: Arc<dyn AuditLog>) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            generation: AtomicU64::new(0),
            config,
            audit,
        })
    }

    /// Record `session` for `agent`, closing any session it replaces. The
    /// entry is removed when the session ends.
    pub fn register(self: &Arc<Self>, agent: AgentId, session: MuxSession) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.agents.insert(
            agent.clone(),
            Registration {
                generation,
                session: session.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(%agent, "tunnel superseded by new registration");
            previous.session.close();
        }
        info!(%agent, "tunnel registered");
        audit::emit(
            &self.audit,
            AuditEvent::new(
                Some(agent.as_str()),
                AuditAction::TunnelRegistered,
                AuditTarget::Agent(agent.clone()),
            ),
        );

        let server = Arc::clone(self);
        tokio::spawn(async move {
            session.closed().await;
            let removed = server
                .agents
                .remove_if(&agent, |_, registration| registration.generation == generation)
                .is_some();
            if removed {
                info!(%agent, "tunnel closed");
                audit::emit(
                    &server.audit,
                    AuditEvent::new(
                        Some(agent.as_str()),
                        AuditAction::TunnelClosed,
                        AuditTarget::Agent(agent.clone()),
                    ),
                );
            }
        });
    }

    /// Open a stream through `agent`'s tunnel to `target` on the agent's side.
    pub async fn dial(&self, agent: &AgentId, target: &str) -> Result<MuxStream, RouteError> {
        let session = self
            .agents
            .get(agent)
            .map(|registration| registration.session.clone())
            .ok_or_else(|| RouteError::TunnelUnavailable(agent.clone()))?;

        session.open(target).await.map_err(|e| {
            debug!(%agent, %target, error = %e, "tunnel dial failed");
            RouteError::Dial(format!("via tunnel {agent}: {e}"))
        })
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        agents.sort();
        agents
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.agents.contains_key(agent)
    }
}

/// Ends the session if the connection task is dropped at shutdown.
struct CloseOnDrop(MuxSession);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Accepts agent connections for a [`TunnelServer`].
#[derive(Debug)]
pub struct TunnelEndpoint {
    server: Arc<TunnelServer>,
    auth: Authenticator,
}

impl TunnelEndpoint {
    pub fn new(server: Arc<TunnelServer>, auth: Authenticator) -> Self {
        debug_assert_eq!(auth.policy(), Policy::Tunnel);
        Self { server, auth }
    }
}

#[async_trait]
impl ConnectionHandler for TunnelEndpoint {
    async fn handle(&self, mut io: BoxedIo, peer: SocketAddr) {
        let identity = match self.auth.accept(&mut io).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!(%peer, error = %e, "tunnel handshake failed");
                return;
            }
        };

        let agent = AgentId::new(identity.principal());
        let (session, mut incoming) = MuxSession::start(io, Side::Server, self.server.config);
        self.server.register(agent.clone(), session.clone());
        let _close = CloseOnDrop(session.clone());

        // Agents do not open streams toward the server.
        tokio::select! {
            _ = session.closed() => {}
            request = incoming.recv() => {
                if let Some(request) = request {
                    warn!(%agent, target = %request.target(), "agent tried to open a stream, closing tunnel");
                    session.close();
                }
            }
        }
    }
}
