//! The authenticated endpoint users connect to.
//!
//! An [`AccessRouter`] runs the handshake on every connection and then
//! serves it according to its mode: a node runs one exec or shell session,
//! a proxy answers registry queries and routes `Dial` requests to nodes.

mod node;
mod proxy;
mod pty;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use warden_client::BoxedIo;
use warden_core::{AgentId, AuditLog};
use warden_proto::ErrorCode;

use crate::access_point::TrustCache;
use crate::handshake::{Authenticator, Policy};
use crate::identity::HostIdentity;
use crate::listener::ConnectionHandler;
use crate::reversetunnel::TunnelServer;

/// Why a proxy could not reach a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("node {0:?} not found")]
    NodeNotFound(String),

    #[error("no tunnel registered for agent {0}")]
    TunnelUnavailable(AgentId),

    #[error("dial failed: {0}")]
    Dial(String),
}

impl RouteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::NodeNotFound(_) => ErrorCode::NodeNotFound,
            RouteError::TunnelUnavailable(_) => ErrorCode::TunnelUnavailable,
            RouteError::Dial(_) => ErrorCode::DialFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// Serve exec and shell sessions on this host.
    Node,
    /// Route sessions to nodes and answer registry queries.
    Proxy,
}

pub struct AccessRouter {
    mode: RouterMode,
    auth: Authenticator,
    audit: Arc<dyn AuditLog>,
    tunnels: Option<Arc<TunnelServer>>,
}

impl std::fmt::Debug for AccessRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessRouter")
            .field("mode", &self.mode)
            .field("host", &self.auth.identity().id())
            .field("tunnels", &self.tunnels.is_some())
            .finish_non_exhaustive()
    }
}

impl AccessRouter {
    pub fn node(identity: HostIdentity, trust: Arc<TrustCache>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            mode: RouterMode::Node,
            auth: Authenticator::new(identity, trust, Policy::Node, Arc::clone(&audit)),
            audit,
            tunnels: None,
        }
    }

    /// A proxy. Without `tunnels`, nodes that are only reachable through a
    /// reverse tunnel cannot be dialed.
    pub fn proxy(
        identity: HostIdentity,
        trust: Arc<TrustCache>,
        tunnels: Option<Arc<TunnelServer>>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            mode: RouterMode::Proxy,
            auth: Authenticator::new(identity, trust, Policy::Proxy, Arc::clone(&audit)),
            audit,
            tunnels,
        }
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }
}

#[async_trait]
impl ConnectionHandler for AccessRouter {
    async fn handle(&self, mut io: BoxedIo, peer: SocketAddr) {
        let identity = match self.auth.accept(&mut io).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!(%peer, error = %e, "handshake failed");
                return;
            }
        };

        match self.mode {
            RouterMode::Node => {
                node::serve(io, &identity, self.auth.identity(), &self.audit).await;
            }
            RouterMode::Proxy => {
                proxy::serve(io, &identity, &self.auth, self.tunnels.as_deref(), &self.audit).await;
            }
        }
    }
}
