//! The access point: how routers, heartbeats and agents reach the CA trust
//! roots and the node registry.
//!
//! Inside the auth server this is a direct handle on the registry; everywhere
//! else it is an authenticated RPC client.

use std::time::Duration;

use async_trait::async_trait;
use warden_auth::TrustedAuthorities;

use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The backing service could not be reached.
    #[error("access point unavailable: {0}")]
    Unavailable(String),

    /// The caller's identity may not perform this operation.
    #[error("permission denied: {0}")]
    Denied(String),

    /// The remote side reported an error.
    #[error("{0}")]
    Remote(String),
}

#[async_trait]
pub trait AccessPoint: Send + Sync {
    /// Public keys of the host and user CAs.
    async fn get_cert_authorities(&self) -> Result<TrustedAuthorities, AccessError>;

    /// Replace the record for `node.id`. A zero `ttl` never expires.
    async fn upsert_server(&self, node: Node, ttl: Duration) -> Result<(), AccessError>;

    /// All live nodes, sorted by ID.
    async fn get_servers(&self) -> Result<Vec<Node>, AccessError>;

    /// Live nodes whose static or command label `key` equals `value`.
    async fn find_servers(&self, key: &str, value: &str) -> Result<Vec<Node>, AccessError>;
}
