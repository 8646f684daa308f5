//! The node registry.
//!
//! Readers load an immutable snapshot; writers build a new map and swap it
//! in. A node disappears from reads the moment its TTL lapses, and the
//! sweeper drops the record (and its stored copy) later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::{Node, NodeId};

use crate::backend::{self, Backend, BackendError};

const NODE_PREFIX: &str = "nodes/";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node {node} is registered by {owner}")]
    Claimed { node: NodeId, owner: String },

    #[error(transparent)]
    Storage(#[from] BackendError),
}

#[derive(Debug, Clone)]
struct Entry {
    node: Arc<Node>,
    /// `None` never expires.
    expires: Option<Instant>,
    /// Host that wrote the record; unowned records can be claimed by anyone.
    owner: Option<String>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| now < at)
    }
}

/// Stored form of a registry entry; expiry in Unix seconds.
#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    node: Node,
    expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
}

pub struct Registry {
    nodes: ArcSwap<BTreeMap<NodeId, Entry>>,
    backend: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.nodes.load().len())
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}

impl Registry {
    /// A registry that writes through to `backend` when one is given.
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(BTreeMap::new()),
            backend,
        }
    }

    /// Reload unexpired records from the backend.
    pub async fn load(&self) -> Result<usize, BackendError> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let now_unix = warden_auth::unix_now();
        let now = Instant::now();

        let mut loaded = Vec::new();
        for item in backend.list(NODE_PREFIX).await? {
            let stored: StoredNode = match serde_json::from_slice(&item.value) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(key = %item.key, error = %e, "skipping unreadable node record");
                    continue;
                }
            };
            let expires = match stored.expires_at {
                None => None,
                Some(at) if at > now_unix => {
                    let remaining = u64::try_from(at - now_unix).unwrap_or_default();
                    Some(now + Duration::from_secs(remaining))
                }
                Some(_) => continue,
            };
            loaded.push(Entry {
                node: Arc::new(stored.node),
                expires,
                owner: stored.owner,
            });
        }

        let count = loaded.len();
        self.nodes.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            for entry in &loaded {
                next.entry(entry.node.id.clone())
                    .or_insert_with(|| entry.clone());
            }
            next
        });
        info!(count, "loaded nodes from storage");
        Ok(count)
    }

    /// Insert or replace the record for `node.id`. A zero `ttl` never expires.
    pub async fn upsert(&self, node: Node, ttl: Duration) -> Result<(), RegistryError> {
        self.store(node, ttl, None).await
    }

    /// Like [`upsert`](Self::upsert), but the record belongs to `owner`:
    /// while it is live no other owner may replace it.
    pub async fn upsert_owned(&self, node: Node, ttl: Duration, owner: &str) -> Result<(), RegistryError> {
        self.store(node, ttl, Some(owner.to_string())).await
    }

    async fn store(&self, node: Node, ttl: Duration, owner: Option<String>) -> Result<(), RegistryError> {
        let expires = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        let entry = Entry {
            node: Arc::new(node),
            expires,
            owner,
        };
        let id = entry.node.id.clone();
        debug!(node = %id, ttl_secs = ttl.as_secs(), "upsert node");

        let now = Instant::now();
        let mut claimed_by = None;
        self.nodes.rcu(|current| {
            claimed_by = current
                .get(&id)
                .filter(|prior| prior.live(now))
                .and_then(|prior| prior.owner.clone())
                .filter(|prior| entry.owner.as_ref().is_some_and(|owner| owner != prior));
            let mut next = BTreeMap::clone(current);
            if claimed_by.is_none() {
                next.insert(id.clone(), entry.clone());
            }
            next
        });
        if let Some(owner) = claimed_by {
            return Err(RegistryError::Claimed { node: id, owner });
        }

        if let Some(backend) = &self.backend {
            let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            let stored = StoredNode {
                node: Node::clone(&entry.node),
                expires_at: (!ttl.is_zero())
                    .then(|| warden_auth::unix_now().saturating_add(ttl_secs)),
                owner: entry.owner.clone(),
            };
            backend::put_json(backend.as_ref(), &node_key(&id), &stored).await?;
        }
        Ok(())
    }

    /// Live nodes, sorted by ID.
    pub fn get_servers(&self) -> Vec<Node> {
        self.live().map(|node| Node::clone(&node)).collect()
    }

    /// Live nodes with a static label or settled command label `key`
    /// equal to `value`.
    pub fn find_servers(&self, key: &str, value: &str) -> Vec<Node> {
        self.live()
            .filter(|node| node.matches(key, value))
            .map(|node| Node::clone(&node))
            .collect()
    }

    fn live(&self) -> impl Iterator<Item = Arc<Node>> {
        let snapshot = self.nodes.load_full();
        let now = Instant::now();
        let nodes: Vec<Arc<Node>> = snapshot
            .values()
            .filter(|entry| entry.live(now))
            .map(|entry| Arc::clone(&entry.node))
            .collect();
        nodes.into_iter()
    }

    /// Drop expired records. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.nodes.rcu(|current| {
            expired = current
                .iter()
                .filter(|(_, entry)| !entry.live(now))
                .map(|(id, _)| id.clone())
                .collect();
            let mut next = BTreeMap::clone(current);
            for id in &expired {
                next.remove(id);
            }
            next
        });

        if let Some(backend) = &self.backend {
            for id in &expired {
                if let Err(e) = backend.delete(&node_key(id)).await {
                    warn!(node = %id, error = %e, "failed to delete expired node");
                }
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired nodes removed");
        }
        expired.len()
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

fn node_key(id: &NodeId) -> String {
    format!("{NODE_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use warden_core::CommandLabel;

    #[tokio::test]
    async fn test_servers_sorted_by_id() {
        let registry = Registry::new(None);
        registry
            .upsert(Node::new("10.0.0.2:3022", "b"), Duration::ZERO)
            .await
            .unwrap();
        registry
            .upsert(Node::new("10.0.0.1:3022", "a"), Duration::ZERO)
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .get_servers()
            .into_iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(ids, ["10.0.0.1_3022", "10.0.0.2_3022"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let registry = Registry::new(None);
        let node = Node::new("10.0.0.1:3022", "a").with_label("env", "dev");
        registry.upsert(node, Duration::ZERO).await.unwrap();
        let node = Node::new("10.0.0.1:3022", "a").with_label("env", "prod");
        registry.upsert(node, Duration::ZERO).await.unwrap();

        assert_eq!(registry.get_servers().len(), 1);
        assert!(registry.find_servers("env", "dev").is_empty());
        assert_eq!(registry.find_servers("env", "prod").len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_command_label() {
        let registry = Registry::new(None);
        let mut label = CommandLabel::new(Duration::from_secs(1), ["expr", "1", "+", "3"]);
        label.result = "4\n".into();
        label.last_run = Some(chrono::Utc::now());
        let node = Node::new("10.0.0.1:3022", "a").with_command_label("cmdLabel1", label);
        registry.upsert(node, Duration::ZERO).await.unwrap();

        assert_eq!(registry.find_servers("cmdLabel1", "4").len(), 1);
        assert!(registry.find_servers("cmdLabel1", "5").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_nodes_are_invisible_then_swept() {
        let registry = Registry::new(None);
        registry
            .upsert(Node::new("10.0.0.1:3022", "a"), Duration::from_secs(30))
            .await
            .unwrap();
        registry
            .upsert(Node::new("10.0.0.2:3022", "b"), Duration::ZERO)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        let servers = registry.get_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].hostname, "b");

        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_write_through_and_reload() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let registry = Registry::new(Some(Arc::clone(&backend)));
        registry
            .upsert(
                Node::new("10.0.0.1:3022", "a").with_label("env", "prod"),
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        let restarted = Registry::new(Some(backend));
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.find_servers("env", "prod").len(), 1);
    }

    #[tokio::test]
    async fn test_owned_record_rejects_other_owner() {
        let registry = Registry::new(None);
        registry
            .upsert_owned(Node::new("10.0.0.1:3022", "a"), Duration::from_secs(30), "n1")
            .await
            .unwrap();

        let err = registry
            .upsert_owned(Node::new("10.0.0.1:3022", "evil"), Duration::from_secs(30), "n2")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Claimed { ref owner, .. } if owner == "n1"));
        assert_eq!(registry.get_servers()[0].hostname, "a");

        registry
            .upsert_owned(Node::new("10.0.0.1:3022", "a2"), Duration::from_secs(30), "n1")
            .await
            .unwrap();
        assert_eq!(registry.get_servers()[0].hostname, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_can_be_claimed() {
        let registry = Registry::new(None);
        registry
            .upsert_owned(Node::new("10.0.0.1:3022", "a"), Duration::from_secs(30), "n1")
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        registry
            .upsert_owned(Node::new("10.0.0.1:3022", "b"), Duration::from_secs(30), "n2")
            .await
            .unwrap();
        assert_eq!(registry.get_servers()[0].hostname, "b");
    }
}
