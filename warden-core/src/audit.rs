//! Audit events and the sink they are emitted to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{AgentId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Authentication
    LoginSucceeded,
    LoginFailed,
    CertIssued,

    // Sessions
    ExecStarted,
    ShellStarted,
    SessionEnded,

    // Routing
    DialRouted,
    DialFailed,

    // Tunnels
    TunnelRegistered,
    TunnelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum AuditTarget {
    User(String),
    Node(NodeId),
    Agent(AgentId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,

    /// Principal that performed the action (None for system-initiated).
    pub actor: Option<String>,

    pub action: AuditAction,

    pub target: AuditTarget,

    /// BTreeMap keeps serialization order deterministic.
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(actor: Option<&str>, action: AuditAction, target: AuditTarget) -> Self {
        Self {
            ts: Utc::now(),
            actor: actor.map(str::to_string),
            action,
            target,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("audit sink failed: {0}")]
pub struct AuditError(pub String);

/// Append-only audit sink.
///
/// Emission is best-effort: callers log a failure and carry on serving.
pub trait AuditLog: Send + Sync {
    fn emit(&self, event: AuditEvent) -> Result<(), AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_action_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditAction::TunnelRegistered).unwrap(),
            r#""tunnel_registered""#
        );
    }

    #[test]
    fn audit_target_is_tagged() {
        let target = AuditTarget::Node(NodeId::new("127.0.0.1_3022"));
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, r#"{"type":"node","id":"127.0.0.1_3022"}"#);
    }

    #[test]
    fn metadata_is_ordered() {
        let event = AuditEvent::new(
            Some("alice"),
            AuditAction::ExecStarted,
            AuditTarget::Node(NodeId::new("n1")),
        )
        .with_metadata("zeta", "1")
        .with_metadata("alpha", "2");

        let json = serde_json::to_string(&event).unwrap();
        let alpha = json.find("alpha").unwrap();
        let zeta = json.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
