//! Node records as carried by heartbeats and stored in the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registry identity of a node, derived from its advertised address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `127.0.0.1:3022` becomes `127.0.0.1_3022`.
    pub fn from_addr(addr: &str) -> Self {
        Self(addr.replace(':', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a reverse-tunnel agent: the key ID of its host certificate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A periodically re-executed command whose output is a discovery label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLabel {
    #[serde(rename = "period_ms", with = "millis")]
    pub period: Duration,
    /// Program and arguments; no shell is involved unless the command is one.
    pub command: Vec<String>,
    /// stdout of the last successful run.
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

impl CommandLabel {
    pub fn new(period: Duration, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            period,
            command: command.into_iter().map(Into::into).collect(),
            result: String::new(),
            last_run: None,
        }
    }

    /// Whether the last result equals `value`, ignoring surrounding whitespace.
    pub fn result_matches(&self, value: &str) -> bool {
        self.last_run.is_some() && self.result.trim() == value.trim()
    }
}

/// A full snapshot of one node. Heartbeats replace, never merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: String,
    pub hostname: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd_labels: BTreeMap<String, CommandLabel>,
    /// Set when the node is only reachable through this reverse-tunnel agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<AgentId>,
}

impl Node {
    pub fn new(addr: impl Into<String>, hostname: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            id: NodeId::from_addr(&addr),
            addr,
            hostname: hostname.into(),
            labels: BTreeMap::new(),
            cmd_labels: BTreeMap::new(),
            tunnel: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_command_label(mut self, key: impl Into<String>, label: CommandLabel) -> Self {
        self.cmd_labels.insert(key.into(), label);
        self
    }

    pub fn with_tunnel(mut self, agent: AgentId) -> Self {
        self.tunnel = Some(agent);
        self
    }

    /// Whether a static label or the last result of a command label under
    /// `key` equals `value`.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
            || self
                .cmd_labels
                .get(key)
                .is_some_and(|label| label.result_matches(value))
    }

    /// Whether `target` names this node by ID, address or hostname.
    pub fn answers_to(&self, target: &str) -> bool {
        self.id.as_str() == target || self.addr == target || self.hostname == target
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(result: &str) -> CommandLabel {
        let mut label = CommandLabel::new(Duration::from_secs(1), ["expr", "1", "+", "3"]);
        label.result = result.into();
        label.last_run = Some(Utc::now());
        label
    }

    #[test]
    fn node_id_from_addr() {
        let node = Node::new("127.0.0.1:30185", "node-1");
        assert_eq!(node.id, NodeId::new("127.0.0.1_30185"));
    }

    #[test]
    fn matches_static_and_command_labels() {
        let node = Node::new("127.0.0.1:1", "n")
            .with_label("label1", "value1")
            .with_command_label("cmdLabel1", evaluated("4\n"));

        assert!(node.matches("label1", "value1"));
        assert!(!node.matches("label1", "value2"));
        assert!(node.matches("cmdLabel1", "4"));
        assert!(!node.matches("cmdLabel1", "5"));
        assert!(!node.matches("missing", "4"));
    }

    #[test]
    fn unevaluated_command_label_never_matches() {
        let node = Node::new("127.0.0.1:1", "n").with_command_label(
            "empty",
            CommandLabel::new(Duration::from_secs(1), ["true"]),
        );
        assert!(!node.matches("empty", ""));
    }

    #[test]
    fn answers_to_id_addr_and_hostname() {
        let node = Node::new("10.0.0.5:3022", "db-1");
        assert!(node.answers_to("10.0.0.5_3022"));
        assert!(node.answers_to("10.0.0.5:3022"));
        assert!(node.answers_to("db-1"));
        assert!(!node.answers_to("db-2"));
    }

    #[test]
    fn command_label_period_serializes_as_millis() {
        let label = CommandLabel::new(Duration::from_millis(1500), ["uptime"]);
        let json = serde_json::to_value(&label).unwrap();
        assert_eq!(json["period_ms"], 1500);
        let parsed: CommandLabel = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, label);
    }
}
