//! # Warden Core
//!
//! Domain types shared by every Warden component: node records, the
//! [`access::AccessPoint`] seam over the registry and CA trust roots, and
//! audit events.
//!
//! Types here serialize with serde; the JSON form is part of the wire
//! protocol between proxies, nodes and the auth server.
//!
//! ## Modules
//!
//! - [`node`] - Node snapshots, IDs and command labels
//! - [`access`] - Registry and trust-root access
//! - [`audit`] - Audit events and sinks

pub mod access;
pub mod audit;
pub mod node;

pub use access::{AccessError, AccessPoint};
pub use audit::{AuditAction, AuditError, AuditEvent, AuditLog, AuditTarget};
pub use node::{AgentId, CommandLabel, Node, NodeId};
