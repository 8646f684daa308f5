//! Requests and responses exchanged after authentication.
//!
//! Node endpoints take one `Exec` or `Shell` per connection. Proxy and auth
//! endpoints run an RPC loop; a proxy `Dial` turns the connection into a
//! byte relay to the chosen node, after which the client speaks to the node
//! as if connected directly.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use warden_auth::{Certificate, PublicKey, TrustedAuthorities};
use warden_core::{AgentId, Node};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Run a command to completion.
    Exec { command: String },
    /// Start an interactive shell.
    Shell,
    /// Shell input.
    Data {
        #[serde(with = "crate::b64")]
        data: Bytes,
    },
    /// Close shell input.
    Eof,

    GetServers,
    FindServers { key: String, value: String },
    /// Route this connection to a node (proxy only).
    Dial { target: String },

    GetCertAuthorities,
    /// Certify `public_key` for the authenticated user (auth server only).
    GenerateUserCert { public_key: PublicKey, ttl_secs: u64 },
    /// Heartbeat (auth server only, host identities).
    UpsertServer { node: Node, ttl_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Process output, in production order.
    Output {
        #[serde(with = "crate::b64")]
        data: Bytes,
    },
    /// The process exited; last message of an exec or shell session.
    Exit { code: i32 },

    Servers { nodes: Vec<Node> },
    /// The proxy reached the node; subsequent bytes go to the node.
    DialOk { route: Route, host_cert: Certificate },

    CertAuthorities { trust: TrustedAuthorities },
    UserCert { cert: Certificate },

    Ok,
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

/// How a proxy reached a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    Direct,
    Tunnel { agent: AgentId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthenticationFailed,
    InvalidOtp,
    ReplayedOtp,
    RateLimited,
    PermissionDenied,
    NotInitialized,
    NodeNotFound,
    TunnelUnavailable,
    DialFailed,
    BadRequest,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::AuthenticationFailed => "authentication failed",
            ErrorCode::InvalidOtp => "invalid one-time password",
            ErrorCode::ReplayedOtp => "one-time password already used",
            ErrorCode::RateLimited => "rate limited",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::NodeNotFound => "node not found",
            ErrorCode::TunnelUnavailable => "tunnel unavailable",
            ErrorCode::DialFailed => "dial failed",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}
