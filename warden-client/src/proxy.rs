//! Client for proxy endpoints: registry queries and routed node sessions.

use warden_auth::AuthMethod;
use warden_core::Node;
use warden_proto::{Request, Response};

use crate::conn::{Connection, HostTrust};
use crate::error::{ClientError, Result};
use crate::node::{Credentials, NodeClient, NodeDialer};

/// Connect straight to a node.
pub async fn connect_to_node(
    addr: &str,
    trust: &HostTrust,
    user: &str,
    method: &AuthMethod,
) -> Result<NodeClient> {
    let credentials = Credentials {
        trust: trust.clone(),
        user: user.to_string(),
        method: method.clone(),
    };
    NodeClient::connect(
        credentials,
        NodeDialer::Direct {
            addr: addr.to_string(),
        },
    )
    .await
}

/// Connect to a proxy.
pub async fn connect_to_proxy(
    addr: &str,
    trust: &HostTrust,
    user: &str,
    method: &AuthMethod,
) -> Result<ProxyClient> {
    let credentials = Credentials {
        trust: trust.clone(),
        user: user.to_string(),
        method: method.clone(),
    };
    let conn = credentials.dial(addr).await?;
    Ok(ProxyClient {
        addr: addr.to_string(),
        credentials,
        conn,
    })
}

/// An authenticated RPC connection to a proxy.
pub struct ProxyClient {
    addr: String,
    credentials: Credentials,
    conn: Connection,
}

impl ProxyClient {
    /// All live nodes known to the proxy, sorted by ID.
    pub async fn get_servers(&mut self) -> Result<Vec<Node>> {
        match self.conn.call(&Request::GetServers).await? {
            Response::Servers { nodes } => Ok(nodes),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Nodes whose static or command label `key` equals `value`.
    pub async fn find_servers(&mut self, key: &str, value: &str) -> Result<Vec<Node>> {
        let request = Request::FindServers {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.conn.call(&request).await? {
            Response::Servers { nodes } => Ok(nodes),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Open a routed session to `target` (node ID, address or hostname).
    ///
    /// Uses a fresh connection to the proxy; this one stays available for
    /// queries.
    pub async fn connect_to_node(&self, target: &str) -> Result<NodeClient> {
        NodeClient::connect(
            self.credentials.clone(),
            NodeDialer::Proxy {
                proxy: self.addr.clone(),
                target: target.to_string(),
            },
        )
        .await
    }
}
