//! RPC client for the auth server.
//!
//! Agents, nodes and tooling call the CA and registry operations over
//! authenticated connections to the auth server. Each call borrows an idle
//! connection from a small pool, or dials a new one, so a slow request does
//! not hold up the others. Every call is bounded by [`RPC_TIMEOUT`]; a
//! connection whose request timed out or failed in transport is dropped.
//!
//! A certificate can dial as often as it likes. A password login is
//! one-shot because its code is consumed, so such a client keeps its single
//! connection and runs one call at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use warden_auth::{AuthMethod, Certificate, PrivateKey, PublicKey, TrustedAuthorities};
use warden_core::{AccessError, AccessPoint, Node};
use warden_proto::{Request, Response};

use crate::conn::{Connection, HostTrust};
use crate::error::{ClientError, Result};

/// Upper bound on one call, including any dial it needs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls in flight at once for a certificate-authenticated client.
const MAX_CONNECTIONS: usize = 4;

pub struct TunnelClient {
    addr: String,
    trust: HostTrust,
    user: String,
    method: AuthMethod,
    idle: Mutex<Vec<Connection>>,
    in_flight: Semaphore,
    timeout: Duration,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Dial and authenticate to the auth server at `addr`.
    pub async fn connect(
        addr: &str,
        trust: HostTrust,
        user: &str,
        method: AuthMethod,
    ) -> Result<Self> {
        let conn = tokio::time::timeout(RPC_TIMEOUT, Connection::dial(addr, &trust, user, &method))
            .await
            .map_err(|_| ClientError::Timeout("auth server dial"))??;
        Ok(Self::from_connection(addr, trust, user, method, conn))
    }

    fn from_connection(
        addr: &str,
        trust: HostTrust,
        user: &str,
        method: AuthMethod,
        conn: Connection,
    ) -> Self {
        let slots = if method.certificate_ref().is_some() {
            MAX_CONNECTIONS
        } else {
            1
        };
        Self {
            addr: addr.to_string(),
            trust,
            user: user.to_string(),
            method,
            idle: Mutex::new(vec![conn]),
            in_flight: Semaphore::new(slots),
            timeout: RPC_TIMEOUT,
        }
    }

    /// Bound each call by `timeout` instead of [`RPC_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, request: &Request) -> Result<Response> {
        match tokio::time::timeout(self.timeout, self.call_pooled(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(addr = %self.addr, timeout = ?self.timeout, "auth server request timed out");
                Err(ClientError::Timeout("auth server request"))
            }
        }
    }

    async fn call_pooled(&self, request: &Request) -> Result<Response> {
        let _slot = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ClientError::TransportClosed)?;
        let mut conn = self.checkout().await?;

        match conn.call(request).await {
            Err(e) if e.is_transport() => {
                warn!(addr = %self.addr, error = %e, "auth server connection lost");
                Err(e)
            }
            result => {
                self.idle.lock().await.push(conn);
                result
            }
        }
    }

    async fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        if self.method.certificate_ref().is_none() {
            return Err(ClientError::TransportClosed);
        }
        debug!(addr = %self.addr, "dialing auth server");
        Connection::dial(&self.addr, &self.trust, &self.user, &self.method).await
    }

    pub async fn get_cert_authorities(&self) -> Result<TrustedAuthorities> {
        match self.call(&Request::GetCertAuthorities).await? {
            Response::CertAuthorities { trust } => Ok(trust),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Ask the user CA to certify `public_key` for the logged-in user.
    pub async fn generate_user_cert(
        &self,
        public_key: &PublicKey,
        ttl: Duration,
    ) -> Result<Certificate> {
        let request = Request::GenerateUserCert {
            public_key: public_key.clone(),
            ttl_secs: ttl.as_secs(),
        };
        match self.call(&request).await? {
            Response::UserCert { cert } => Ok(cert),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Generate a session key, have it certified for `ttl` and return the
    /// auth method for node and proxy connections.
    pub async fn login(&self, ttl: Duration) -> Result<(AuthMethod, Arc<PrivateKey>)> {
        let key = Arc::new(PrivateKey::generate());
        let cert = self.generate_user_cert(&key.public_key(), ttl).await?;
        Ok((AuthMethod::certificate(Arc::clone(&key), cert), key))
    }

    pub async fn upsert_server(&self, node: Node, ttl: Duration) -> Result<()> {
        let request = Request::UpsertServer {
            node,
            ttl_secs: ttl.as_secs(),
        };
        match self.call(&request).await? {
            Response::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub async fn get_servers(&self) -> Result<Vec<Node>> {
        match self.call(&Request::GetServers).await? {
            Response::Servers { nodes } => Ok(nodes),
            other => Err(ClientError::unexpected(other)),
        }
    }

    pub async fn find_servers(&self, key: &str, value: &str) -> Result<Vec<Node>> {
        let request = Request::FindServers {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.call(&request).await? {
            Response::Servers { nodes } => Ok(nodes),
            other => Err(ClientError::unexpected(other)),
        }
    }
}

#[async_trait]
impl AccessPoint for TunnelClient {
    async fn get_cert_authorities(&self) -> Result<TrustedAuthorities, AccessError> {
        Ok(TunnelClient::get_cert_authorities(self).await?)
    }

    async fn upsert_server(&self, node: Node, ttl: Duration) -> Result<(), AccessError> {
        Ok(TunnelClient::upsert_server(self, node, ttl).await?)
    }

    async fn get_servers(&self) -> Result<Vec<Node>, AccessError> {
        Ok(TunnelClient::get_servers(self).await?)
    }

    async fn find_servers(&self, key: &str, value: &str) -> Result<Vec<Node>, AccessError> {
        Ok(TunnelClient::find_servers(self, key, value).await?)
    }
}
