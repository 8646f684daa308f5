//! TLS accept loops.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use warden_client::BoxedIo;

use crate::tls::{TlsError, TlsIdentity, TLS_HANDSHAKE_TIMEOUT};

/// Serves one accepted, TLS-wrapped connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, io: BoxedIo, peer: SocketAddr);
}

/// A bound TCP listener that terminates TLS with a host identity.
pub struct Listener {
    name: &'static str,
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl Listener {
    /// Bind `addr`; port 0 picks a free port (see [`Self::local_addr`]).
    pub async fn bind(
        name: &'static str,
        addr: &str,
        tls: &TlsIdentity,
    ) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            name,
            listener,
            acceptor: tls.acceptor()?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires. Each connection gets its own task,
    /// which is dropped (closing the connection) on shutdown.
    pub async fn serve(self, handler: Arc<dyn ConnectionHandler>, shutdown: CancellationToken) {
        let name = self.name;
        match self.listener.local_addr() {
            Ok(addr) => info!(listener = name, %addr, "listening"),
            Err(e) => warn!(listener = name, error = %e, "listening on unknown address"),
        }

        loop {
            let (tcp, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = name, error = %e, "TCP accept failed");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!(listener = name, "shutdown signal received, stopping accept loop");
                    break;
                }
            };

            if let Err(e) = tcp.set_nodelay(true) {
                debug!(listener = name, %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let acceptor = self.acceptor.clone();
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            let span = tracing::debug_span!("conn", listener = name, %peer);
            tokio::spawn(
                async move {
                    let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
                        .await
                    {
                        Ok(Ok(tls)) => tls,
                        Ok(Err(e)) => {
                            debug!(error = %e, "TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            warn!(timeout = ?TLS_HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                            return;
                        }
                    };

                    tokio::select! {
                        _ = handler.handle(Box::new(tls), peer) => {}
                        _ = shutdown.cancelled() => debug!("connection closed by shutdown"),
                    }
                }
                .instrument(span),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use warden_auth::PrivateKey;

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(&self, mut io: BoxedIo, _peer: SocketAddr) {
            let mut buf = [0u8; 5];
            if io.read_exact(&mut buf).await.is_ok() {
                let _ = io.write_all(&buf).await;
                let _ = io.flush().await;
            }
        }
    }

    #[tokio::test]
    async fn test_serves_tls_connections() {
        let key = PrivateKey::generate();
        let tls = TlsIdentity::self_signed(&key, "echo").unwrap();
        let listener = Listener::bind("echo", "127.0.0.1:0", &tls).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.serve(Arc::new(Echo), shutdown.clone()));

        let (mut stream, server_key) = warden_client::tls::connect(&addr.to_string())
            .await
            .unwrap();
        assert_eq!(server_key, key.public_key());
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let key = PrivateKey::generate();
        let tls = TlsIdentity::self_signed(&key, "a").unwrap();
        let first = Listener::bind("a", "127.0.0.1:0", &tls).await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        let err = Listener::bind("b", &addr, &tls).await.unwrap_err();
        assert!(matches!(err, ListenError::Bind { .. }));
    }
}
