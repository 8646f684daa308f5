//! In-process access point and the trust-root cache servers verify against.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::warn;
use warden_auth::{CertificateAuthority, TrustedAuthorities};
use warden_core::{AccessError, AccessPoint, Node};

use crate::registry::Registry;

/// Access point for components running in the auth server's process.
#[derive(Debug, Clone)]
pub struct LocalAccessPoint {
    ca: Arc<CertificateAuthority>,
    registry: Arc<Registry>,
}

impl LocalAccessPoint {
    pub fn new(ca: Arc<CertificateAuthority>, registry: Arc<Registry>) -> Self {
        Self { ca, registry }
    }
}

#[async_trait]
impl AccessPoint for LocalAccessPoint {
    async fn get_cert_authorities(&self) -> Result<TrustedAuthorities, AccessError> {
        Ok(self.ca.trusted_authorities())
    }

    async fn upsert_server(&self, node: Node, ttl: Duration) -> Result<(), AccessError> {
        self.registry
            .upsert(node, ttl)
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))
    }

    async fn get_servers(&self) -> Result<Vec<Node>, AccessError> {
        Ok(self.registry.get_servers())
    }

    async fn find_servers(&self, key: &str, value: &str) -> Result<Vec<Node>, AccessError> {
        Ok(self.registry.find_servers(key, value))
    }
}

/// CA public keys as last fetched from an access point.
///
/// Every lookup refreshes from the access point; when it is unreachable the
/// last good copy is used so established trust survives an auth outage.
pub struct TrustCache {
    access: Arc<dyn AccessPoint>,
    cached: ArcSwapOption<TrustedAuthorities>,
}

impl std::fmt::Debug for TrustCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustCache")
            .field("cached", &self.cached.load().is_some())
            .finish_non_exhaustive()
    }
}

impl TrustCache {
    pub fn new(access: Arc<dyn AccessPoint>) -> Self {
        Self {
            access,
            cached: ArcSwapOption::empty(),
        }
    }

    pub fn access(&self) -> &Arc<dyn AccessPoint> {
        &self.access
    }

    pub async fn current(&self) -> Result<Arc<TrustedAuthorities>, AccessError> {
        match self.access.get_cert_authorities().await {
            Ok(trust) => {
                let trust = Arc::new(trust);
                self.cached.store(Some(Arc::clone(&trust)));
                Ok(trust)
            }
            Err(e) => match self.cached.load_full() {
                Some(trust) => {
                    warn!(error = %e, "access point unreachable, using cached trust roots");
                    Ok(trust)
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        up: AtomicBool,
        trust: TrustedAuthorities,
    }

    #[async_trait]
    impl AccessPoint for Flaky {
        async fn get_cert_authorities(&self) -> Result<TrustedAuthorities, AccessError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(self.trust.clone())
            } else {
                Err(AccessError::Unavailable("down".into()))
            }
        }

        async fn upsert_server(&self, _: Node, _: Duration) -> Result<(), AccessError> {
            Ok(())
        }

        async fn get_servers(&self) -> Result<Vec<Node>, AccessError> {
            Ok(Vec::new())
        }

        async fn find_servers(&self, _: &str, _: &str) -> Result<Vec<Node>, AccessError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_trust_cache_falls_back_to_last_good() {
        let ca = CertificateAuthority::new(Default::default()).unwrap();
        ca.reset_host_certificate_authority(Some([1; 32]));
        let flaky = Arc::new(Flaky {
            up: AtomicBool::new(false),
            trust: ca.trusted_authorities(),
        });
        let cache = TrustCache::new(Arc::clone(&flaky) as Arc<dyn AccessPoint>);

        assert!(cache.current().await.is_err());

        flaky.up.store(true, Ordering::SeqCst);
        let trust = cache.current().await.unwrap();

        flaky.up.store(false, Ordering::SeqCst);
        assert_eq!(*cache.current().await.unwrap(), *trust);
    }

    #[tokio::test]
    async fn test_local_access_point_round_trip() {
        let ca = Arc::new(CertificateAuthority::new(Default::default()).unwrap());
        let registry = Arc::new(Registry::new(None));
        let access = LocalAccessPoint::new(ca, Arc::clone(&registry));

        access
            .upsert_server(
                Node::new("127.0.0.1:3022", "n1").with_label("role", "db"),
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(access.get_servers().await.unwrap().len(), 1);
        assert_eq!(access.find_servers("role", "db").await.unwrap().len(), 1);
    }
}
