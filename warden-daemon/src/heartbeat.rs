//! Periodic node announcements into the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::{AccessPoint, Node};

use crate::labels::Labels;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Announces a node every `interval`, and immediately whenever a command
/// label produces a new result.
pub struct Heartbeat {
    access: Arc<dyn AccessPoint>,
    node: Node,
    labels: Option<watch::Receiver<Labels>>,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(access: Arc<dyn AccessPoint>, node: Node) -> Self {
        Self {
            access,
            node,
            labels: None,
            interval: DEFAULT_INTERVAL,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_labels(mut self, labels: watch::Receiver<Labels>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn snapshot(&mut self) -> Node {
        let mut node = self.node.clone();
        if let Some(labels) = self.labels.as_mut() {
            node.cmd_labels = labels.borrow_and_update().clone();
        }
        node
    }

    /// Send one heartbeat.
    pub async fn beat(&mut self) -> Result<(), warden_core::AccessError> {
        let node = self.snapshot();
        debug!(node = %node.id, "heartbeat");
        self.access.upsert_server(node, self.ttl).await
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let labels_changed = async {
                match self.labels.as_mut() {
                    Some(labels) => labels.changed().await.is_ok(),
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ticker.tick() => {}
                open = labels_changed => {
                    if !open {
                        // Label tasks finished; keep the last results and beat on the timer.
                        if let Some(labels) = self.labels.as_mut() {
                            let last = labels.borrow().clone();
                            self.node.cmd_labels = last;
                        }
                        self.labels = None;
                    }
                }
                _ = shutdown.cancelled() => break,
            }

            if let Err(e) = self.beat().await {
                warn!(node = %self.node.id, error = %e, "heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_point::LocalAccessPoint;
    use crate::labels::LabelRunners;
    use crate::registry::Registry;
    use warden_auth::CertificateAuthority;
    use warden_core::CommandLabel;

    #[tokio::test]
    async fn test_label_results_reach_registry() {
        let ca = Arc::new(CertificateAuthority::new(Default::default()).unwrap());
        let registry = Arc::new(Registry::new(None));
        let access = Arc::new(LocalAccessPoint::new(ca, Arc::clone(&registry)));
        let shutdown = CancellationToken::new();

        let mut labels = Labels::new();
        labels.insert(
            "cmdLabel1".into(),
            CommandLabel::new(Duration::from_secs(1), ["expr", "1", "+", "3"]),
        );
        let runners = LabelRunners::spawn(labels, shutdown.clone());

        let node = Node::new("127.0.0.1:30185", "node-1").with_label("label1", "value1");
        let heartbeat = Heartbeat::new(access, node)
            .with_labels(runners.subscribe())
            .with_interval(Duration::from_secs(60));
        tokio::spawn(heartbeat.run(shutdown.clone()));

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let found = registry.find_servers("cmdLabel1", "4");
                if !found.is_empty() {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(found[0].id.as_str(), "127.0.0.1_30185");
        assert_eq!(registry.find_servers("label1", "value1").len(), 1);
        shutdown.cancel();
    }
}
