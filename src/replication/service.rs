//! Replication domain administration.
//!
//! Stored domains are the desired state; [`ReplicationService::refresh`]
//! reconciles the running [`ChannelReplicator`]s with them: one replicator
//! per claimed channel, stopped when its claim goes away.

use super::{ChannelReplicator, ReplicationContext, ReplicationPolicyGuard};
use crate::error::{HubError, Result};
use crate::metrics;
use crate::model::{ReplicationDomain, ReplicationStatus};
use crate::registry::Registry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ReplicationService {
    host: String,
    registry: Registry,
    guard: ReplicationPolicyGuard,
    ctx: ReplicationContext,
    replicators: DashMap<String, Arc<ChannelReplicator>>,
    refresh_lock: Mutex<()>,
}

impl ReplicationService {
    /// `host` is this hub's own name; a domain equal to it is rejected.
    pub fn new(host: impl Into<String>, registry: Registry, ctx: ReplicationContext) -> Self {
        let guard = ReplicationPolicyGuard::new(Arc::new(registry.clone()));
        Self {
            host: host.into(),
            registry,
            guard,
            ctx,
            replicators: DashMap::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn guard(&self) -> &ReplicationPolicyGuard {
        &self.guard
    }

    /// Validate, store and apply a domain.
    pub async fn put_domain(&self, domain: ReplicationDomain) -> Result<()> {
        if domain.domain.eq_ignore_ascii_case(&self.host) {
            return Err(HubError::InvalidRequest(format!(
                "{} cannot replicate from itself",
                domain.domain
            )));
        }
        self.guard.validate_domain(&domain).await?;
        self.registry.put_domain(&domain).await?;
        self.refresh().await
    }

    pub async fn get_domain(&self, domain: &str) -> Result<Option<ReplicationDomain>> {
        self.registry.find_domain(domain).await
    }

    pub async fn list_domains(&self) -> Result<Vec<ReplicationDomain>> {
        self.registry.list_domains().await
    }

    /// Returns `false` if the domain did not exist.
    pub async fn delete_domain(&self, domain: &str) -> Result<bool> {
        let removed = self.registry.delete_domain(domain).await?;
        if removed {
            info!(domain = %domain, "Deleted replication domain");
            self.refresh().await?;
        }
        Ok(removed)
    }

    /// Start replicators for newly claimed channels, stop unclaimed ones and
    /// retry ones whose last verification failed.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let mut desired: BTreeMap<String, (String, u32)> = BTreeMap::new();
        for domain in self.registry.list_domains().await? {
            for channel in &domain.exclude_except {
                let url = self.ctx.settings.channel_url(&domain.domain, channel);
                desired.insert(channel.clone(), (url, domain.historical_days));
            }
        }

        // A changed URL or history window needs a fresh replicator
        let stale: Vec<String> = self
            .replicators
            .iter()
            .filter(|r| {
                let current = (r.value().url(), r.value().historical_days());
                desired.get(r.key()).map(|(url, days)| (url.as_str(), *days)) != Some(current)
            })
            .map(|r| r.key().clone())
            .collect();
        for channel in stale {
            if let Some((_, replicator)) = self.replicators.remove(&channel) {
                info!(channel = %channel, "Stopping replication");
                replicator.exit().await;
            }
        }

        for (channel, (url, days)) in desired {
            let existing = self.replicators.get(&channel).map(|r| Arc::clone(r.value()));
            let replicator = match existing {
                Some(r) if r.is_valid() => continue,
                Some(r) => r,
                None => {
                    let r = Arc::new(ChannelReplicator::new(url, &channel, days, self.ctx.clone()));
                    self.replicators.insert(channel.clone(), Arc::clone(&r));
                    r
                }
            };
            if replicator.try_leadership().await {
                info!(channel = %channel, url = %replicator.url(), "Replication started");
            } else {
                warn!(channel = %channel, reason = %replicator.message(), "Replication not started");
            }
        }

        metrics::set_running_replicators(self.replicators.len());
        Ok(())
    }

    pub fn replicator(&self, channel: &str) -> Option<Arc<ChannelReplicator>> {
        self.replicators.get(channel).map(|r| Arc::clone(r.value()))
    }

    /// Status of every replicated channel, by name.
    pub fn status(&self) -> Vec<ReplicationStatus> {
        let mut statuses: Vec<ReplicationStatus> =
            self.replicators.iter().map(|r| r.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn running(&self) -> usize {
        self.replicators.len()
    }

    /// Stop every replicator without touching stored domains.
    pub async fn stop_all(&self) {
        let _guard = self.refresh_lock.lock().await;
        let channels: Vec<String> = self.replicators.iter().map(|r| r.key().clone()).collect();
        for channel in channels {
            if let Some((_, replicator)) = self.replicators.remove(&channel) {
                replicator.exit().await;
            }
        }
        metrics::set_running_replicators(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationConfig, ReplicationSettings};
    use crate::content::{ChannelService, ContentStore, MemoryContentStore};
    use crate::cursor::CursorStore;
    use crate::leadership::InMemoryCoordination;
    use crate::replication::remote::RemoteChannelClient;
    use crate::replication::testing::FakeRemote;
    use std::time::Duration;

    async fn service(remote: &Arc<FakeRemote>) -> (ReplicationService, Arc<MemoryContentStore>) {
        let store = Arc::new(MemoryContentStore::new());
        let cursors = Arc::new(CursorStore::in_memory().await.unwrap());
        let registry = Registry::in_memory().await.unwrap();
        let ctx = ReplicationContext {
            node_id: "node-a".into(),
            coordination: Arc::new(InMemoryCoordination::new()),
            coordination_config: CoordinationConfig::for_testing(),
            settings: ReplicationSettings::for_testing(),
            remote: Arc::clone(remote) as Arc<dyn RemoteChannelClient>,
            content: Arc::clone(&store) as Arc<dyn ContentStore>,
            channels: Arc::clone(&store) as Arc<dyn ChannelService>,
            cursors,
        };
        (ReplicationService::new("hub.local", registry, ctx), store)
    }

    #[tokio::test]
    async fn test_rejects_own_host() {
        let remote = Arc::new(FakeRemote::new("http://hub.local/channel/orders"));
        let (service, _) = service(&remote).await;
        let err = service
            .put_domain(ReplicationDomain::new("hub.local", ["orders"]))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest(_)));
        assert!(service.list_domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_claim_is_forbidden() {
        let remote = Arc::new(FakeRemote::new("http://hub.west/channel/orders"));
        remote.fill_fresh(1000..=1000);
        let (service, _) = service(&remote).await;

        service
            .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
            .await
            .unwrap();
        let err = service
            .put_domain(ReplicationDomain::new("hub.east", ["orders"]))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Forbidden(_)));
        assert!(service.get_domain("hub.east").await.unwrap().is_none());
        service.stop_all().await;
    }

    #[tokio::test]
    async fn test_domain_lifecycle_drives_replicators() {
        let remote = Arc::new(FakeRemote::new("http://hub.west/channel/orders"));
        remote.fill_fresh(1000..=1002);
        let (service, store) = service(&remote).await;

        service
            .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
            .await
            .unwrap();
        assert_eq!(service.running(), 1);
        let replicator = service.replicator("orders").unwrap();
        assert_eq!(replicator.url(), "http://hub.west/channel/orders");

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len("orders") < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let status = service.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].valid);

        assert!(matches!(
            service.guard().throw_exception_if_replicating("orders").await,
            Err(HubError::Forbidden(_))
        ));

        assert!(service.delete_domain("hub.west").await.unwrap());
        assert_eq!(service.running(), 0);
        assert!(!replicator.is_connected());
        assert!(!service.delete_domain("hub.west").await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_history_window_replaces_replicator() {
        let remote = Arc::new(FakeRemote::new("http://hub.west/channel/orders"));
        remote.fill_fresh(1000..=1000);
        let (service, _) = service(&remote).await;

        service
            .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
            .await
            .unwrap();
        let first = service.replicator("orders").unwrap();
        assert_eq!(first.historical_days(), 1);

        let mut widened = ReplicationDomain::new("hub.west", ["orders"]);
        widened.historical_days = 7;
        service.put_domain(widened).await.unwrap();

        let second = service.replicator("orders").unwrap();
        assert_eq!(second.historical_days(), 7);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(service.running(), 1);
        service.stop_all().await;
    }

    #[tokio::test]
    async fn test_invalid_replicator_is_kept_with_message() {
        let remote = Arc::new(FakeRemote::new("http://hub.west/channel/orders"));
        remote.set_configuration(None);
        let (service, _) = service(&remote).await;

        service
            .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
            .await
            .unwrap();
        let status = service.status();
        assert_eq!(status.len(), 1);
        assert!(!status[0].valid);
        assert!(status[0].message.contains("remote channel missing"));
        service.stop_all().await;
    }
}
