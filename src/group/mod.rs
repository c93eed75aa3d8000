//! Webhook groups: registration and delivery supervision.
//!
//! [`GroupService`] owns the stored registrations. [`GroupSupervisor`]
//! keeps one [`GroupDeliveryEngine`] per stored group on every node; the
//! engines compete for leadership so each group is delivered by one node.

pub mod caller;
pub mod client;
pub mod queue;

pub use caller::{envelope, leader_path, DeliveryContext, GroupDeliveryEngine};
pub use client::{HttpDeliveryClient, ReqwestDeliveryClient};
pub use queue::{DeliveryQueue, PollingDeliveryQueue};

use crate::content_key::ContentKey;
use crate::error::{HubError, Result};
use crate::metrics;
use crate::model::{Group, GroupStatus};
use crate::registry::Registry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Runs delivery engines for the stored groups.
pub struct GroupSupervisor {
    ctx: DeliveryContext,
    registry: Registry,
    engines: DashMap<String, Arc<GroupDeliveryEngine>>,
    refresh_lock: Mutex<()>,
}

impl GroupSupervisor {
    pub fn new(ctx: DeliveryContext, registry: Registry) -> Self {
        Self {
            ctx,
            registry,
            engines: DashMap::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Start engines for new groups and stop engines of removed ones.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let groups = self.registry.list_groups().await?;
        let names: BTreeSet<&str> = groups.iter().map(|g| g.name.as_str()).collect();

        let removed: Vec<String> = self
            .engines
            .iter()
            .filter(|e| !names.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for name in removed {
            if let Some((_, engine)) = self.engines.remove(&name) {
                engine.exit(false).await;
            }
        }

        for group in &groups {
            if self.engines.contains_key(&group.name) {
                continue;
            }
            let engine = Arc::new(GroupDeliveryEngine::new(group, self.ctx.clone()));
            engine.try_leadership();
            self.engines.insert(group.name.clone(), engine);
            info!(group = %group.name, "Group engine started");
        }

        metrics::set_running_groups(self.engines.len());
        Ok(())
    }

    /// Stop the group's engine and delete its progress.
    ///
    /// Without a local engine, the state is reclaimed only if no other node
    /// is competing for the group.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        match self.engines.remove(name) {
            Some((_, engine)) => {
                engine.exit(false).await;
                engine.delete_anyway().await;
            }
            None => {
                self.delete_if_ready(name).await?;
            }
        }
        metrics::set_running_groups(self.engines.len());
        Ok(())
    }

    /// Reclaim the state of a group nobody competes for.
    pub async fn delete_if_ready(&self, name: &str) -> Result<bool> {
        let participants = match self.ctx.coordination.participants(&leader_path(name)).await {
            Ok(participants) => participants,
            Err(e) => {
                warn!(group = %name, error = %e, "Unable to read group participants");
                Vec::new()
            }
        };
        if !participants.is_empty() {
            return Ok(false);
        }
        caller::delete_group_state(&self.ctx, name).await;
        Ok(true)
    }

    pub fn engine(&self, name: &str) -> Option<Arc<GroupDeliveryEngine>> {
        self.engines.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn running(&self) -> usize {
        self.engines.len()
    }

    /// Engines currently holding their group's leadership on this node.
    pub fn leading(&self) -> usize {
        self.engines.iter().filter(|e| e.value().has_leadership()).count()
    }

    /// Stop every engine, keeping progress.
    pub async fn stop_all(&self) {
        let _guard = self.refresh_lock.lock().await;
        let names: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, engine)) = self.engines.remove(&name) {
                engine.exit(false).await;
            }
        }
        metrics::set_running_groups(0);
    }
}

/// Group registration and status.
pub struct GroupService {
    registry: Registry,
    supervisor: Arc<GroupSupervisor>,
    ctx: DeliveryContext,
}

impl GroupService {
    pub fn new(registry: Registry, supervisor: Arc<GroupSupervisor>, ctx: DeliveryContext) -> Self {
        Self {
            registry,
            supervisor,
            ctx,
        }
    }

    /// Store a group.
    ///
    /// Returns the existing group if an equal one is stored (nothing
    /// changes), `None` if the group is new. A different group under the
    /// same name is a conflict.
    pub async fn upsert_group(&self, group: Group) -> Result<Option<Group>> {
        info!(group = %group.name, "Upsert group");
        let group = group.with_defaults(self.ctx.delivery.default_parallel_calls);
        group.validate()?;

        if let Some(existing) = self.registry.find_group(&group.name).await? {
            if existing == group {
                return Ok(Some(existing));
            }
            return Err(HubError::Conflict("Groups are immutable".into()));
        }

        self.registry.insert_group(&group).await?;
        self.supervisor.refresh().await?;
        Ok(None)
    }

    pub async fn get_group(&self, name: &str) -> Result<Option<Group>> {
        self.registry.find_group(name).await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.registry.list_groups().await
    }

    /// Delivery progress of every group, by name.
    pub async fn status(&self) -> Result<Vec<GroupStatus>> {
        let mut statuses = Vec::new();
        for group in self.registry.list_groups().await? {
            let last_completed = self.ctx.cursors.get(&group.name, ContentKey::NONE).await;
            let channel_latest = match group.channel_name() {
                Some(channel) => self.ctx.content.find_last_key(channel).await?,
                None => None,
            };
            statuses.push(GroupStatus {
                group,
                last_completed,
                channel_latest,
            });
        }
        Ok(statuses)
    }

    /// Delete a group and its progress. Returns `false` if it did not exist.
    pub async fn delete_group(&self, name: &str) -> Result<bool> {
        info!(group = %name, "Deleting group");
        let removed = self.registry.delete_group(name).await?;
        self.supervisor.delete(name).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationConfig, DeliveryConfig};
    use crate::content::{ChannelService, ContentStore, MemoryContentStore};
    use crate::cursor::CursorStore;
    use crate::error::BoxFuture;
    use crate::leadership::{CoordinationService, InMemoryCoordination};
    use crate::model::{ChannelConfiguration, Content};
    use std::time::Duration;

    struct OkClient;

    impl HttpDeliveryClient for OkClient {
        fn post_json(&self, _url: &str, _body: &serde_json::Value) -> BoxFuture<'_, u16> {
            Box::pin(async { Ok(200) })
        }
    }

    async fn setup() -> (GroupService, Arc<GroupSupervisor>, Arc<MemoryContentStore>) {
        let store = Arc::new(MemoryContentStore::new());
        store
            .create_channel(ChannelConfiguration::sequence("orders", Duration::from_secs(60)))
            .await
            .unwrap();
        let cursors = Arc::new(CursorStore::in_memory().await.unwrap());
        let registry = Registry::in_memory().await.unwrap();
        let ctx = DeliveryContext {
            node_id: "node-a".into(),
            coordination: Arc::new(InMemoryCoordination::new()) as Arc<dyn CoordinationService>,
            coordination_config: CoordinationConfig::for_testing(),
            delivery: DeliveryConfig::for_testing(),
            groups: Arc::new(registry.clone()),
            content: Arc::clone(&store) as Arc<dyn ContentStore>,
            http: Arc::new(OkClient),
            cursors,
        };
        let supervisor = Arc::new(GroupSupervisor::new(ctx.clone(), registry.clone()));
        let service = GroupService::new(registry, Arc::clone(&supervisor), ctx);
        (service, supervisor, store)
    }

    fn group() -> Group {
        Group::new("billing", "http://client/callback", "http://hub/channel/orders")
    }

    #[tokio::test]
    async fn test_upsert_applies_defaults_and_starts_engine() {
        let (service, supervisor, _) = setup().await;
        assert_eq!(service.upsert_group(group()).await.unwrap(), None);

        let stored = service.get_group("billing").await.unwrap().unwrap();
        assert_eq!(stored.parallel_calls, 1);
        assert_eq!(supervisor.running(), 1);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_upsert_is_immutable() {
        let (service, supervisor, _) = setup().await;
        service.upsert_group(group()).await.unwrap();

        let again = service.upsert_group(group()).await.unwrap();
        assert_eq!(again.map(|g| g.name), Some("billing".to_string()));

        let err = service
            .upsert_group(group().with_parallel_calls(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(m) if m == "Groups are immutable"));
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid() {
        let (service, supervisor, _) = setup().await;
        let bad = Group::new("bad name", "http://client/callback", "http://hub/channel/orders");
        assert!(matches!(
            service.upsert_group(bad).await,
            Err(HubError::InvalidRequest(_))
        ));
        assert!(service.list_groups().await.unwrap().is_empty());
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let (service, supervisor, store) = setup().await;
        let mut content = Content::new("x");
        content.key = ContentKey::new(5_000, "k");
        let key = store.write("orders", content).await.unwrap();

        service.upsert_group(group()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = service.status().await.unwrap();
                if status[0].last_completed == key {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status[0].channel_latest, Some(key));
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_delete_stops_engine_and_forgets_group() {
        let (service, supervisor, _) = setup().await;
        service.upsert_group(group()).await.unwrap();
        assert!(service.delete_group("billing").await.unwrap());
        assert_eq!(supervisor.running(), 0);
        assert!(service.get_group("billing").await.unwrap().is_none());
        assert!(!service.delete_group("billing").await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_stops_removed_groups() {
        let (service, supervisor, _) = setup().await;
        service.upsert_group(group()).await.unwrap();
        service.registry.delete_group("billing").await.unwrap();
        supervisor.refresh().await.unwrap();
        assert_eq!(supervisor.running(), 0);
        assert!(supervisor.delete_if_ready("billing").await.unwrap());
    }
}
