//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A scripted remote hub channel
//! - A recording webhook client
//! - Engine and polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod delivery;
pub mod remote;

pub use containers::*;
pub use delivery::*;
pub use remote::*;

use hub_replication::model::{ChannelConfiguration, Content};
use hub_replication::{
    ChannelService, ContentKey, ContentStore, CoordinationService, HttpDeliveryClient, HubConfig,
    HubEngine, InMemoryCoordination, MemoryContentStore, RemoteChannelClient,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` until it holds, panicking after `limit`.
pub async fn eventually<F, Fut>(limit: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Engine over `store` with in-process coordination and scripted
/// collaborators.
pub fn test_engine(
    config: HubConfig,
    store: &Arc<MemoryContentStore>,
    coordination: &Arc<InMemoryCoordination>,
    remote: &Arc<ScriptedRemote>,
    http: &Arc<RecordingClient>,
) -> HubEngine {
    HubEngine::new(
        config,
        Arc::clone(store) as Arc<dyn ContentStore>,
        Arc::clone(store) as Arc<dyn ChannelService>,
    )
    .with_coordination(Arc::clone(coordination) as Arc<dyn CoordinationService>)
    .with_remote_client(Arc::clone(remote) as Arc<dyn RemoteChannelClient>)
    .with_delivery_client(Arc::clone(http) as Arc<dyn HttpDeliveryClient>)
}

/// Create `channel` locally and write `count` items one second apart.
pub async fn seed_channel(store: &MemoryContentStore, channel: &str, count: i64) -> Vec<ContentKey> {
    store
        .create_channel(ChannelConfiguration::sequence(channel, Duration::from_secs(86_400)))
        .await
        .unwrap();
    let mut keys = Vec::new();
    for i in 1..=count {
        let mut content = Content::new(format!("item-{}", i));
        content.key = ContentKey::new(1_700_000_000_000 + i * 1000, "k");
        keys.push(store.write(channel, content).await.unwrap());
    }
    keys
}
