//! # Hub Replication
//!
//! The replication core of a content hub: cross-hub channel replication and
//! webhook group delivery, coordinated so that each unit of work runs on
//! exactly one node of the cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              hub-replication                             │
//! │                                                                          │
//! │  remote hub ──WS/HTTP──► RemoteSequenceStream ──► ChannelReplicator ──┐  │
//! │                                 ▲                        │            │  │
//! │                        ResumePointFinder                 ▼            ▼  │
//! │                                                   ContentStore   CursorStore
//! │                                                          │  (Redis/SQLite)│
//! │  webhook ◄──POST── GroupDeliveryEngine ◄── DeliveryQueue ┘            ▲  │
//! │                            │                                          │  │
//! │                            └──────────── progress cursor ─────────────┘  │
//! │                                                                          │
//! │  LeadershipCoordinator (Redis leases) gates every replicator and engine  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hub_replication::{HubConfig, HubEngine, MemoryContentStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HubConfig::default();
//!     let store = Arc::new(MemoryContentStore::new());
//!
//!     let mut engine = HubEngine::new(config, store.clone(), store);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod config;
pub mod content;
pub mod content_key;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod group;
pub mod leadership;
pub mod metrics;
pub mod model;
pub mod redis_state;
pub mod registry;
pub mod replication;
pub mod resilience;

// Re-exports for convenience
pub use config::{
    CoordinationConfig, CursorConfig, DeliveryConfig, HubConfig, ReplicationSettings, StateStore,
};
pub use content::{ChannelService, ContentStore, MemoryContentStore};
pub use content_key::ContentKey;
pub use coordinator::{EngineState, HealthCheck, HubEngine};
pub use cursor::{CursorBackend, CursorStore, MemoryCursors, SqliteCursors};
pub use error::{BoxFuture, HubError, Result};
pub use group::{GroupDeliveryEngine, GroupService, GroupSupervisor, HttpDeliveryClient};
pub use leadership::{
    ConnectionState, CoordinationService, InMemoryCoordination, Leader, LeadershipCoordinator,
    LeadershipToken, RedisCoordination,
};
pub use model::{ChannelConfiguration, Content, Group, KeyScheme, RemoteChannel, ReplicationDomain};
pub use redis_state::{RedisCursors, RedisRegistrations};
pub use registry::{MemoryRegistrations, RegistrationStore, Registry, SqliteRegistrations};
pub use replication::{
    ChannelReplicator, GuardedChannels, RemoteChannelClient, RemoteSequenceStream,
    ReplicationPolicyGuard, ReplicationService, ResumePointFinder,
};
