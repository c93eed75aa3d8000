//! Hub engine coordinator.
//!
//! The main orchestrator that ties together all components:
//! - Coordination backend (Redis, or an injected implementation)
//! - Cursor store and registrations (Redis hashes shared by the cluster, or
//!   a node-local SQLite file)
//! - Replication service (one replicator per claimed channel)
//! - Group supervisor (one delivery engine per stored group)
//! - Periodic cursor flush and registration refresh tasks
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            HubEngine                              │
//! │                                                                   │
//! │  ┌────────────────────┐        ┌────────────────────────────────┐ │
//! │  │ ReplicationService │──────► │ ChannelReplicator (per channel)│ │
//! │  └────────────────────┘        └────────────────────────────────┘ │
//! │  ┌────────────────────┐        ┌────────────────────────────────┐ │
//! │  │ GroupSupervisor    │──────► │ GroupDeliveryEngine (per group)│ │
//! │  └────────────────────┘        └────────────────────────────────┘ │
//! │            │                                  │                   │
//! │            ▼                                  ▼                   │
//! │  ┌────────────────────┐        ┌────────────────────────────────┐ │
//! │  │ CursorStore        │        │ CoordinationService (leases)   │ │
//! │  └────────────────────┘        └────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

mod types;

pub use types::{EngineState, HealthCheck};

use crate::config::{HubConfig, StateStore};
use crate::content::{ChannelService, ContentStore};
use crate::cursor::{CursorBackend, CursorStore, SqliteCursors};
use crate::error::{HubError, Result};
use crate::group::{DeliveryContext, GroupService, GroupSupervisor, HttpDeliveryClient, ReqwestDeliveryClient};
use crate::leadership::{CoordinationService, RedisCoordination};
use crate::metrics;
use crate::redis_state::{RedisCursors, RedisRegistrations};
use crate::registry::{RegistrationStore, Registry};
use crate::replication::{
    GuardedChannels, HttpRemoteChannelClient, RemoteChannelClient, ReplicationContext,
    ReplicationService,
};
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The services built by `start()`.
struct Running {
    cursors: Arc<CursorStore>,
    coordination: Arc<dyn CoordinationService>,
    replication: Arc<ReplicationService>,
    supervisor: Arc<GroupSupervisor>,
    groups: Arc<GroupService>,
    channels: GuardedChannels,
}

/// The hub replication engine.
///
/// Owns the cursor store and the coordination session and keeps the
/// replicators and delivery engines in line with the stored registrations.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let store = Arc::new(MemoryContentStore::new());
/// let mut engine = HubEngine::new(config, store.clone(), store);
/// engine.start().await?;
///
/// engine.replication().unwrap().put_domain(domain).await?;
///
/// engine.shutdown().await;
/// ```
pub struct HubEngine {
    config: HubConfig,

    /// Local storage collaborators
    content: Arc<dyn ContentStore>,
    channels: Arc<dyn ChannelService>,

    /// Injected collaborators; built from config in `start()` when absent
    coordination: Option<Arc<dyn CoordinationService>>,
    remote: Option<Arc<dyn RemoteChannelClient>>,
    http: Option<Arc<dyn HttpDeliveryClient>>,
    shared_state: Option<(Arc<dyn CursorBackend>, Arc<dyn RegistrationStore>)>,

    /// Set when `start()` connected to Redis itself
    redis: Option<Arc<RedisCoordination>>,

    running: Option<Running>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    task_handles: Vec<JoinHandle<()>>,
}

impl HubEngine {
    /// Create a new engine over the local storage collaborators.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the cursor store and begin replicating and delivering.
    pub fn new(
        config: HubConfig,
        content: Arc<dyn ContentStore>,
        channels: Arc<dyn ChannelService>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            content,
            channels,
            coordination: None,
            remote: None,
            http: None,
            shared_state: None,
            redis: None,
            running: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            task_handles: Vec::new(),
        }
    }

    /// Use `coordination` instead of connecting to `coordination.redis_url`.
    pub fn with_coordination(mut self, coordination: Arc<dyn CoordinationService>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    /// Use `remote` instead of the HTTP/WebSocket client.
    pub fn with_remote_client(mut self, remote: Arc<dyn RemoteChannelClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use `http` instead of the reqwest webhook client.
    pub fn with_delivery_client(mut self, http: Arc<dyn HttpDeliveryClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Keep cursors and registrations in the given stores instead of the
    /// one named by `cursor.store`.
    pub fn with_shared_state(
        mut self,
        cursors: Arc<dyn CursorBackend>,
        registrations: Arc<dyn RegistrationStore>,
    ) -> Self {
        self.shared_state = Some((cursors, registrations));
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Replication domain administration. `None` until started.
    pub fn replication(&self) -> Option<&Arc<ReplicationService>> {
        self.running.as_ref().map(|r| &r.replication)
    }

    /// Group administration. `None` until started.
    pub fn groups(&self) -> Option<&Arc<GroupService>> {
        self.running.as_ref().map(|r| &r.groups)
    }

    pub fn group_supervisor(&self) -> Option<&Arc<GroupSupervisor>> {
        self.running.as_ref().map(|r| &r.supervisor)
    }

    /// Local channel access with replication claims enforced.
    pub fn channels(&self) -> Option<&GuardedChannels> {
        self.running.as_ref().map(|r| &r.channels)
    }

    pub fn cursors(&self) -> Option<&Arc<CursorStore>> {
        self.running.as_ref().map(|r| &r.cursors)
    }

    /// Get a health snapshot for monitoring endpoints.
    ///
    /// Performs no network I/O: everything comes from cached state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let Some(running) = self.running.as_ref() else {
            return HealthCheck {
                state,
                coordination: None,
                ready: false,
                healthy: false,
                replicators_running: 0,
                replicators_invalid: 0,
                replicators_connected: 0,
                groups_running: 0,
                groups_leading: 0,
                cursors_dirty: 0,
            };
        };

        let coordination = *running.coordination.connection_state().borrow();
        let statuses = running.replication.status();
        let replicators_invalid = statuses.iter().filter(|s| !s.valid).count();
        let replicators_connected = statuses.iter().filter(|s| s.connected).count();

        let ready = state == EngineState::Running
            && coordination == crate::leadership::ConnectionState::Connected;
        let healthy = ready && replicators_invalid == 0;

        HealthCheck {
            state,
            coordination: Some(coordination),
            ready,
            healthy,
            replicators_running: statuses.len(),
            replicators_invalid,
            replicators_connected,
            groups_running: running.supervisor.running(),
            groups_leading: running.supervisor.leading(),
            cursors_dirty: running.cursors.dirty_count().await,
        }
    }

    /// Start the engine.
    ///
    /// 1. Connects to the coordination backend
    /// 2. Opens the cursor store and registrations
    /// 3. Starts replicators and delivery engines for stored registrations
    /// 4. Spawns the cursor flush and registration refresh tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(HubError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(node_id = %self.config.node_id, host = %self.config.host, "Starting hub engine");
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        let running = match self.open().await {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "Hub engine failed to start");
                if let Some(redis) = self.redis.take() {
                    redis.shutdown();
                }
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                return Err(e);
            }
        };

        self.spawn_cursor_flush_task(Arc::clone(&running.cursors));
        let refresh_interval = self.config.refresh_interval();
        if !refresh_interval.is_zero() {
            self.spawn_refresh_task(
                Arc::clone(&running.replication),
                Arc::clone(&running.supervisor),
                refresh_interval,
            );
        }

        info!(
            replicators = running.replication.running(),
            groups = running.supervisor.running(),
            "Hub engine running"
        );
        self.running = Some(running);
        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        Ok(())
    }

    async fn open(&mut self) -> Result<Running> {
        self.config.validate()?;

        let coordination = match &self.coordination {
            Some(coordination) => Arc::clone(coordination),
            None => {
                let redis =
                    RedisCoordination::connect(&self.config.coordination, &RetryConfig::startup())
                        .await?;
                self.redis = Some(Arc::clone(&redis));
                redis as Arc<dyn CoordinationService>
            }
        };

        let (cursors, registry) = self.open_state().await?;

        let remote: Arc<dyn RemoteChannelClient> = match &self.remote {
            Some(remote) => Arc::clone(remote),
            None => Arc::new(HttpRemoteChannelClient::new(
                self.config.replication.remote_timeout(),
            )?),
        };

        let http: Arc<dyn HttpDeliveryClient> = match &self.http {
            Some(http) => Arc::clone(http),
            None => Arc::new(ReqwestDeliveryClient::new(
                self.config.delivery.request_timeout(),
            )?),
        };

        let replication_ctx = ReplicationContext {
            node_id: self.config.node_id.clone(),
            coordination: Arc::clone(&coordination),
            coordination_config: self.config.coordination.clone(),
            settings: self.config.replication.clone(),
            remote,
            content: Arc::clone(&self.content),
            channels: Arc::clone(&self.channels),
            cursors: Arc::clone(&cursors),
        };
        let replication = Arc::new(ReplicationService::new(
            self.config.host.clone(),
            registry.clone(),
            replication_ctx,
        ));

        let delivery_ctx = DeliveryContext {
            node_id: self.config.node_id.clone(),
            coordination: Arc::clone(&coordination),
            coordination_config: self.config.coordination.clone(),
            delivery: self.config.delivery.clone(),
            groups: Arc::new(registry.clone()),
            content: Arc::clone(&self.content),
            http,
            cursors: Arc::clone(&cursors),
        };
        let supervisor = Arc::new(GroupSupervisor::new(delivery_ctx.clone(), registry.clone()));
        let groups = Arc::new(GroupService::new(
            registry,
            Arc::clone(&supervisor),
            delivery_ctx,
        ));

        let channels = GuardedChannels::new(
            replication.guard().clone(),
            Arc::clone(&self.content),
            Arc::clone(&self.channels),
        );

        replication.refresh().await?;
        supervisor.refresh().await?;

        Ok(Running {
            cursors,
            coordination,
            replication,
            supervisor,
            groups,
            channels,
        })
    }

    async fn open_state(&self) -> Result<(Arc<CursorStore>, Registry)> {
        if let Some((cursors, registrations)) = &self.shared_state {
            let cursors = CursorStore::with_backend(Arc::clone(cursors)).await?;
            return Ok((Arc::new(cursors), Registry::with_store(Arc::clone(registrations))));
        }

        match self.config.cursor.store {
            StateStore::Redis => {
                let Some(redis) = &self.redis else {
                    return Err(HubError::Config(
                        "cursor.store = redis needs the Redis coordination backend".into(),
                    ));
                };
                info!(prefix = %redis.key_prefix(), "Cursors and registrations in Redis");
                let cursors = CursorStore::with_backend(Arc::new(RedisCursors::new(redis))).await?;
                let registry = Registry::with_store(Arc::new(RedisRegistrations::new(redis)));
                Ok((Arc::new(cursors), registry))
            }
            StateStore::Sqlite => {
                let cursor = &self.config.cursor;
                let backend = SqliteCursors::open(&cursor.sqlite_path, cursor.wal_mode).await?;
                let registry = Registry::new(backend.pool().clone()).await?;
                let cursors = CursorStore::with_backend(Arc::new(backend)).await?;
                Ok((Arc::new(cursors), registry))
            }
        }
    }

    /// Spawn cursor flush task for debounced writes.
    fn spawn_cursor_flush_task(&mut self, cursors: Arc<CursorStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.cursor.flush_interval();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = cursors.flush_dirty().await {
                            warn!(error = %e, "Failed to flush cursors");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Cursor flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned cursor flush task");
        self.task_handles.push(handle);
    }

    /// Spawn the task that re-reads registrations made on other nodes.
    fn spawn_refresh_task(
        &mut self,
        replication: Arc<ReplicationService>,
        supervisor: Arc<GroupSupervisor>,
        refresh_interval: Duration,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(refresh_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // start() already refreshed
            timer.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Refresh task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = replication.refresh().await {
                            warn!(error = %e, "Replication refresh failed");
                            metrics::record_error("replication", "refresh");
                        }
                        if let Err(e) = supervisor.refresh().await {
                            warn!(error = %e, "Group refresh failed");
                            metrics::record_error("group", "refresh");
                        }
                    }
                }
            }
        });

        info!(interval_ms = refresh_interval.as_millis() as u64, "Spawned registration refresh task");
        self.task_handles.push(handle);
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal background tasks to stop
    /// 2. Wait for background tasks (with timeout), so no refresh restarts
    ///    what step 3 stops
    /// 3. Exit every replicator and delivery engine (leases released)
    /// 4. Flush, checkpoint and close the cursor store
    pub async fn shutdown(&mut self) {
        info!("Shutting down hub engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.task_handles);
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(running) = self.running.take() {
            running.replication.stop_all().await;
            running.supervisor.stop_all().await;
            running.cursors.close().await;
        }
        if let Some(redis) = self.redis.take() {
            redis.shutdown();
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Hub engine stopped");
    }
}
