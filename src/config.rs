//! Configuration for the hub replication core.
//!
//! All configuration is passed to [`HubEngine::new()`](crate::HubEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use hub_replication::config::HubConfig;
//!
//! let config = HubConfig {
//!     node_id: "hub-1".into(),
//!     ..HubConfig::for_testing("hub-1")
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! HubConfig
//! ├── node_id: String                 # This node's identity (lease owner)
//! ├── host: String                    # Local hub host (rejected as a domain)
//! ├── coordination: CoordinationConfig # Redis leases + session health
//! ├── replication: ReplicationSettings # Resume search + streaming
//! ├── delivery: DeliveryConfig        # Webhook retry + dispatch
//! └── cursor: CursorConfig            # Cursor + registration storage
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "hub-east-1"
//! host: "hub.east.example.com"
//!
//! coordination:
//!   redis_url: "redis://coord:6379"
//!   lease_ttl: "10s"
//!
//! replication:
//!   historical_days: 1
//!   stream_wait_timeout: "5m"
//!
//! delivery:
//!   initial_backoff: "1s"
//!   max_backoff: "1m"
//!
//! cursor:
//!   store: redis        # or sqlite + sqlite_path for a single node
//!   flush_interval: "1s"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime string, falling back to `default` when it is malformed.
fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to HubEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `HubEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Identity of this node. Written as the owner of every lease it holds.
    pub node_id: String,

    /// Host name of the local hub. A replication domain naming this host
    /// would replicate the hub into itself and is rejected.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub replication: ReplicationSettings,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Cursors are stored in SQLite for crash recovery.
    #[serde(default)]
    pub cursor: CursorConfig,

    /// How often stored domains and groups are re-read so registrations
    /// made on other nodes start here too. `"0s"` disables the task.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_refresh_interval() -> String {
    "1m".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: "hub.dev.node.default".to_string(),
            host: default_host(),
            coordination: CoordinationConfig::default(),
            replication: ReplicationSettings::default(),
            delivery: DeliveryConfig::default(),
            cursor: CursorConfig::default(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl HubConfig {
    /// Create a minimal config for testing: in-memory SQLite, fast timers.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            host: default_host(),
            coordination: CoordinationConfig::for_testing(),
            replication: ReplicationSettings::for_testing(),
            delivery: DeliveryConfig::for_testing(),
            cursor: CursorConfig::in_memory(),
            refresh_interval: "0s".to_string(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        parse_or(&self.refresh_interval, Duration::from_secs(60))
    }

    /// Check the cross-field constraints serde cannot express.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(crate::error::HubError::Config("node_id must not be empty".into()));
        }
        if self.coordination.renew_interval() >= self.coordination.lease_ttl() {
            return Err(crate::error::HubError::Config(format!(
                "renew_interval ({}) must be shorter than lease_ttl ({})",
                self.coordination.renew_interval, self.coordination.lease_ttl
            )));
        }
        if !self.replication.channel_url_template.contains("{domain}")
            || !self.replication.channel_url_template.contains("{channel}")
        {
            return Err(crate::error::HubError::Config(
                "channel_url_template must contain {domain} and {channel}".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinationConfig: leadership leases over Redis
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordination backend settings.
///
/// A lease is held for `lease_ttl` and renewed every `renew_interval`.
/// If the backend cannot be pinged for `session_timeout` the session is
/// considered lost and every lease held by this node is abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key written to the backend.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    #[serde(default = "default_renew_interval")]
    pub renew_interval: String,

    /// Pause before a relinquished or failed leadership attempt re-queues.
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay: String,

    #[serde(default = "default_session_timeout")]
    pub session_timeout: String,

    #[serde(default = "default_ping_interval")]
    pub ping_interval: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "hub:".to_string()
}

fn default_lease_ttl() -> String {
    "10s".to_string()
}

fn default_renew_interval() -> String {
    "3s".to_string()
}

fn default_requeue_delay() -> String {
    "1s".to_string()
}

fn default_session_timeout() -> String {
    "15s".to_string()
}

fn default_ping_interval() -> String {
    "2s".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            lease_ttl: default_lease_ttl(),
            renew_interval: default_renew_interval(),
            requeue_delay: default_requeue_delay(),
            session_timeout: default_session_timeout(),
            ping_interval: default_ping_interval(),
        }
    }
}

impl CoordinationConfig {
    pub fn for_testing() -> Self {
        Self {
            lease_ttl: "2s".to_string(),
            renew_interval: "100ms".to_string(),
            requeue_delay: "20ms".to_string(),
            session_timeout: "1s".to_string(),
            ping_interval: "100ms".to_string(),
            ..Default::default()
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        parse_or(&self.lease_ttl, Duration::from_secs(10))
    }

    pub fn renew_interval(&self) -> Duration {
        parse_or(&self.renew_interval, Duration::from_secs(3))
    }

    pub fn requeue_delay(&self) -> Duration {
        parse_or(&self.requeue_delay, Duration::from_secs(1))
    }

    pub fn session_timeout(&self) -> Duration {
        parse_or(&self.session_timeout, Duration::from_secs(15))
    }

    pub fn ping_interval(&self) -> Duration {
        parse_or(&self.ping_interval, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: resume search and remote streaming
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for channel replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Retention window (days) searched when a channel has never been
    /// replicated. Domains may override it.
    #[serde(default = "default_historical_days")]
    pub historical_days: u32,

    /// Upper bound on one `has_next()` wait. Only guards against a missed
    /// wake-up; it is not a request timeout.
    #[serde(default = "default_stream_wait_timeout")]
    pub stream_wait_timeout: String,

    /// Timeout for individual HTTP calls to a remote hub.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: String,

    /// Template for the remote channel URL of a domain-claimed channel.
    #[serde(default = "default_channel_url_template")]
    pub channel_url_template: String,
}

fn default_historical_days() -> u32 {
    1
}

fn default_stream_wait_timeout() -> String {
    "5m".to_string()
}

fn default_remote_timeout() -> String {
    "30s".to_string()
}

fn default_channel_url_template() -> String {
    "http://{domain}/channel/{channel}".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            historical_days: default_historical_days(),
            stream_wait_timeout: default_stream_wait_timeout(),
            remote_timeout: default_remote_timeout(),
            channel_url_template: default_channel_url_template(),
        }
    }
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            stream_wait_timeout: "200ms".to_string(),
            remote_timeout: "2s".to_string(),
            ..Default::default()
        }
    }

    pub fn stream_wait_timeout(&self) -> Duration {
        parse_or(&self.stream_wait_timeout, Duration::from_secs(300))
    }

    pub fn remote_timeout(&self) -> Duration {
        parse_or(&self.remote_timeout, Duration::from_secs(30))
    }

    /// Remote URL of `channel` as replicated from `domain`.
    pub fn channel_url(&self, domain: &str, channel: &str) -> String {
        self.channel_url_template
            .replace("{domain}", domain)
            .replace("{channel}", channel)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: webhook retry policy and dispatch
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for group webhook delivery.
///
/// Retries have no attempt limit; they stop when leadership is lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// How long `exit()` waits for in-flight deliveries.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    /// How often the delivery queue polls the source channel.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Maximum keys fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Parallelism applied to groups registered without one.
    #[serde(default = "default_parallel_calls")]
    pub default_parallel_calls: u32,
}

fn default_initial_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "1m".to_string()
}

fn default_shutdown_grace() -> String {
    "1s".to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_parallel_calls() -> u32 {
    1
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            shutdown_grace: default_shutdown_grace(),
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            request_timeout: default_request_timeout(),
            default_parallel_calls: default_parallel_calls(),
        }
    }
}

impl DeliveryConfig {
    pub fn for_testing() -> Self {
        Self {
            initial_backoff: "10ms".to_string(),
            max_backoff: "80ms".to_string(),
            shutdown_grace: "200ms".to_string(),
            poll_interval: "10ms".to_string(),
            request_timeout: "2s".to_string(),
            ..Default::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        parse_or(&self.initial_backoff, Duration::from_secs(1))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_or(&self.max_backoff, Duration::from_secs(60))
    }

    pub fn shutdown_grace(&self) -> Duration {
        parse_or(&self.shutdown_grace, Duration::from_secs(1))
    }

    pub fn poll_interval(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(30))
    }

    /// Retry policy for a single delivery.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig::delivery(self.initial_backoff(), self.max_backoff())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: where progress cursors and registrations live
// ═══════════════════════════════════════════════════════════════════════════════

/// Backend for progress cursors and registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStore {
    /// Hashes in the coordination Redis, shared by the whole cluster.
    Redis,
    /// A SQLite file private to this node. Only for single-node setups.
    Sqlite,
}

/// Cursor persistence configuration.
///
/// With [`StateStore::Redis`] a node that takes over leadership resumes
/// from the cursor the previous leader flushed. With [`StateStore::Sqlite`]
/// cursors and registrations stay in one local database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    #[serde(default = "default_state_store")]
    pub store: StateStore,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty cursors are flushed to the store.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_state_store() -> StateStore {
    StateStore::Redis
}

fn default_sqlite_path() -> String {
    "hub_cursors.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            store: default_state_store(),
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            store: StateStore::Sqlite,
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "50ms".to_string(),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
