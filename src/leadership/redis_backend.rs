//! Redis-backed coordination service.
//!
//! # Keys
//!
//! ```text
//! {prefix}lease:{path}         STRING  owner id, PX = lease ttl
//! {prefix}participants:{path}  ZSET    participant → expiry (epoch ms)
//! ```
//!
//! Cursors and registrations share the connection and prefix; their keys
//! are listed in [`crate::redis_state`].
//!
//! Leases are taken with `SET NX PX` and renewed/released through Lua
//! scripts that compare the stored owner first, so a node can never extend
//! or delete a lease it lost to someone else.
//!
//! # Session Health
//!
//! A background task pings Redis every `ping_interval`:
//!
//! ```text
//! Connected ──ping fails──► Suspended ──no success for session_timeout──► Lost
//!     ▲                          │                                         │
//!     └────────ping succeeds─────┴─────────────────────────────────────────┘
//! ```

use crate::config::CoordinationConfig;
use crate::error::{BoxFuture, HubError, Result};
use crate::leadership::coordination::{ConnectionState, CoordinationService};
use crate::metrics;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// [`CoordinationService`] over a shared Redis.
pub struct RedisCoordination {
    conn: ConnectionManager,
    key_prefix: String,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl RedisCoordination {
    /// Connect with retry, then start the session health task.
    pub async fn connect(config: &CoordinationConfig, retry: &RetryConfig) -> Result<Arc<Self>> {
        info!(url = %config.redis_url, "Connecting to coordination backend");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| HubError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0;
        let conn = loop {
            attempt += 1;
            match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to coordination backend after retry");
                    } else {
                        info!("Connected to coordination backend");
                    }
                    break conn;
                }
                Ok(Err(e)) if attempt >= retry.max_attempts => {
                    error!(attempt, error = %e, "Failed to connect after max retries");
                    return Err(HubError::coordination("connect", e));
                }
                Err(_) if attempt >= retry.max_attempts => {
                    error!(
                        attempt,
                        timeout_ms = retry.connection_timeout.as_millis() as u64,
                        "Connection timed out after max retries"
                    );
                    return Err(HubError::coordination_msg(
                        "connect",
                        format!("timed out after {} attempts", attempt),
                    ));
                }
                outcome => {
                    let delay = retry.delay_for_attempt(attempt);
                    match outcome {
                        Ok(Err(e)) => warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Connection attempt failed, retrying"
                        ),
                        _ => warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Connection attempt timed out, retrying"
                        ),
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        metrics::set_coordination_state("Connected");

        let this = Arc::new(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            state_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&this).health_loop(
            config.ping_interval(),
            config.session_timeout(),
        ));

        Ok(this)
    }

    /// Stop the health task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handle on the coordination connection, for stores sharing it.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn lease_key(&self, path: &str) -> String {
        format!("{}lease:{}", self.key_prefix, path)
    }

    fn participants_key(&self, path: &str) -> String {
        format!("{}participants:{}", self.key_prefix, path)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| HubError::coordination("PING", e))?;
        if reply != "PONG" {
            return Err(HubError::coordination_msg(
                "PING",
                format!("unexpected reply {}", reply),
            ));
        }
        Ok(())
    }

    async fn health_loop(self: Arc<Self>, ping_interval: Duration, session_timeout: Duration) {
        let mut last_ok = Instant::now();
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let healthy = matches!(timeout(ping_interval, self.ping()).await, Ok(Ok(())));
            let next = if healthy {
                last_ok = Instant::now();
                ConnectionState::Connected
            } else if last_ok.elapsed() >= session_timeout {
                ConnectionState::Lost
            } else {
                ConnectionState::Suspended
            };

            let previous = *self.state_tx.borrow();
            if previous != next {
                // Lost only clears once the backend answers again
                if previous == ConnectionState::Lost && next == ConnectionState::Suspended {
                    continue;
                }
                warn!(from = %previous, to = %next, "Coordination session state changed");
                metrics::set_coordination_state(&next.to_string());
                self.state_tx.send_replace(next);
            }
        }
    }
}

impl CoordinationService for RedisCoordination {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn try_acquire(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let key = self.lease_key(path);
        let owner = owner.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("SET NX", e))?;
            if reply.is_some() {
                return Ok(true);
            }
            // Holder re-acquiring its own lease
            let renewed: i64 = Script::new(RENEW_SCRIPT)
                .key(&key)
                .arg(&owner)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("renew", e))?;
            Ok(renewed == 1)
        })
    }

    fn renew(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let key = self.lease_key(path);
        let owner = owner.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let renewed: i64 = Script::new(RENEW_SCRIPT)
                .key(&key)
                .arg(&owner)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("renew", e))?;
            Ok(renewed == 1)
        })
    }

    fn release(&self, path: &str, owner: &str) -> BoxFuture<'_, ()> {
        let key = self.lease_key(path);
        let owner = owner.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(&owner)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("release", e))?;
            Ok(())
        })
    }

    fn register_participant(
        &self,
        path: &str,
        participant: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, ()> {
        let key = self.participants_key(path);
        let participant = participant.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let expires = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
            let _: i64 = redis::cmd("ZADD")
                .arg(&key)
                .arg(expires)
                .arg(&participant)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("ZADD", e))?;
            Ok(())
        })
    }

    fn unregister_participant(&self, path: &str, participant: &str) -> BoxFuture<'_, ()> {
        let key = self.participants_key(path);
        let participant = participant.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("ZREM")
                .arg(&key)
                .arg(&participant)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("ZREM", e))?;
            Ok(())
        })
    }

    fn participants(&self, path: &str) -> BoxFuture<'_, Vec<String>> {
        let key = self.participants_key(path);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let now = chrono::Utc::now().timestamp_millis();
            // Prune contenders whose registration was never refreshed
            let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(now)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("ZREMRANGEBYSCORE", e))?;
            let members: Vec<String> = redis::cmd("ZRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("ZRANGE", e))?;
            Ok(members)
        })
    }

    fn delete_path(&self, path: &str) -> BoxFuture<'_, ()> {
        let lease = self.lease_key(path);
        let participants = self.participants_key(path);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("DEL")
                .arg(&lease)
                .arg(&participants)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("DEL", e))?;
            Ok(())
        })
    }
}
