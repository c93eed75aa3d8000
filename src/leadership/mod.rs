// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leadership coordination.
//!
//! A [`LeadershipCoordinator`] competes for exclusive leadership of one
//! path on a shared [`CoordinationService`]. When it wins, it hands a live
//! [`LeadershipToken`] to a [`Leader`] running in its own task. The term
//! ends when the leader returns or the token is revoked; either way the
//! coordinator releases the lease and re-queues for the next term.
//!
//! # Term Lifecycle
//!
//! ```text
//!           start()
//!              │
//!              ▼
//!   ┌──► wait for Connected session
//!   │          │
//!   │    register participant, try_acquire(path)
//!   │          │ granted
//!   │          ▼
//!   │    spawn leader(token) ◄── watcher: renew every renew_interval;
//!   │          │                  revoke on renew failure, Suspended, Lost
//!   │          │ leader returns (voluntarily or after revocation)
//!   │          ▼
//!   │    release lease
//!   └── sleep requeue_delay
//! ```
//!
//! # Cancellation
//!
//! Revocation is cooperative. The leader observes it through
//! [`LeadershipToken::has_leadership`] at loop boundaries or by awaiting
//! [`LeadershipToken::revoked`]. Nothing is aborted; in-flight work simply
//! is not continued.
//!
//! A leader that panics is contained by its task: the panic is logged and
//! the coordinator re-queues as if the term ended normally.

pub mod coordination;
pub mod redis_backend;

pub use coordination::{ConnectionState, CoordinationService, InMemoryCoordination};
pub use redis_backend::RedisCoordination;

use crate::config::CoordinationConfig;
use crate::error::BoxFuture;
use crate::metrics;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Live "still leader" signal for one leadership term.
#[derive(Debug, Clone, Default)]
pub struct LeadershipToken {
    cancel: CancellationToken,
}

impl LeadershipToken {
    /// A token that is live until [`revoke`](Self::revoke)d.
    pub fn new() -> Self {
        Self::default()
    }

    fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
        }
    }

    pub fn has_leadership(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once leadership is gone.
    pub async fn revoked(&self) {
        self.cancel.cancelled().await
    }

    pub fn revoke(&self) {
        self.cancel.cancel();
    }

    /// Cancellation token tied to this term, for handing to sub-tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Work performed while holding leadership.
pub trait Leader: Send + Sync + 'static {
    /// Run one leadership term.
    ///
    /// Return to relinquish leadership. Must stop promptly once `token` is
    /// revoked.
    fn take_leadership(self: Arc<Self>, token: LeadershipToken) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy)]
struct LeaseTiming {
    ttl: Duration,
    renew_interval: Duration,
    requeue_delay: Duration,
    participant_ttl: Duration,
}

struct Running {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    path: String,
    owner: String,
    coordination: Arc<dyn CoordinationService>,
    timing: LeaseTiming,
    current: Mutex<Option<LeadershipToken>>,
}

impl Shared {
    fn current(&self) -> MutexGuard<'_, Option<LeadershipToken>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Competes for leadership of one path, re-queueing after every term.
pub struct LeadershipCoordinator {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl LeadershipCoordinator {
    pub fn new(
        path: impl Into<String>,
        node_id: &str,
        coordination: Arc<dyn CoordinationService>,
        config: &CoordinationConfig,
    ) -> Self {
        let owner = format!("{}:{}", node_id, uuid::Uuid::new_v4().simple());
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                owner,
                coordination,
                timing: LeaseTiming {
                    ttl: config.lease_ttl(),
                    renew_interval: config.renew_interval(),
                    requeue_delay: config.requeue_delay(),
                    participant_ttl: config.session_timeout().max(config.lease_ttl()),
                },
                current: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Unique participant id of this coordinator.
    pub fn participant_id(&self) -> &str {
        &self.shared.owner
    }

    /// Begin competing for leadership. Returns immediately.
    ///
    /// Returns `false` if this coordinator is already running.
    pub fn start(&self, leader: Arc<dyn Leader>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(running.as_ref(), Some(r) if !r.handle.is_finished()) {
            return false;
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(
            compete(Arc::clone(&self.shared), leader, stop.clone())
                .instrument(info_span!("leadership", path = %self.shared.path)),
        );
        *running = Some(Running { stop, handle });
        true
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        matches!(running.as_ref(), Some(r) if !r.handle.is_finished())
    }

    /// Whether a term is currently live.
    pub fn has_leadership(&self) -> bool {
        self.shared
            .current()
            .as_ref()
            .is_some_and(LeadershipToken::has_leadership)
    }

    /// Stop competing, revoke the current term and release the lease.
    ///
    /// Waits for the current leader to unwind.
    pub async fn close(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(Running { stop, handle }) = running {
            stop.cancel();
            if let Err(e) = handle.await {
                error!(path = %self.shared.path, error = %e, "Leadership task failed");
            }
            debug!(path = %self.shared.path, "Leadership coordinator closed");
        }
    }
}

impl Drop for LeadershipCoordinator {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(r) = running.take() {
                r.stop.cancel();
            }
        }
    }
}

/// Sleep for `delay` unless `stop` fires first. Returns `false` if stopped.
async fn pause(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn compete(shared: Arc<Shared>, leader: Arc<dyn Leader>, stop: CancellationToken) {
    let coordination = Arc::clone(&shared.coordination);
    let mut state_rx = coordination.connection_state();

    loop {
        if stop.is_cancelled() {
            break;
        }

        let state = *state_rx.borrow_and_update();
        if state != ConnectionState::Connected {
            debug!(state = %state, "Waiting for coordination session");
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        if let Err(e) = coordination
            .register_participant(&shared.path, &shared.owner, shared.timing.participant_ttl)
            .await
        {
            warn!(error = %e, "Failed to register leadership participant");
        }

        match coordination
            .try_acquire(&shared.path, &shared.owner, shared.timing.ttl)
            .await
        {
            Ok(true) => {
                run_term(&shared, &leader, &stop, state_rx.clone()).await;
                if !pause(&stop, shared.timing.requeue_delay).await {
                    break;
                }
            }
            Ok(false) => {
                if !pause(&stop, shared.timing.renew_interval).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Leadership attempt failed, re-queueing");
                if !pause(&stop, shared.timing.requeue_delay).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = coordination
        .unregister_participant(&shared.path, &shared.owner)
        .await
    {
        debug!(error = %e, "Failed to unregister leadership participant");
    }
}

async fn run_term(
    shared: &Arc<Shared>,
    leader: &Arc<dyn Leader>,
    stop: &CancellationToken,
    state_rx: watch::Receiver<ConnectionState>,
) {
    let token = LeadershipToken::child_of(stop);
    *shared.current() = Some(token.clone());
    info!(path = %shared.path, "Leadership granted");
    metrics::record_leadership(&shared.path, true);

    let watcher = tokio::spawn(watch_lease(Arc::clone(shared), token.clone(), state_rx));
    let term = tokio::spawn(
        Arc::clone(leader)
            .take_leadership(token.clone())
            .instrument(info_span!("leader", path = %shared.path)),
    );

    match term.await {
        Ok(Ok(())) => debug!(path = %shared.path, "Leader returned"),
        Ok(Err(e)) => warn!(path = %shared.path, error = %e, "Leader returned an error"),
        Err(e) if e.is_panic() => error!(path = %shared.path, "Leader panicked"),
        Err(e) => warn!(path = %shared.path, error = %e, "Leader task cancelled"),
    }

    token.revoke();
    if let Err(e) = watcher.await {
        warn!(error = %e, "Lease watcher failed");
    }
    *shared.current() = None;

    if let Err(e) = shared.coordination.release(&shared.path, &shared.owner).await {
        warn!(path = %shared.path, error = %e, "Failed to release lease");
    }
    info!(path = %shared.path, "Leadership relinquished");
    metrics::record_leadership(&shared.path, false);
}

/// Renew the lease while the term is live; revoke on any doubt.
async fn watch_lease(
    shared: Arc<Shared>,
    token: LeadershipToken,
    mut state_rx: watch::Receiver<ConnectionState>,
) {
    let timing = shared.timing;
    let start = tokio::time::Instant::now() + timing.renew_interval;
    let mut ticker = tokio::time::interval_at(start, timing.renew_interval);

    loop {
        tokio::select! {
            _ = token.revoked() => break,
            changed = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                if changed.is_err() || state != ConnectionState::Connected {
                    warn!(path = %shared.path, state = %state, "Coordination session degraded, revoking leadership");
                    token.revoke();
                    break;
                }
            }
            _ = ticker.tick() => {
                match shared.coordination.renew(&shared.path, &shared.owner, timing.ttl).await {
                    Ok(true) => {
                        let _ = shared
                            .coordination
                            .register_participant(&shared.path, &shared.owner, timing.participant_ttl)
                            .await;
                    }
                    Ok(false) => {
                        warn!(path = %shared.path, "Lease lost, revoking leadership");
                        token.revoke();
                        break;
                    }
                    Err(e) => {
                        warn!(path = %shared.path, error = %e, "Lease renewal failed, revoking leadership");
                        token.revoke();
                        break;
                    }
                }
            }
        }
    }
}
