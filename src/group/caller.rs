// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Group webhook delivery engine.
//!
//! While leader of `/GroupLeader/{name}`, the engine pulls keys from the
//! group's source channel and POSTs one envelope per key to the callback:
//!
//! ```json
//! {"name": "<group>", "id": "<uuid>", "uris": ["<channelUrl>/<key url>"]}
//! ```
//!
//! # Dispatch
//!
//! ```text
//!   wait for room ──► queue.next() ──► bulkhead.acquire() ──► tracker.spawn(deliver)
//!   (window)                            (parallel_calls)          │ retry until 200 or leadership lost
//!        ▲                                                        │
//!        └──────────────────── loop while leader ◄────────────────┘ permit dropped on exit
//! ```
//!
//! Keys are dispatched in ascending order but complete in any order. The
//! progress cursor only advances to the highest key below which nothing is
//! still in flight, so a key that never succeeds pins the cursor and
//! everything after it is redelivered on the next term.
//!
//! At most `parallel_calls * UNCOMMITTED_PER_CALL` keys are dispatched past
//! the cursor at once. A pinned key therefore stalls dispatch instead of
//! growing the set of delivered but uncommitted keys.
//!
//! A new term reloads the cursor first, since the previous leader may have
//! been another node.

use crate::config::{CoordinationConfig, DeliveryConfig};
use crate::content::ContentStore;
use crate::content_key::ContentKey;
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, HubError, Result};
use crate::group::client::HttpDeliveryClient;
use crate::group::queue::{DeliveryQueue, PollingDeliveryQueue};
use crate::leadership::{CoordinationService, Leader, LeadershipCoordinator, LeadershipToken};
use crate::metrics;
use crate::model::Group;
use crate::registry::GroupSource;
use crate::resilience::Bulkhead;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything a delivery engine needs from the node it runs on.
#[derive(Clone)]
pub struct DeliveryContext {
    pub node_id: String,
    pub coordination: Arc<dyn CoordinationService>,
    pub coordination_config: CoordinationConfig,
    pub delivery: DeliveryConfig,
    pub groups: Arc<dyn GroupSource>,
    pub content: Arc<dyn ContentStore>,
    pub http: Arc<dyn HttpDeliveryClient>,
    pub cursors: Arc<CursorStore>,
}

/// Leadership path of a group.
pub fn leader_path(group: &str) -> String {
    format!("/GroupLeader/{}", group)
}

/// Webhook envelope for one key.
pub fn envelope(group: &Group, key: &ContentKey) -> serde_json::Value {
    serde_json::json!({
        "name": group.name,
        "id": uuid::Uuid::new_v4().to_string(),
        "uris": [format!("{}/{}", group.channel_url.trim_end_matches('/'), key.to_url())],
    })
}

/// Keys in flight or delivered but uncommitted, per parallel call.
const UNCOMMITTED_PER_CALL: usize = 8;

/// Contiguous-completion cursor advancement.
struct ProgressTracker {
    name: String,
    cursors: Arc<CursorStore>,
    /// Cursor generation when the term began; progress after a delete is dropped.
    generation: u64,
    window: usize,
    room: Notify,
    state: Mutex<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    in_flight: BTreeSet<ContentKey>,
    done: BTreeSet<ContentKey>,
}

impl ProgressTracker {
    fn new(name: &str, cursors: Arc<CursorStore>, generation: u64, window: usize) -> Self {
        Self {
            name: name.to_string(),
            cursors,
            generation,
            window: window.max(1),
            room: Notify::new(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn begin(&self, key: &ContentKey) {
        self.lock().in_flight.insert(key.clone());
    }

    /// Keys dispatched past the cursor.
    fn outstanding(&self) -> usize {
        let state = self.lock();
        state.in_flight.len() + state.done.len()
    }

    /// Delivered keys waiting for an earlier key before they can commit.
    fn uncommitted(&self) -> usize {
        self.lock().done.len()
    }

    /// Wait until another key may be dispatched. `false` if leadership ends first.
    async fn wait_for_room(&self, token: &LeadershipToken) -> bool {
        loop {
            if self.outstanding() < self.window {
                return true;
            }
            tokio::select! {
                _ = token.revoked() => return false,
                _ = self.room.notified() => {}
            }
        }
    }

    /// Mark `key` delivered and commit whatever became contiguous.
    async fn complete(&self, key: &ContentKey) {
        let commit = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            state.done.insert(key.clone());
            let floor = state.in_flight.first().cloned();
            let commit = match &floor {
                Some(floor) => state.done.range(..floor.clone()).next_back().cloned(),
                None => state.done.last().cloned(),
            };
            if let Some(commit) = &commit {
                state.done.retain(|k| k > commit);
            }
            commit
        };
        self.room.notify_one();

        if let Some(commit) = commit {
            if self
                .cursors
                .update_if_current(&commit, &self.name, self.generation)
                .await
            {
                debug!(group = %self.name, key = %commit, "Delivery cursor advanced");
            }
        }
    }

    /// Forget `key` without committing it (delivery abandoned).
    fn abandon(&self, key: &ContentKey) {
        let mut state = self.lock();
        // Keep it in flight: the cursor must not pass an undelivered key
        if !state.in_flight.contains(key) {
            state.in_flight.insert(key.clone());
        }
    }
}

struct EngineCore {
    name: String,
    ctx: DeliveryContext,
    bulkhead: Bulkhead,
    tracker: TaskTracker,
    /// Progress of the current term.
    progress: Mutex<Option<Arc<ProgressTracker>>>,
}

/// Delivers one group's content to its callback while holding leadership.
pub struct GroupDeliveryEngine {
    core: Arc<EngineCore>,
    coordinator: LeadershipCoordinator,
}

impl GroupDeliveryEngine {
    pub fn new(group: &Group, ctx: DeliveryContext) -> Self {
        let parallel = group.parallel_calls.max(1) as usize;
        let coordinator = LeadershipCoordinator::new(
            leader_path(&group.name),
            &ctx.node_id,
            Arc::clone(&ctx.coordination),
            &ctx.coordination_config,
        );
        Self {
            core: Arc::new(EngineCore {
                name: group.name.clone(),
                ctx,
                bulkhead: Bulkhead::new(parallel),
                tracker: TaskTracker::new(),
                progress: Mutex::new(None),
            }),
            coordinator,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Start competing for the group's leadership.
    ///
    /// Returns `false` once the engine has exited.
    pub fn try_leadership(&self) -> bool {
        if self.core.bulkhead.is_closed() {
            debug!(group = %self.core.name, "Group has exited, not starting");
            return false;
        }
        debug!(group = %self.core.name, "Starting group");
        self.coordinator.start(Arc::clone(&self.core) as Arc<dyn Leader>);
        true
    }

    pub fn has_leadership(&self) -> bool {
        self.coordinator.has_leadership()
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    /// Deliveries currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.core.bulkhead.in_flight()
    }

    /// Keys of the current term delivered but not yet committed to the cursor.
    pub fn uncommitted(&self) -> usize {
        self.core
            .progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(0, |progress| progress.uncommitted())
    }

    /// Last key whose delivery (and every key before it) completed.
    pub async fn last_completed(&self) -> ContentKey {
        self.core.ctx.cursors.get(&self.core.name, ContentKey::NONE).await
    }

    /// Stop delivering, give in-flight calls a grace period and optionally
    /// delete the group's progress.
    pub async fn exit(&self, delete: bool) {
        info!(group = %self.core.name, delete, "Exiting group");
        self.core.bulkhead.close();
        self.coordinator.close().await;
        self.core.tracker.close();

        let grace = self.core.ctx.delivery.shutdown_grace();
        if tokio::time::timeout(grace, self.core.tracker.wait()).await.is_err() {
            warn!(
                group = %self.core.name,
                in_flight = self.core.tracker.len(),
                "In-flight deliveries still running after grace period"
            );
        }

        if delete {
            if let Err(e) = self.core.ctx.cursors.delete(&self.core.name).await {
                warn!(group = %self.core.name, error = %e, "Failed to delete group progress");
            }
        }
    }

    /// Delete leadership state and progress if no node is competing for
    /// this group. Returns `true` if it was deleted.
    pub async fn delete_if_ready(&self) -> bool {
        if self.is_ready_to_delete().await {
            self.delete_anyway().await;
            return true;
        }
        false
    }

    /// Delete leadership state and progress unconditionally.
    pub async fn delete_anyway(&self) {
        delete_group_state(&self.core.ctx, &self.core.name).await;
    }

    async fn is_ready_to_delete(&self) -> bool {
        match self
            .core
            .ctx
            .coordination
            .participants(&leader_path(&self.core.name))
            .await
        {
            Ok(participants) => participants.is_empty(),
            Err(e) => {
                warn!(group = %self.core.name, error = %e, "Unable to read group participants");
                true
            }
        }
    }
}

/// Remove a group's leadership path and progress cursor.
pub(crate) async fn delete_group_state(ctx: &DeliveryContext, name: &str) {
    if let Err(e) = ctx.coordination.delete_path(&leader_path(name)).await {
        warn!(group = %name, error = %e, "Unable to delete leader path");
    }
    if let Err(e) = ctx.cursors.delete(name).await {
        warn!(group = %name, error = %e, "Unable to delete group progress");
    }
    info!(group = %name, "Deleted group state");
}

impl EngineCore {
    async fn lead(self: &Arc<Self>, token: &LeadershipToken) -> Result<()> {
        let Some(group) = self.ctx.groups.get_group(&self.name).await? else {
            info!(group = %self.name, "Group is missing, exiting");
            return Ok(());
        };
        let group = Arc::new(group);
        let channel = group
            .channel_name()
            .ok_or_else(|| HubError::InvalidRequest(format!("bad channelUrl {}", group.channel_url)))?
            .to_string();

        self.ctx.cursors.reload(&self.name).await?;
        let generation = self.ctx.cursors.generation(&self.name).await;
        let last_completed = self.ctx.cursors.get(&self.name, ContentKey::NONE).await;
        info!(group = %self.name, last_completed = %last_completed, "Group leadership taken");
        if !token.has_leadership() {
            return Ok(());
        }

        let mut queue: Box<dyn DeliveryQueue> = Box::new(PollingDeliveryQueue::start(
            Arc::clone(&self.ctx.content),
            channel,
            last_completed,
            self.ctx.delivery.poll_interval(),
            self.ctx.delivery.batch_size,
        ));
        let progress = Arc::new(ProgressTracker::new(
            &self.name,
            Arc::clone(&self.ctx.cursors),
            generation,
            self.bulkhead.max_concurrent() * UNCOMMITTED_PER_CALL,
        ));
        *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&progress));

        let result = self.dispatch_loop(&group, queue.as_mut(), &progress, token).await;
        queue.close();
        info!(group = %self.name, "Stopping group delivery");
        result
    }

    async fn dispatch_loop(
        self: &Arc<Self>,
        group: &Arc<Group>,
        queue: &mut dyn DeliveryQueue,
        progress: &Arc<ProgressTracker>,
        token: &LeadershipToken,
    ) -> Result<()> {
        while token.has_leadership() {
            if !progress.wait_for_room(token).await {
                break;
            }
            let key = tokio::select! {
                _ = token.revoked() => break,
                key = queue.next() => key?,
            };
            let Some(key) = key else { break };

            let permit = tokio::select! {
                _ = token.revoked() => break,
                permit = self.bulkhead.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            progress.begin(&key);
            let span = info_span!("deliver", group = %self.name, key = %key);
            self.tracker.spawn(
                Arc::clone(self)
                    .deliver(
                        Arc::clone(group),
                        key,
                        token.clone(),
                        Arc::clone(progress),
                        permit,
                    )
                    .instrument(span),
            );
        }
        Ok(())
    }

    async fn deliver(
        self: Arc<Self>,
        group: Arc<Group>,
        key: ContentKey,
        token: LeadershipToken,
        progress: Arc<ProgressTracker>,
        _permit: OwnedSemaphorePermit,
    ) {
        metrics::set_delivery_in_flight(&self.name, self.bulkhead.in_flight());
        let started = Instant::now();
        let body = envelope(&group, &key);

        if self.send_with_retry(&group, &body, &token).await {
            metrics::record_delivery_latency(&self.name, started.elapsed());
            progress.complete(&key).await;
            debug!("Delivered");
        } else {
            progress.abandon(&key);
            debug!("Delivery abandoned after leadership loss");
        }
    }

    /// POST until a 200 or until leadership is gone. Returns `true` on success.
    async fn send_with_retry(
        &self,
        group: &Group,
        body: &serde_json::Value,
        token: &LeadershipToken,
    ) -> bool {
        let retry = self.ctx.delivery.retry_config();
        let mut attempt = 0usize;
        loop {
            if !token.has_leadership() {
                debug!(callback = %group.callback_url, "Not leader, not calling");
                return false;
            }
            attempt += 1;
            metrics::record_delivery_attempt(&self.name);

            match self.ctx.http.post_json(&group.callback_url, body).await {
                Ok(200) => return true,
                Ok(status) => {
                    info!(callback = %group.callback_url, status, attempt, "Callback returned non-200");
                    metrics::record_delivery_failure(&self.name, &status.to_string());
                }
                Err(e) => {
                    info!(callback = %group.callback_url, error = %e, attempt, "Callback failed");
                    metrics::record_delivery_failure(&self.name, "transport");
                }
            }

            if !retry.allows_attempt(attempt) {
                return false;
            }
            let delay = retry.delay_for_attempt(attempt);
            tokio::select! {
                _ = token.revoked() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Leader for EngineCore {
    fn take_leadership(self: Arc<Self>, token: LeadershipToken) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let result = self.lead(&token).await;
            if let Err(e) = &result {
                metrics::record_error("group", "term");
                warn!(group = %self.name, error = %e, "Group term ended with error");
            }
            result
        })
    }
}
