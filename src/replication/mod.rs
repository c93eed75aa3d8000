// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel replication from remote hubs.
//!
//! A [`ChannelReplicator`] mirrors one remote sequence channel into a local
//! channel of the same name. Exactly one node in the cluster streams a
//! given channel at a time: the replicator competes for leadership on
//! `/ChannelReplicator/{name}` and only the leader streams.
//!
//! # State Machine
//!
//! ```text
//!   Idle ──try_leadership()──► Verifying ──ok──► AwaitingLeadership
//!    ▲                           │ fail                │ granted
//!    └───────────────────────────┘                     ▼
//!                                                 Initializing
//!                                                      │ mirror exists, resume point found
//!                                                      ▼
//!            Stopped ◄──exit()──  (any)          Streaming ──term ends──► AwaitingLeadership
//! ```
//!
//! # Resume Point
//!
//! The sequence cursor `replication/{name}` records the last sequence
//! written locally. A fresh replication searches from the start of the
//! channel within `historical_days`; a resumed one searches from the cursor
//! with one extra day so a cursor that drifted out of retention is caught.

pub mod finder;
pub mod policy;
pub mod remote;
pub mod service;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use finder::ResumePointFinder;
pub use policy::{GuardedChannels, ReplicationPolicyGuard};
pub use remote::{HttpRemoteChannelClient, RemoteChannelClient, StreamEvent, Subscription};
pub use service::ReplicationService;
pub use stream::{RemoteSequenceStream, StreamHandle};

use crate::config::{CoordinationConfig, ReplicationSettings};
use crate::content::{ChannelService, ContentStore};
use crate::content_key::ContentKey;
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, HubError, Result};
use crate::leadership::{CoordinationService, Leader, LeadershipCoordinator, LeadershipToken};
use crate::metrics;
use crate::model::{RemoteChannel, ReplicationStatus, START_SEQUENCE};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const DAY: Duration = Duration::from_secs(86_400);

/// Everything a replicator needs from the node it runs on.
#[derive(Clone)]
pub struct ReplicationContext {
    pub node_id: String,
    pub coordination: Arc<dyn CoordinationService>,
    pub coordination_config: CoordinationConfig,
    pub settings: ReplicationSettings,
    pub remote: Arc<dyn RemoteChannelClient>,
    pub content: Arc<dyn ContentStore>,
    pub channels: Arc<dyn ChannelService>,
    pub cursors: Arc<CursorStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Verifying,
    AwaitingLeadership,
    Initializing,
    Streaming,
    Stopped,
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Verifying => write!(f, "Verifying"),
            Self::AwaitingLeadership => write!(f, "AwaitingLeadership"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Cursor name holding the last replicated sequence of `channel`.
pub fn replication_cursor(channel: &str) -> String {
    format!("replication/{}", channel)
}

#[derive(Debug)]
struct Progress {
    state: ReplicatorState,
    valid: bool,
    message: String,
}

struct ReplicatorCore {
    url: String,
    name: String,
    historical_days: u32,
    ctx: ReplicationContext,
    finder: ResumePointFinder,
    progress: Mutex<Progress>,
    channel: Mutex<Option<RemoteChannel>>,
    stream: Mutex<Option<StreamHandle>>,
}

/// Mirrors one remote channel while holding leadership for it.
pub struct ChannelReplicator {
    core: Arc<ReplicatorCore>,
    coordinator: LeadershipCoordinator,
}

impl ChannelReplicator {
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        historical_days: u32,
        ctx: ReplicationContext,
    ) -> Self {
        let name = name.into();
        let coordinator = LeadershipCoordinator::new(
            format!("/ChannelReplicator/{}", name),
            &ctx.node_id,
            Arc::clone(&ctx.coordination),
            &ctx.coordination_config,
        );
        let finder = ResumePointFinder::new(Arc::clone(&ctx.remote));
        Self {
            core: Arc::new(ReplicatorCore {
                url: url.into(),
                name,
                historical_days,
                ctx,
                finder,
                progress: Mutex::new(Progress {
                    state: ReplicatorState::Idle,
                    valid: false,
                    message: String::new(),
                }),
                channel: Mutex::new(None),
                stream: Mutex::new(None),
            }),
            coordinator,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn url(&self) -> &str {
        &self.core.url
    }

    /// Days of history replicated when there is no cursor yet.
    pub fn historical_days(&self) -> u32 {
        self.core.historical_days
    }

    /// Verify the remote channel and, if usable, start competing for
    /// leadership. Returns `false` with a recorded message otherwise.
    pub async fn try_leadership(&self) -> bool {
        if !self.core.verify().await {
            return false;
        }
        self.core.set_state(ReplicatorState::AwaitingLeadership);
        if !self.coordinator.start(Arc::clone(&self.core) as Arc<dyn Leader>) {
            debug!(channel = %self.core.name, "Replicator already competing for leadership");
        }
        true
    }

    /// Stop streaming and leave the leadership queue.
    pub async fn exit(&self) {
        self.core.set_state(ReplicatorState::Stopped);
        if let Some(stream) = self.core.stream().as_ref() {
            stream.exit();
        }
        self.coordinator.close().await;
        *self.core.stream() = None;
        info!(channel = %self.core.name, "Replication stopped");
    }

    /// Stop and forget the replication position.
    pub async fn delete(&self) -> Result<()> {
        self.exit().await;
        self.core
            .ctx
            .cursors
            .delete(&replication_cursor(&self.core.name))
            .await
    }

    pub fn state(&self) -> ReplicatorState {
        self.core.progress().state
    }

    /// Whether the last verification succeeded.
    pub fn is_valid(&self) -> bool {
        self.core.progress().valid
    }

    /// Why the replication is not running, if it is not.
    pub fn message(&self) -> String {
        self.core.progress().message.clone()
    }

    /// Whether a stream's notification transport is live.
    pub fn is_connected(&self) -> bool {
        self.core
            .stream()
            .as_ref()
            .is_some_and(StreamHandle::is_connected)
    }

    pub fn has_leadership(&self) -> bool {
        self.coordinator.has_leadership()
    }

    pub fn status(&self) -> ReplicationStatus {
        let progress = self.core.progress();
        let stream = self.core.stream();
        ReplicationStatus {
            url: self.core.url.clone(),
            name: self.core.name.clone(),
            valid: progress.valid,
            message: progress.message.clone(),
            connected: stream.as_ref().is_some_and(StreamHandle::is_connected),
            delta: stream.as_ref().map(StreamHandle::delta).unwrap_or(0),
            state: progress.state.to_string(),
        }
    }
}

impl ReplicatorCore {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stream(&self) -> MutexGuard<'_, Option<StreamHandle>> {
        self.stream.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ReplicatorState) {
        let mut progress = self.progress();
        if progress.state != state {
            debug!(channel = %self.name, from = %progress.state, to = %state, "Replicator state");
            progress.state = state;
        }
    }

    /// Leave `Stopped` alone; an explicit exit wins over term bookkeeping.
    fn set_state_unless_stopped(&self, state: ReplicatorState) {
        let mut progress = self.progress();
        if progress.state != ReplicatorState::Stopped {
            progress.state = state;
        }
    }

    fn invalidate(&self, message: String) {
        warn!(channel = %self.name, reason = %message, "Replication not started");
        let mut progress = self.progress();
        progress.valid = false;
        progress.message = message;
        progress.state = ReplicatorState::Idle;
    }

    async fn verify(&self) -> bool {
        self.set_state(ReplicatorState::Verifying);
        let config = match self.ctx.remote.get_configuration(&self.url).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                self.invalidate(format!("remote channel missing for {}", self.url));
                return false;
            }
            Err(e) => {
                self.invalidate(format!("unable to reach {}: {}", self.url, e));
                return false;
            }
        };
        if !config.is_sequence() {
            self.invalidate(format!(
                "Non-Sequence channels are not currently supported {}",
                self.url
            ));
            return false;
        }

        let mut channel = RemoteChannel::new(&self.url, &self.name);
        channel.configuration = Some(config);
        *self.channel.lock().unwrap_or_else(|p| p.into_inner()) = Some(channel);

        let mut progress = self.progress();
        progress.valid = true;
        progress.message.clear();
        true
    }

    async fn lead(&self, token: &LeadershipToken) -> Result<()> {
        self.set_state_unless_stopped(ReplicatorState::Initializing);
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| HubError::InvalidState {
                expected: "verified remote channel".into(),
                actual: "unverified".into(),
            })?;

        self.ensure_local_channel(&channel).await?;
        let start = self.resume_point(&channel).await?;
        if !token.has_leadership() {
            return Ok(());
        }

        let mut stream = RemoteSequenceStream::open(
            start,
            &channel,
            Arc::clone(&self.ctx.remote),
            self.ctx.settings.stream_wait_timeout(),
        )
        .await?;
        *self.stream() = Some(stream.handle());
        self.set_state_unless_stopped(ReplicatorState::Streaming);

        let result = self.pump(&mut stream, token).await;
        stream.exit();
        result
    }

    async fn ensure_local_channel(&self, channel: &RemoteChannel) -> Result<()> {
        if self.ctx.channels.channel_exists(&self.name).await? {
            return Ok(());
        }
        let config = channel
            .configuration
            .as_ref()
            .map(|c| c.renamed(&self.name))
            .ok_or_else(|| HubError::Internal("verified channel without configuration".into()))?;
        self.ctx.channels.create_channel(config).await?;
        info!(channel = %self.name, "Created local mirror channel");
        Ok(())
    }

    async fn resume_point(&self, channel: &RemoteChannel) -> Result<u64> {
        let cursor = replication_cursor(&self.name);
        self.ctx.cursors.reload(&cursor).await?;
        let start = match self.ctx.cursors.get_sequence(&cursor).await {
            None => {
                self.finder
                    .search_for_last_updated(channel, START_SEQUENCE, DAY * self.historical_days)
                    .await?
            }
            Some(last) => {
                self.finder
                    .search_for_last_updated(channel, last, DAY * (self.historical_days + 1))
                    .await?
            }
        };
        info!(channel = %self.name, start, "Replication resume point");
        Ok(start)
    }

    async fn pump(&self, stream: &mut RemoteSequenceStream, token: &LeadershipToken) -> Result<()> {
        let cursor = replication_cursor(&self.name);
        loop {
            let more = tokio::select! {
                _ = token.revoked() => false,
                more = stream.has_next() => more,
            };
            if !more {
                return Ok(());
            }

            let Some(mut content) = stream.next().await? else {
                warn!(channel = %self.name, sequence = stream.position(), "No content at position, skipped");
                continue;
            };
            let sequence = content.sequence.unwrap_or_else(|| stream.position());
            content.sequence = Some(sequence);
            content.key = Some(ContentKey::for_sequence(
                content.created.unwrap_or_else(Utc::now),
                sequence,
            ));

            let key = self.ctx.content.write(&self.name, content).await?;
            self.ctx.cursors.update_sequence_if_greater(&cursor, sequence).await;
            metrics::record_replicated(&self.name);
            debug!(channel = %self.name, sequence, key = %key, "Replicated");
        }
    }
}

impl Leader for ReplicatorCore {
    fn take_leadership(self: Arc<Self>, token: LeadershipToken) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let result = self.lead(&token).await;
            *self.stream() = None;
            self.set_state_unless_stopped(ReplicatorState::AwaitingLeadership);
            if let Err(e) = &result {
                metrics::record_error("replication", "term");
                warn!(channel = %self.name, error = %e, "Replication term ended with error");
            }
            result
        })
    }
}
