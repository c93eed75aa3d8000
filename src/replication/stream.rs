// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull iterator over a remote channel's new content.
//!
//! # Architecture
//!
//! ```text
//!   remote hub ──ws──► listener task ──fetch_max(latest)──┐
//!                                                         │ notify_waiters
//!   replicator ──has_next()──► wait (Notify + timeout) ◄──┘
//!              ──next()─────► get_content(current), skipping gaps
//! ```
//!
//! The stream owns a single consumer position (`current`) and a shared
//! horizon (`latest`). Only the horizon and the exit flag cross tasks.
//!
//! # Termination
//!
//! The listener exits the stream when the notification transport ends for
//! any reason; the caller decides whether to open a new stream. Timeouts
//! and clean closes are logged at `info`, anything else at `warn`.

use crate::error::{HubError, Result};
use crate::metrics;
use crate::model::{Content, RemoteChannel};
use crate::replication::remote::{
    parse_notification, DisconnectKind, RemoteChannelClient, StreamEvent, Subscription,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct StreamShared {
    channel: String,
    latest: AtomicU64,
    position: AtomicU64,
    connected: AtomicBool,
    exit: CancellationToken,
    wake: Notify,
}

impl StreamShared {
    fn exit(&self) {
        if !self.exit.is_cancelled() {
            debug!(channel = %self.channel, "Stream exit");
        }
        self.connected.store(false, Ordering::SeqCst);
        self.exit.cancel();
        self.wake.notify_waiters();
    }

    fn delta(&self) -> u64 {
        self.latest
            .load(Ordering::SeqCst)
            .saturating_sub(self.position.load(Ordering::SeqCst))
    }

    fn publish_delta(&self) {
        metrics::set_replication_delta(&self.channel, self.delta());
    }
}

/// Observer/control handle for a stream owned by another task.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// Unblock the consumer and close the transport. Idempotent.
    pub fn exit(&self) {
        self.shared.exit();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Horizon minus position.
    pub fn delta(&self) -> u64 {
        self.shared.delta()
    }
}

/// Single-consumer iterator over content newer than a starting sequence.
pub struct RemoteSequenceStream {
    url: String,
    client: Arc<dyn RemoteChannelClient>,
    current: u64,
    wait_timeout: Duration,
    shared: Arc<StreamShared>,
    listener: Option<JoinHandle<()>>,
}

impl RemoteSequenceStream {
    /// Connect to `channel` and start listening for new sequences.
    ///
    /// Items after `start` are produced. Fails if the remote reports no
    /// latest sequence or the notification transport cannot be opened.
    pub async fn open(
        start: u64,
        channel: &RemoteChannel,
        client: Arc<dyn RemoteChannelClient>,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let subscription = client.subscribe(&channel.url).await?;
        let latest = client
            .get_latest_sequence(&channel.url)
            .await?
            .ok_or_else(|| HubError::remote(&channel.url, "no latest sequence"))?;

        let shared = Arc::new(StreamShared {
            channel: channel.name.clone(),
            latest: AtomicU64::new(latest),
            position: AtomicU64::new(start),
            connected: AtomicBool::new(true),
            exit: CancellationToken::new(),
            wake: Notify::new(),
        });
        shared.publish_delta();

        let listener = tokio::spawn(listen(subscription, Arc::clone(&shared)));
        info!(channel = %channel.name, start, latest, "Remote stream open");

        Ok(Self {
            url: channel.url.clone(),
            client,
            current: start,
            wait_timeout,
            shared,
            listener: Some(listener),
        })
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current consumer position.
    pub fn position(&self) -> u64 {
        self.current
    }

    pub fn latest(&self) -> u64 {
        self.shared.latest.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Wait until there is a position below the horizon and advance to it.
    ///
    /// Returns `false` once the stream has exited. The wait re-checks the
    /// horizon every `wait_timeout` in case a wake-up was missed.
    pub async fn has_next(&mut self) -> bool {
        loop {
            if self.shared.exit.is_cancelled() {
                return false;
            }

            let shared = Arc::clone(&self.shared);
            let notified = shared.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current < self.shared.latest.load(Ordering::SeqCst) {
                self.advance();
                return true;
            }

            tokio::select! {
                _ = self.shared.exit.cancelled() => return false,
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.wait_timeout) => {
                    debug!(channel = %self.shared.channel, current = self.current, "Stream wait timed out, re-checking");
                }
            }
        }
    }

    /// Content at the current position.
    ///
    /// Missing positions are logged and skipped up to the horizon. Returns
    /// `None` if the stream exited or nothing up to the horizon exists.
    pub async fn next(&mut self) -> Result<Option<Content>> {
        loop {
            if self.shared.exit.is_cancelled() {
                return Ok(None);
            }
            if let Some(content) = self.client.get_content(&self.url, self.current).await? {
                return Ok(Some(content));
            }

            warn!(channel = %self.shared.channel, sequence = self.current, "Remote content missing, skipping");
            metrics::record_missing_content(&self.shared.channel);
            if self.current >= self.shared.latest.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.advance();
        }
    }

    /// Stop the stream. Idempotent; unblocks a pending [`has_next`](Self::has_next).
    pub fn exit(&self) {
        self.shared.exit();
    }

    fn advance(&mut self) {
        self.current += 1;
        self.shared.position.store(self.current, Ordering::SeqCst);
        self.shared.publish_delta();
    }
}

impl Drop for RemoteSequenceStream {
    fn drop(&mut self) {
        self.shared.exit();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn listen(mut subscription: Subscription, shared: Arc<StreamShared>) {
    loop {
        let event = tokio::select! {
            _ = shared.exit.cancelled() => break,
            event = subscription.next_event() => event,
        };
        match event {
            Some(StreamEvent::Message(text)) => match parse_notification(&text) {
                Some(sequence) => {
                    let previous = shared.latest.fetch_max(sequence, Ordering::SeqCst);
                    if sequence > previous {
                        debug!(channel = %shared.channel, sequence, "Horizon advanced");
                        shared.publish_delta();
                        shared.wake.notify_waiters();
                    }
                }
                None => {
                    warn!(channel = %shared.channel, message = %text, "Unparseable notification");
                }
            },
            Some(StreamEvent::Closed(reason)) => {
                info!(channel = %shared.channel, reason = ?reason, "Remote closed notification stream");
                break;
            }
            Some(StreamEvent::Error { kind, message }) => {
                match kind {
                    DisconnectKind::Timeout | DisconnectKind::Eof => {
                        info!(channel = %shared.channel, kind = ?kind, error = %message, "Notification stream disconnected");
                    }
                    DisconnectKind::Other => {
                        warn!(channel = %shared.channel, error = %message, "Notification stream failed");
                        metrics::record_error("stream", "transport");
                    }
                }
                break;
            }
            None => {
                info!(channel = %shared.channel, "Notification stream ended");
                break;
            }
        }
    }
    subscription.close();
    shared.exit();
}
