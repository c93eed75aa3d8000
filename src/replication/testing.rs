//! Scripted [`RemoteChannelClient`] for unit tests.

use crate::error::{BoxFuture, HubError};
use crate::model::{ChannelConfiguration, Content, KeyScheme};
use crate::replication::remote::{RemoteChannelClient, StreamEvent, Subscription};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Remote channel whose positions are described as ranges with a creation
/// time. Later ranges override earlier ones.
pub(crate) struct FakeRemote {
    url: String,
    config: Mutex<Option<ChannelConfiguration>>,
    spans: Mutex<Vec<(RangeInclusive<u64>, DateTime<Utc>)>>,
    no_content: Mutex<BTreeSet<u64>>,
    subscribers: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    head_calls: AtomicUsize,
    unreachable: AtomicBool,
}

impl FakeRemote {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            config: Mutex::new(Some(ChannelConfiguration::sequence(
                "orders",
                Duration::from_secs(86_400 * 30),
            ))),
            spans: Mutex::new(Vec::new()),
            no_content: Mutex::new(BTreeSet::new()),
            subscribers: Mutex::new(Vec::new()),
            head_calls: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_configuration(&self, config: Option<ChannelConfiguration>) {
        *self.config.lock().unwrap() = config;
    }

    pub(crate) fn set_key_scheme(&self, scheme: KeyScheme) {
        if let Some(config) = self.config.lock().unwrap().as_mut() {
            config.key_scheme = scheme;
        }
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn fill_fresh(&self, range: RangeInclusive<u64>) {
        self.spans.lock().unwrap().push((range, Utc::now()));
    }

    pub(crate) fn fill_stale(&self, range: RangeInclusive<u64>) {
        self.fill_aged(range, chrono::Duration::days(365));
    }

    pub(crate) fn fill_aged(&self, range: RangeInclusive<u64>, age: chrono::Duration) {
        self.spans.lock().unwrap().push((range, Utc::now() - age));
    }

    /// Position exists for `HEAD` but its content cannot be fetched.
    pub(crate) fn drop_content(&self, sequence: u64) {
        self.no_content.lock().unwrap().insert(sequence);
    }

    pub(crate) fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !s.is_closed());
        subs.len()
    }

    /// Push a "new sequence" notification to every subscriber.
    pub(crate) async fn notify(&self, sequence: u64) {
        self.send(StreamEvent::Message(format!("{}/{}", self.url, sequence)))
            .await;
    }

    pub(crate) async fn send(&self, event: StreamEvent) {
        let subs: Vec<_> = self.subscribers.lock().unwrap().clone();
        for sub in subs {
            let _ = sub.send(event.clone()).await;
        }
    }

    fn created(&self, sequence: u64) -> Option<DateTime<Utc>> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(range, _)| range.contains(&sequence))
            .map(|(_, created)| *created)
    }

    fn check_reachable(&self) -> crate::error::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(HubError::remote(&self.url, "connection refused"));
        }
        Ok(())
    }
}

impl RemoteChannelClient for FakeRemote {
    fn get_configuration(&self, _url: &str) -> BoxFuture<'_, Option<ChannelConfiguration>> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.config.lock().unwrap().clone())
        })
    }

    fn get_latest_sequence(&self, _url: &str) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self
                .spans
                .lock()
                .unwrap()
                .iter()
                .map(|(range, _)| *range.end())
                .max())
        })
    }

    fn get_creation_date(&self, _url: &str, sequence: u64) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.created(sequence))
        })
    }

    fn get_content(&self, _url: &str, sequence: u64) -> BoxFuture<'_, Option<Content>> {
        Box::pin(async move {
            self.check_reachable()?;
            if self.no_content.lock().unwrap().contains(&sequence) {
                return Ok(None);
            }
            Ok(self.created(sequence).map(|created| {
                Content::new(format!("item-{}", sequence))
                    .with_sequence(sequence)
                    .with_created(created)
            }))
        })
    }

    fn subscribe(&self, _url: &str) -> BoxFuture<'_, Subscription> {
        Box::pin(async move {
            self.check_reachable()?;
            let (tx, rx) = mpsc::channel(64);
            self.subscribers.lock().unwrap().push(tx);
            Ok(Subscription::new(rx, CancellationToken::new()))
        })
    }
}
