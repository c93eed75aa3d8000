//! Scripted remote hub channel.
//!
//! Holds an explicit existence/age map of sequences and pushes
//! notifications to live subscribers the way a remote hub's WebSocket does.

use chrono::{DateTime, Utc};
use hub_replication::model::{ChannelConfiguration, Content};
use hub_replication::replication::{StreamEvent, Subscription};
use hub_replication::{BoxFuture, HubError, RemoteChannelClient};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Item {
    created: DateTime<Utc>,
    /// `false` when the position exists but its body cannot be fetched.
    fetchable: bool,
}

pub struct ScriptedRemote {
    url: String,
    config: Mutex<Option<ChannelConfiguration>>,
    items: Mutex<BTreeMap<u64, Item>>,
    subscribers: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    fetched: Mutex<Vec<u64>>,
    lookups: AtomicUsize,
    unreachable: AtomicBool,
}

impl ScriptedRemote {
    /// Empty sequence channel `name` at `url` with a 30 day ttl.
    pub fn new(url: &str, name: &str) -> Self {
        Self {
            url: url.to_string(),
            config: Mutex::new(Some(ChannelConfiguration::sequence(
                name,
                Duration::from_secs(30 * 86_400),
            ))),
            items: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_configuration(&self, config: Option<ChannelConfiguration>) {
        *self.config.lock().unwrap() = config;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Positions in `range` created `age` ago.
    pub fn insert_aged(&self, range: RangeInclusive<u64>, age: chrono::Duration) {
        let created = Utc::now() - age;
        let mut items = self.items.lock().unwrap();
        for sequence in range {
            items.insert(sequence, Item { created, fetchable: true });
        }
    }

    pub fn insert_fresh(&self, range: RangeInclusive<u64>) {
        self.insert_aged(range, chrono::Duration::zero());
    }

    /// Forget positions in `range` entirely.
    pub fn remove(&self, range: RangeInclusive<u64>) {
        let mut items = self.items.lock().unwrap();
        for sequence in range {
            items.remove(&sequence);
        }
    }

    /// The position answers `HEAD` but its body is gone.
    pub fn withhold(&self, sequence: u64) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&sequence) {
            item.fetchable = false;
        }
    }

    /// Append a fresh position and notify subscribers.
    pub async fn publish(&self, sequence: u64) {
        self.insert_fresh(sequence..=sequence);
        self.notify(sequence).await;
    }

    pub async fn notify(&self, sequence: u64) {
        self.send(StreamEvent::Message(format!("{}/{}", self.url, sequence)))
            .await;
    }

    /// Push arbitrary notification text.
    pub async fn notify_text(&self, text: &str) {
        self.send(StreamEvent::Message(text.to_string())).await;
    }

    /// Close every subscription as a remote restart would.
    pub async fn disconnect(&self) {
        self.send(StreamEvent::Closed(Some("going away".into()))).await;
        self.subscribers.lock().unwrap().clear();
    }

    async fn send(&self, event: StreamEvent) {
        let subs: Vec<_> = self.subscribers.lock().unwrap().clone();
        for sub in subs {
            let _ = sub.send(event.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !s.is_closed());
        subs.len()
    }

    /// Sequences whose content was requested, in request order.
    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn clear_fetched(&self) {
        self.fetched.lock().unwrap().clear();
    }

    /// Number of existence lookups (`HEAD`) served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> hub_replication::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(HubError::remote(&self.url, "connection refused"));
        }
        Ok(())
    }
}

impl RemoteChannelClient for ScriptedRemote {
    fn get_configuration(&self, _url: &str) -> BoxFuture<'_, Option<ChannelConfiguration>> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.config.lock().unwrap().clone())
        })
    }

    fn get_latest_sequence(&self, _url: &str) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.items.lock().unwrap().keys().next_back().copied())
        })
    }

    fn get_creation_date(&self, _url: &str, sequence: u64) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.lock().unwrap().get(&sequence).map(|i| i.created))
        })
    }

    fn get_content(&self, _url: &str, sequence: u64) -> BoxFuture<'_, Option<Content>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.fetched.lock().unwrap().push(sequence);
            let item = self.items.lock().unwrap().get(&sequence).cloned();
            Ok(item.filter(|i| i.fetchable).map(|i| {
                Content::new(format!("remote-{}", sequence))
                    .with_sequence(sequence)
                    .with_created(i.created)
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
