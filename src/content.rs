//! Local content storage traits.
//!
//! The physical storage engines live outside this crate. The core reaches
//! them through two narrow traits:
//!
//! - [`ContentStore`]: write/read records, find the newest key, list keys
//! - [`ChannelService`]: create/delete local channels
//!
//! [`MemoryContentStore`] implements both for single-node use and tests.
//!
//! Absence is reported as `Ok(None)` / empty results so callers can tell a
//! missing record from a failing backend.

use crate::content_key::ContentKey;
use crate::error::{BoxFuture, HubError};
use crate::model::{ChannelConfiguration, Content};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};

/// Record storage addressed by [`ContentKey`].
pub trait ContentStore: Send + Sync + 'static {
    /// Store `content` in `channel` and return its key.
    ///
    /// Content that already carries a key keeps it; otherwise one is
    /// generated from `created` (or now).
    fn write(&self, channel: &str, content: Content) -> BoxFuture<'_, ContentKey>;

    fn read(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<Content>>;

    /// Newest key in `channel`, if any.
    fn find_last_key(&self, channel: &str) -> BoxFuture<'_, Option<ContentKey>>;

    /// Up to `count` keys strictly after `key`, ascending.
    fn query_keys_since(
        &self,
        channel: &str,
        key: &ContentKey,
        count: usize,
    ) -> BoxFuture<'_, Vec<ContentKey>>;
}

/// Channel lifecycle.
pub trait ChannelService: Send + Sync + 'static {
    fn channel_exists(&self, name: &str) -> BoxFuture<'_, bool>;

    fn create_channel(&self, config: ChannelConfiguration) -> BoxFuture<'_, ChannelConfiguration>;

    fn get_configuration(&self, name: &str) -> BoxFuture<'_, Option<ChannelConfiguration>>;

    /// Delete a channel and its content. Returns `false` if it did not exist.
    fn delete_channel(&self, name: &str) -> BoxFuture<'_, bool>;
}

#[derive(Debug, Default)]
struct ChannelData {
    config: Option<ChannelConfiguration>,
    items: BTreeMap<ContentKey, Content>,
    by_sequence: HashMap<u64, ContentKey>,
}

/// In-memory [`ContentStore`] + [`ChannelService`].
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    channels: DashMap<String, ChannelData>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `channel`.
    pub fn len(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|c| c.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    /// Sequences stored in `channel`, ascending.
    pub fn sequences(&self, channel: &str) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .channels
            .get(channel)
            .map(|c| c.by_sequence.keys().copied().collect())
            .unwrap_or_default();
        seqs.sort_unstable();
        seqs
    }
}

impl ContentStore for MemoryContentStore {
    fn write(&self, channel: &str, mut content: Content) -> BoxFuture<'_, ContentKey> {
        let channel = channel.to_string();
        Box::pin(async move {
            let mut data = self
                .channels
                .get_mut(&channel)
                .ok_or_else(|| HubError::NotFound(format!("channel {}", channel)))?;

            let key = match content.key.clone() {
                Some(key) => key,
                None => ContentKey::generate(content.created.unwrap_or_else(Utc::now)),
            };
            content.key = Some(key.clone());
            if let Some(seq) = content.sequence {
                data.by_sequence.insert(seq, key.clone());
            }
            data.items.insert(key.clone(), content);
            Ok(key)
        })
    }

    fn read(&self, channel: &str, key: &ContentKey) -> BoxFuture<'_, Option<Content>> {
        let found = self
            .channels
            .get(channel)
            .and_then(|c| c.items.get(key).cloned());
        Box::pin(async move { Ok(found) })
    }

    fn find_last_key(&self, channel: &str) -> BoxFuture<'_, Option<ContentKey>> {
        let last = self
            .channels
            .get(channel)
            .and_then(|c| c.items.keys().next_back().cloned());
        Box::pin(async move { Ok(last) })
    }

    fn query_keys_since(
        &self,
        channel: &str,
        key: &ContentKey,
        count: usize,
    ) -> BoxFuture<'_, Vec<ContentKey>> {
        use std::ops::Bound::{Excluded, Unbounded};

        let keys = self
            .channels
            .get(channel)
            .map(|c| {
                c.items
                    .range((Excluded(key.clone()), Unbounded))
                    .take(count)
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(keys) })
    }
}

impl ChannelService for MemoryContentStore {
    fn channel_exists(&self, name: &str) -> BoxFuture<'_, bool> {
        let exists = self.channels.contains_key(name);
        Box::pin(async move { Ok(exists) })
    }

    fn create_channel(&self, config: ChannelConfiguration) -> BoxFuture<'_, ChannelConfiguration> {
        Box::pin(async move {
            let mut entry = self.channels.entry(config.name.clone()).or_default();
            entry.config = Some(config.clone());
            Ok(config)
        })
    }

    fn get_configuration(&self, name: &str) -> BoxFuture<'_, Option<ChannelConfiguration>> {
        let config = self.channels.get(name).and_then(|c| c.config.clone());
        Box::pin(async move { Ok(config) })
    }

    fn delete_channel(&self, name: &str) -> BoxFuture<'_, bool> {
        let removed = self.channels.remove(name).is_some();
        Box::pin(async move { Ok(removed) })
    }
}
