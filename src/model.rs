// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain types shared by replication and delivery.

use crate::content_key::ContentKey;
use crate::error::{HubError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Sequence value that precedes the first item of a sequence channel.
///
/// The first real item of a sequence channel is `START_SEQUENCE + 1`.
pub const START_SEQUENCE: u64 = 999;

/// Longest accepted group name.
const MAX_NAME_LEN: usize = 48;

/// How keys are assigned in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyScheme {
    /// Dense, monotonically increasing integers starting after [`START_SEQUENCE`].
    Sequence,
    /// Timestamp keys with a random disambiguator.
    #[serde(alias = "TIME")]
    TimeSeries,
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => write!(f, "SEQUENCE"),
            Self::TimeSeries => write!(f, "TIME_SERIES"),
        }
    }
}

/// Configuration of a channel, as served by the remote hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfiguration {
    pub name: String,
    /// Retention in milliseconds. Content older than this may be purged.
    pub ttl_millis: u64,
    #[serde(rename = "type")]
    pub key_scheme: KeyScheme,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ChannelConfiguration {
    pub fn sequence(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl_millis: ttl.as_millis() as u64,
            key_scheme: KeyScheme::Sequence,
            tags: BTreeSet::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }

    pub fn is_sequence(&self) -> bool {
        self.key_scheme == KeyScheme::Sequence
    }

    /// Copy of this configuration under a different local name.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

/// One immutable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    /// Assigned by the store on write when absent.
    pub key: Option<ContentKey>,
    /// Position in a sequence channel.
    pub sequence: Option<u64>,
    pub content_type: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub data: Vec<u8>,
}

impl Content {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            sequence: None,
            content_type: None,
            created: None,
            data: data.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }
}

/// Reference to a remote hub channel for one replication attempt.
///
/// The configuration is fetched lazily during verification and cached for
/// the attempt only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChannel {
    pub url: String,
    /// Name of the local mirror channel.
    pub name: String,
    pub configuration: Option<ChannelConfiguration>,
}

impl RemoteChannel {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            configuration: None,
        }
    }
}

/// A webhook registration.
///
/// Groups are immutable once stored: re-registering an equal group is a
/// no-op, a different one is a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub callback_url: String,
    pub channel_url: String,
    #[serde(default)]
    pub parallel_calls: u32,
    #[serde(default)]
    pub transactional: bool,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        callback_url: impl Into<String>,
        channel_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            callback_url: callback_url.into(),
            channel_url: channel_url.into(),
            parallel_calls: 0,
            transactional: false,
        }
    }

    pub fn with_parallel_calls(mut self, parallel_calls: u32) -> Self {
        self.parallel_calls = parallel_calls;
        self
    }

    /// Fill unset fields. `parallel_calls == 0` means unset.
    pub fn with_defaults(mut self, default_parallel_calls: u32) -> Self {
        if self.parallel_calls == 0 {
            self.parallel_calls = default_parallel_calls.max(1);
        }
        self
    }

    /// Reject registrations that can never be delivered.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self.name.len() > MAX_NAME_LEN
            || !self.name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(HubError::InvalidRequest(format!(
                "group name '{}' must be 1-{} characters of a-z, A-Z, 0-9 or _",
                self.name, MAX_NAME_LEN
            )));
        }
        if !is_http_url(&self.callback_url) {
            return Err(HubError::InvalidRequest(format!(
                "callbackUrl '{}' must be an absolute http(s) URL",
                self.callback_url
            )));
        }
        if !is_http_url(&self.channel_url) || channel_name_from_url(&self.channel_url).is_none() {
            return Err(HubError::InvalidRequest(format!(
                "channelUrl '{}' must be an absolute http(s) channel URL",
                self.channel_url
            )));
        }
        if self.parallel_calls == 0 {
            return Err(HubError::InvalidRequest("parallelCalls must be at least 1".into()));
        }
        Ok(())
    }

    /// Local channel this group consumes.
    pub fn channel_name(&self) -> Option<&str> {
        channel_name_from_url(&self.channel_url)
    }
}

/// Delivery progress of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub group: Group,
    pub last_completed: ContentKey,
    pub channel_latest: Option<ContentKey>,
}

/// An exclusive claim by one remote hub over a set of channel names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDomain {
    /// Host of the remote hub.
    pub domain: String,
    /// Channels this domain replicates. Must be non-empty.
    #[serde(default)]
    pub exclude_except: BTreeSet<String>,
    /// Retention window used when a channel has never been replicated.
    #[serde(default = "default_historical_days")]
    pub historical_days: u32,
}

fn default_historical_days() -> u32 {
    1
}

impl ReplicationDomain {
    pub fn new<I, S>(domain: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain: domain.into(),
            exclude_except: channels.into_iter().map(Into::into).collect(),
            historical_days: default_historical_days(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.domain.trim().is_empty() && !self.exclude_except.is_empty()
    }
}

/// Observable state of one channel replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub url: String,
    pub name: String,
    pub valid: bool,
    pub message: String,
    pub connected: bool,
    /// Horizon minus position of the live stream, 0 when not streaming.
    pub delta: u64,
    pub state: String,
}

/// `true` for absolute `http://` or `https://` URLs with a host.
pub fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(r) if !r.is_empty() && !r.starts_with('/'))
}

/// Channel name of a channel URL: its last non-empty path segment.
pub fn channel_name_from_url(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let (_, path) = rest.split_once('/')?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}
