//! Replication domain claims.
//!
//! A replication domain exclusively claims a set of channel names. While
//! claimed, a channel is written only by its replicator: local inserts and
//! deletes are forbidden, and no second domain may claim it.

use crate::content::{ChannelService, ContentStore};
use crate::content_key::ContentKey;
use crate::error::{HubError, Result};
use crate::model::{Content, ReplicationDomain};
use crate::registry::DomainSource;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Enforces exclusive channel claims of replication domains.
#[derive(Clone)]
pub struct ReplicationPolicyGuard {
    domains: Arc<dyn DomainSource>,
}

impl ReplicationPolicyGuard {
    pub fn new(domains: Arc<dyn DomainSource>) -> Self {
        Self { domains }
    }

    /// Domain currently claiming `channel`, if any.
    pub async fn replicating_domain(&self, channel: &str) -> Result<Option<String>> {
        Ok(self
            .domains
            .domains()
            .await?
            .into_iter()
            .find(|d| d.exclude_except.contains(channel))
            .map(|d| d.domain))
    }

    /// Reject local mutation of a channel claimed by a domain.
    pub async fn throw_exception_if_replicating(&self, channel: &str) -> Result<()> {
        if let Some(domain) = self.replicating_domain(channel).await? {
            warn!(channel = %channel, domain = %domain, "Rejected local mutation of replicated channel");
            return Err(HubError::Forbidden(format!(
                "{} cannot be modified while replicating",
                channel
            )));
        }
        Ok(())
    }

    /// Reject a domain without channels or claiming another domain's channel.
    ///
    /// The stored definition of the same domain is not a conflict, so a
    /// domain can be replaced with an overlapping channel set.
    pub async fn validate_domain(&self, domain: &ReplicationDomain) -> Result<()> {
        if !domain.is_valid() {
            return Err(HubError::InvalidRequest(
                "excludeExcept must be populated".into(),
            ));
        }

        for other in self.domains.domains().await? {
            if other.domain == domain.domain {
                continue;
            }
            let overlap: BTreeSet<&String> = other
                .exclude_except
                .intersection(&domain.exclude_except)
                .collect();
            if !overlap.is_empty() {
                return Err(HubError::Forbidden(format!(
                    "{} has channels already being replicated {:?}",
                    domain.domain, overlap
                )));
            }
        }
        Ok(())
    }
}

/// Local channel access with replication claims applied.
///
/// Replicators write through the unguarded store; everything else goes
/// through this wrapper.
#[derive(Clone)]
pub struct GuardedChannels {
    guard: ReplicationPolicyGuard,
    content: Arc<dyn ContentStore>,
    channels: Arc<dyn ChannelService>,
}

impl GuardedChannels {
    pub fn new(
        guard: ReplicationPolicyGuard,
        content: Arc<dyn ContentStore>,
        channels: Arc<dyn ChannelService>,
    ) -> Self {
        Self {
            guard,
            content,
            channels,
        }
    }

    /// Insert new content. Content that already has a key is passed through.
    pub async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey> {
        if content.key.is_none() {
            self.guard.throw_exception_if_replicating(channel).await?;
        }
        self.content.write(channel, content).await
    }

    /// Delete a channel. Returns `false` if it does not exist.
    pub async fn delete(&self, channel: &str) -> Result<bool> {
        if !self.channels.channel_exists(channel).await? {
            return Ok(false);
        }
        self.guard.throw_exception_if_replicating(channel).await?;
        self.channels.delete_channel(channel).await
    }
}
