//! Resume-point search over a remote, TTL-bounded sequence space.
//!
//! A restart must not replay content the remote has already purged (it
//! would be reported as gaps) nor skip content written while this node was
//! down. The finder binary-searches `[last_known, latest]` for the oldest
//! position that still exists and was created inside the retention window,
//! and returns the position just before it.
//!
//! Each lookup is one `HEAD` against the remote, so the search costs
//! `O(log N)` round trips.

use crate::error::Result;
use crate::metrics;
use crate::model::{RemoteChannel, START_SEQUENCE};
use crate::replication::remote::RemoteChannelClient;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Computes where a replication should resume.
#[derive(Clone)]
pub struct ResumePointFinder {
    client: Arc<dyn RemoteChannelClient>,
}

impl ResumePointFinder {
    pub fn new(client: Arc<dyn RemoteChannelClient>) -> Self {
        Self { client }
    }

    /// Sequence to resume after.
    ///
    /// The replay starts at `result + 1`, the oldest position that exists
    /// and is newer than `now - min(retention, channel ttl)`. Returns
    /// [`START_SEQUENCE`] when the remote has no latest sequence.
    pub async fn search_for_last_updated(
        &self,
        channel: &RemoteChannel,
        last_updated: u64,
        retention: Duration,
    ) -> Result<u64> {
        let started = Instant::now();
        let Some(latest) = self.client.get_latest_sequence(&channel.url).await? else {
            info!(channel = %channel.name, "Remote has no latest sequence, starting from the beginning");
            return Ok(START_SEQUENCE);
        };

        let window = match &channel.configuration {
            Some(config) if config.ttl_millis > 0 => retention.min(config.ttl()),
            _ => retention,
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut low = last_updated;
        let mut high = latest;
        let mut best = latest;
        let mut lookups = 0u32;

        while low <= high {
            let mid = low + (high - low) / 2;
            lookups += 1;
            let fresh = matches!(
                self.client.get_creation_date(&channel.url, mid).await?,
                Some(created) if created > cutoff
            );
            if fresh {
                best = mid;
                if mid == 0 {
                    break;
                }
                high = mid - 1;
            } else {
                match mid.checked_add(1) {
                    Some(next) => low = next,
                    None => break,
                }
            }
        }

        metrics::record_resume_search(&channel.name, lookups, started.elapsed());
        let resume = best.saturating_sub(1);
        debug!(
            channel = %channel.name,
            last_updated,
            latest,
            resume,
            lookups,
            "Resume point found"
        );
        Ok(resume)
    }
}
