//! Delivery queue: the ordered feed of keys a group still has to deliver.

use crate::content::ContentStore;
use crate::content_key::ContentKey;
use crate::error::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pull source of keys to deliver, ascending.
pub trait DeliveryQueue: Send + 'static {
    /// Next key. Blocks until one is available; `None` once closed.
    fn next(&mut self) -> BoxFuture<'_, Option<ContentKey>>;

    /// Stop producing keys. Idempotent.
    fn close(&mut self);
}

/// [`DeliveryQueue`] that polls a local channel with `query_keys_since`.
///
/// A background task keeps up to `batch_size` keys buffered ahead of the
/// consumer.
pub struct PollingDeliveryQueue {
    keys: mpsc::Receiver<ContentKey>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl PollingDeliveryQueue {
    /// Start feeding keys of `channel` strictly after `from`.
    pub fn start(
        store: Arc<dyn ContentStore>,
        channel: impl Into<String>,
        from: ContentKey,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let (tx, keys) = mpsc::channel(batch_size);
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(poll(
            store,
            channel.into(),
            from,
            poll_interval,
            batch_size,
            tx,
            cancel.clone(),
        ));
        Self {
            keys,
            cancel,
            poller: Some(poller),
        }
    }
}

impl DeliveryQueue for PollingDeliveryQueue {
    fn next(&mut self) -> BoxFuture<'_, Option<ContentKey>> {
        Box::pin(async move {
            tokio::select! {
                _ = self.cancel.cancelled() => Ok(None),
                key = self.keys.recv() => Ok(key),
            }
        })
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.keys.close();
    }
}

impl Drop for PollingDeliveryQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

async fn poll(
    store: Arc<dyn ContentStore>,
    channel: String,
    mut last: ContentKey,
    poll_interval: Duration,
    batch_size: usize,
    tx: mpsc::Sender<ContentKey>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Drain full batches without waiting for the next tick
        loop {
            let keys = match store.query_keys_since(&channel, &last, batch_size).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Delivery queue poll failed");
                    break;
                }
            };
            let full = keys.len() >= batch_size;
            for key in keys {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(key.clone()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                last = key;
            }
            if !full {
                break;
            }
        }
    }
    debug!(channel = %channel, "Delivery queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ChannelService, MemoryContentStore};
    use crate::model::{ChannelConfiguration, Content};

    async fn store_with_keys(count: i64) -> (Arc<MemoryContentStore>, Vec<ContentKey>) {
        let store = Arc::new(MemoryContentStore::new());
        store
            .create_channel(ChannelConfiguration::sequence("orders", Duration::from_secs(60)))
            .await
            .unwrap();
        let mut keys = Vec::new();
        for i in 1..=count {
            let mut content = Content::new("x");
            content.key = ContentKey::new(i * 1000, "k");
            keys.push(store.write("orders", content).await.unwrap());
        }
        (store, keys)
    }

    #[tokio::test]
    async fn test_delivers_keys_after_start_in_order() {
        let (store, keys) = store_with_keys(5).await;
        let mut queue = PollingDeliveryQueue::start(
            store,
            "orders",
            keys[1].clone(),
            Duration::from_millis(10),
            2,
        );
        for expected in &keys[2..] {
            assert_eq!(queue.next().await.unwrap().as_ref(), Some(expected));
        }
        queue.close();
        assert_eq!(queue.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_picks_up_new_content() {
        let (store, keys) = store_with_keys(1).await;
        let mut queue = PollingDeliveryQueue::start(
            Arc::clone(&store) as Arc<dyn ContentStore>,
            "orders",
            ContentKey::NONE,
            Duration::from_millis(10),
            10,
        );
        assert_eq!(queue.next().await.unwrap(), Some(keys[0].clone()));

        let mut content = Content::new("later");
        content.key = ContentKey::new(9_000, "k");
        let later = store.write("orders", content).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, Some(later));
    }

    #[tokio::test]
    async fn test_missing_channel_yields_nothing() {
        let store = Arc::new(MemoryContentStore::new());
        let mut queue = PollingDeliveryQueue::start(
            store,
            "nothing",
            ContentKey::NONE,
            Duration::from_millis(10),
            10,
        );
        let next = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(next.is_err(), "queue should still be waiting");
    }
}
