//! Recording webhook client.

use hub_replication::{BoxFuture, HttpDeliveryClient};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One POST as the callback saw it.
#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub body: serde_json::Value,
    pub status: u16,
    pub at: Instant,
}

impl Call {
    /// The single content URI carried by the envelope.
    pub fn uri(&self) -> &str {
        self.body["uris"][0].as_str().unwrap_or_default()
    }
}

/// [`HttpDeliveryClient`] that records every call and tracks concurrency.
///
/// URIs ending in a failing suffix answer 500 until healed.
pub struct RecordingClient {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    latency: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingClient {
    pub fn new(latency: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            latency,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn fail(&self, uri_suffix: &str) {
        self.failing.lock().unwrap().insert(uri_suffix.to_string());
    }

    pub fn heal(&self, uri_suffix: &str) {
        self.failing.lock().unwrap().remove(uri_suffix);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// URIs answered with 200, in completion order.
    pub fn delivered(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.status == 200)
            .map(|c| c.uri().to_string())
            .collect()
    }

    /// Times at which `uri` was attempted.
    pub fn attempts(&self, uri: &str) -> Vec<Instant> {
        self.calls()
            .iter()
            .filter(|c| c.uri() == uri)
            .map(|c| c.at)
            .collect()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn status_for(&self, uri: &str) -> u16 {
        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|suffix| uri.ends_with(suffix.as_str())) {
            500
        } else {
            200
        }
    }
}

impl HttpDeliveryClient for RecordingClient {
    fn post_json(&self, url: &str, body: &serde_json::Value) -> BoxFuture<'_, u16> {
        let url = url.to_string();
        let body = body.clone();
        Box::pin(async move {
            let at = Instant::now();
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let uri = body["uris"][0].as_str().unwrap_or_default().to_string();
            let status = self.status_for(&uri);
            self.calls.lock().unwrap().push(Call {
                url,
                body,
                status,
                at,
            });
            Ok(status)
        })
    }
}
