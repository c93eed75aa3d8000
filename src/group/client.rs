//! Webhook HTTP client.

use crate::error::{BoxFuture, HubError};
use std::time::Duration;

/// POSTs JSON to arbitrary URLs. Must be callable from many tasks at once.
pub trait HttpDeliveryClient: Send + Sync + 'static {
    /// POST `body` to `url` and return the response status code.
    ///
    /// Transport failures are errors; any status, including 5xx, is `Ok`.
    fn post_json(&self, url: &str, body: &serde_json::Value) -> BoxFuture<'_, u16>;
}

/// [`HttpDeliveryClient`] backed by a shared `reqwest` connection pool.
#[derive(Clone)]
pub struct ReqwestDeliveryClient {
    http: reqwest::Client,
}

impl ReqwestDeliveryClient {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

impl HttpDeliveryClient for ReqwestDeliveryClient {
    fn post_json(&self, url: &str, body: &serde_json::Value) -> BoxFuture<'_, u16> {
        let request = self.http.post(url).json(body);
        let url = url.to_string();
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| HubError::delivery(&url, e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}
