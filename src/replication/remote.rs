//! Remote hub channel access.
//!
//! [`RemoteChannelClient`] is everything replication needs from a remote
//! hub: channel configuration, latest sequence, per-sequence existence and
//! creation time, content, and a push-notification subscription.
//!
//! # Wire Surface (HTTP implementation)
//!
//! ```text
//! GET  {url}              → 200 JSON {name, ttlMillis, type, tags}
//! GET  {url}/latest       → 3xx Location: {url}/{sequence}
//! HEAD {url}/{sequence}   → 200 Creation-Date: <RFC 3339>
//! GET  {url}/{sequence}   → 200 body (Content-Type, Creation-Date)
//! WS   ws(s)://…/{name}/ws → text frames ending in "/{sequence}"
//! ```
//!
//! 404 means absent (`Ok(None)`); anything else unexpected is an error.

use crate::error::{BoxFuture, HubError, Result};
use crate::model::{ChannelConfiguration, Content};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CREATION_DATE: &str = "Creation-Date";
const SUBSCRIPTION_BUFFER: usize = 256;

/// Why a notification transport stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Transport-level timeout.
    Timeout,
    /// Peer closed the connection without a clean close handshake.
    Eof,
    Other,
}

/// One event from a notification subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Raw notification text, expected to end in `/<sequence>`.
    Message(String),
    /// Clean close by the remote.
    Closed(Option<String>),
    Error { kind: DisconnectKind, message: String },
}

/// Live notification subscription. Dropping it disconnects.
pub struct Subscription {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read access to channels on a remote hub.
pub trait RemoteChannelClient: Send + Sync + 'static {
    fn get_configuration(&self, url: &str) -> BoxFuture<'_, Option<ChannelConfiguration>>;

    fn get_latest_sequence(&self, url: &str) -> BoxFuture<'_, Option<u64>>;

    /// Creation time of `sequence`, or `None` if it does not exist.
    fn get_creation_date(&self, url: &str, sequence: u64) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    fn get_content(&self, url: &str, sequence: u64) -> BoxFuture<'_, Option<Content>>;

    /// Open the push-notification transport for `url`.
    fn subscribe(&self, url: &str) -> BoxFuture<'_, Subscription>;
}

/// Sequence carried by a notification: the text after the last `/`.
pub fn parse_notification(message: &str) -> Option<u64> {
    let tail = message.trim().rsplit('/').next()?;
    tail.trim().parse().ok()
}

/// Notification endpoint of a channel URL.
pub fn ws_url_for(channel_url: &str) -> String {
    let base = channel_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", base)
}

/// Last path segment of a `Location` header as a sequence.
fn sequence_from_location(location: &str) -> Option<u64> {
    location.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

fn classify(err: &tungstenite::Error) -> DisconnectKind {
    use tungstenite::error::ProtocolError;
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            DisconnectKind::Eof
        }
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DisconnectKind::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => DisconnectKind::Eof,
            _ => DisconnectKind::Other,
        },
        _ => DisconnectKind::Other,
    }
}

/// [`RemoteChannelClient`] over HTTP (reqwest) and WebSocket (tokio-tungstenite).
#[derive(Clone)]
pub struct HttpRemoteChannelClient {
    http: reqwest::Client,
}

impl HttpRemoteChannelClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            // `latest` answers with a redirect we need to read, not follow
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HubError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn item_url(url: &str, sequence: u64) -> String {
        format!("{}/{}", url.trim_end_matches('/'), sequence)
    }

    fn creation_date(url: &str, headers: &reqwest::header::HeaderMap) -> Result<Option<DateTime<Utc>>> {
        match headers.get(CREATION_DATE) {
            None => Ok(None),
            Some(value) => {
                let text = value
                    .to_str()
                    .map_err(|_| HubError::remote(url, "non-ASCII Creation-Date"))?;
                let parsed = DateTime::parse_from_rfc3339(text)
                    .map_err(|e| HubError::remote(url, format!("bad Creation-Date '{}': {}", text, e)))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
        }
    }
}

impl RemoteChannelClient for HttpRemoteChannelClient {
    fn get_configuration(&self, url: &str) -> BoxFuture<'_, Option<ChannelConfiguration>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| HubError::remote(&url, e.to_string()))?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let config = response
                        .json::<ChannelConfiguration>()
                        .await
                        .map_err(|e| HubError::remote(&url, format!("bad configuration: {}", e)))?;
                    Ok(Some(config))
                }
                s => Err(HubError::remote(&url, format!("configuration status {}", s))),
            }
        })
    }

    fn get_latest_sequence(&self, url: &str) -> BoxFuture<'_, Option<u64>> {
        let url = url.to_string();
        Box::pin(async move {
            let latest_url = format!("{}/latest", url.trim_end_matches('/'));
            let response = self
                .http
                .get(&latest_url)
                .send()
                .await
                .map_err(|e| HubError::remote(&url, e.to_string()))?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_redirection() {
                return Err(HubError::remote(&url, format!("latest status {}", status)));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| HubError::remote(&url, "latest redirect without Location"))?;
            sequence_from_location(location)
                .map(Some)
                .ok_or_else(|| HubError::remote(&url, format!("unparseable latest '{}'", location)))
        })
    }

    fn get_creation_date(&self, url: &str, sequence: u64) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .http
                .head(Self::item_url(&url, sequence))
                .send()
                .await
                .map_err(|e| HubError::remote(&url, e.to_string()))?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => Self::creation_date(&url, response.headers())?
                    .map(Some)
                    .ok_or_else(|| HubError::remote(&url, format!("{} has no Creation-Date", sequence))),
                s => Err(HubError::remote(&url, format!("head {} status {}", sequence, s))),
            }
        })
    }

    fn get_content(&self, url: &str, sequence: u64) -> BoxFuture<'_, Option<Content>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .http
                .get(Self::item_url(&url, sequence))
                .send()
                .await
                .map_err(|e| HubError::remote(&url, e.to_string()))?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let created = Self::creation_date(&url, response.headers())?;
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| HubError::remote(&url, e.to_string()))?;
                    let mut content = Content::new(body.to_vec()).with_sequence(sequence);
                    content.content_type = content_type;
                    content.created = created;
                    Ok(Some(content))
                }
                s => Err(HubError::remote(&url, format!("get {} status {}", sequence, s))),
            }
        })
    }

    fn subscribe(&self, url: &str) -> BoxFuture<'_, Subscription> {
        let url = url.to_string();
        Box::pin(async move {
            let ws_url = ws_url_for(&url);
            let (socket, _) = tokio_tungstenite::connect_async(ws_url.as_str())
                .await
                .map_err(|e| HubError::remote(&url, format!("websocket {}: {}", ws_url, e)))?;
            debug!(url = %ws_url, "Notification socket open");

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let cancel = CancellationToken::new();
            let reader_cancel = cancel.clone();

            tokio::spawn(async move {
                let (mut sink, mut source) = socket.split();
                loop {
                    let frame = tokio::select! {
                        _ = reader_cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                        frame = source.next() => frame,
                    };
                    let event = match frame {
                        Some(Ok(Message::Text(text))) => StreamEvent::Message(text),
                        Some(Ok(Message::Binary(data))) => {
                            StreamEvent::Message(String::from_utf8_lossy(&data).into_owned())
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                        Some(Ok(Message::Close(frame))) => {
                            StreamEvent::Closed(frame.map(|f| f.reason.to_string()))
                        }
                        Some(Err(e)) => StreamEvent::Error {
                            kind: classify(&e),
                            message: e.to_string(),
                        },
                        None => StreamEvent::Error {
                            kind: DisconnectKind::Eof,
                            message: "socket ended".to_string(),
                        },
                    };
                    let terminal = !matches!(event, StreamEvent::Message(_));
                    if tx.send(event).await.is_err() || terminal {
                        break;
                    }
                }
            });

            Ok(Subscription::new(rx, cancel))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification() {
        assert_eq!(parse_notification("http://hub/channel/orders/1005"), Some(1005));
        assert_eq!(parse_notification("1005"), Some(1005));
        assert_eq!(parse_notification(" http://hub/channel/orders/7 \n"), Some(7));
        assert_eq!(parse_notification("http://hub/channel/orders/"), None);
        assert_eq!(parse_notification("http://hub/channel/orders/abc"), None);
        assert_eq!(parse_notification(""), None);
    }

    #[test]
    fn test_ws_url_for() {
        assert_eq!(ws_url_for("http://hub/channel/orders"), "ws://hub/channel/orders/ws");
        assert_eq!(ws_url_for("https://hub/channel/orders/"), "wss://hub/channel/orders/ws");
    }

    #[test]
    fn test_sequence_from_location() {
        assert_eq!(sequence_from_location("http://hub/channel/orders/1234"), Some(1234));
        assert_eq!(sequence_from_location("/channel/orders/1234/"), Some(1234));
        assert_eq!(sequence_from_location("http://hub/channel/orders"), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&tungstenite::Error::ConnectionClosed), DisconnectKind::Eof);
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify(&tungstenite::Error::Io(io)), DisconnectKind::Timeout);
        assert_eq!(classify(&tungstenite::Error::Utf8), DisconnectKind::Other);
    }

    #[tokio::test]
    async fn test_subscription_close_ends_events() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx, CancellationToken::new());
        tx.send(StreamEvent::Message("x/1".into())).await.unwrap();
        assert_eq!(sub.next_event().await, Some(StreamEvent::Message("x/1".into())));
        sub.close();
        assert_eq!(sub.next_event().await, None);
    }

    #[test]
    fn test_http_client_builds() {
        assert!(HttpRemoteChannelClient::new(Duration::from_secs(1)).is_ok());
    }
}
