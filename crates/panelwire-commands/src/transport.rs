//! Transports carrying requests to the service.
//!
//! The engine only needs a GET that returns a status code and a textual
//! body. [`HttpTransport`] does that over HTTP; [`ScriptedTransport`]
//! replays canned replies without touching the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Invalid transport configuration: {0}")]
    Configuration(String),
}

/// Status and body of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReply {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

impl TransportReply {
    /// A `200` reply with the given body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

/// Carries a fully built request URL to the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for `url`.
    async fn get(&self, url: &str) -> Result<TransportReply, TransportError>;
}

/// Transport statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Requests handed to the transport
    pub requests_sent: u64,
    /// Requests that produced no reply
    pub requests_failed: u64,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// User agent announced to the service
    pub user_agent: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: "Verisure/5 CFNetwork/1206 Darwin/20.1.0".to_string(),
            timeout_secs: 30,
        }
    }
}

/// HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: Client,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(config: &HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Get transport statistics.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.sent.load(Ordering::Relaxed),
            requests_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<TransportReply, TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);

        let response = self.client.get(url).send().await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            TransportError::Body(e.to_string())
        })?;

        Ok(TransportReply { status, body })
    }
}

/// Transport that replays queued replies in order and records every URL.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<TransportReply>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Create an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply.
    pub fn push_reply(&self, reply: TransportReply) {
        self.replies.lock().push_back(reply);
    }

    /// Queue a `200` reply with the given body.
    pub fn push_body(&self, body: impl Into<String>) {
        self.push_reply(TransportReply::ok(body));
    }

    /// URLs requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of requests issued so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<TransportReply, TransportError> {
        self.requests.lock().push(url.to_string());
        let reply = self.replies.lock().pop_front();
        debug!(url, replied = reply.is_some(), "Scripted exchange");
        reply.ok_or_else(|| TransportError::Connection("script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_default() {
        let config = HttpTransportConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.user_agent.starts_with("Verisure/"));
    }

    #[test]
    fn test_http_transport_builds() {
        let transport = HttpTransport::new(&HttpTransportConfig::default()).unwrap();
        assert_eq!(transport.stats().requests_sent, 0);
    }

    #[tokio::test]
    async fn test_scripted_replays_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_body("first");
        transport.push_reply(TransportReply {
            status: 503,
            body: String::new(),
        });

        assert_eq!(transport.get("a").await.unwrap().body, "first");
        assert_eq!(transport.get("b").await.unwrap().status, 503);
        assert!(matches!(
            transport.get("c").await,
            Err(TransportError::Connection(_))
        ));
        assert_eq!(transport.requests(), vec!["a", "b", "c"]);
        assert_eq!(transport.pending_replies(), 0);
    }
}
