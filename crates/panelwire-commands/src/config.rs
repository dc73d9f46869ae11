//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{Backoff, PollPolicy};
use crate::transport::HttpTransportConfig;

/// Default service endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://mob2217.securitasdirect.es:12010/WebService/ws.do";

/// Caller identity sent with the first request of a submission.
pub const DEFAULT_CALLER_ID: &str = "IPH_61";

/// Prefix of generated identification tokens.
pub const DEFAULT_IDENTITY_PREFIX: &str = "IPH_______________";

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL every request is sent to
    pub endpoint: String,
    /// Seconds between polls of a pending command
    pub interval: u64,
    /// Maximum pending answers before giving up
    pub attempts: u32,
    /// Seconds between queue worker ticks
    pub queue_poll_rate: u64,
    /// Maximum number of queued requests
    pub queue_capacity: usize,
    /// Growth of the poll interval
    pub backoff: Backoff,
    /// Value of the `callby` parameter
    pub caller_id: String,
    /// Prefix of identification tokens
    pub identity_prefix: String,
    /// Wire code of the argument carrying the acting user
    pub user_parameter: String,
    /// HTTP transport settings
    pub transport: HttpTransportConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            interval: 3,
            attempts: 10,
            queue_poll_rate: 2,
            queue_capacity: 100,
            backoff: Backoff::Fixed,
            caller_id: DEFAULT_CALLER_ID.to_string(),
            identity_prefix: DEFAULT_IDENTITY_PREFIX.to_string(),
            user_parameter: "user".to_string(),
            transport: HttpTransportConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Poll policy, keeping `current` values where the config holds zero.
    pub fn poll_policy(&self, current: &PollPolicy) -> PollPolicy {
        PollPolicy {
            interval: if self.interval > 0 {
                Duration::from_secs(self.interval)
            } else {
                current.interval
            },
            max_attempts: if self.attempts > 0 {
                self.attempts
            } else {
                current.max_attempts
            },
            backoff: self.backoff.clone(),
        }
    }

    /// Period of the queue worker, never zero.
    pub fn queue_period(&self) -> Duration {
        Duration::from_secs(self.queue_poll_rate.max(1))
    }
}
