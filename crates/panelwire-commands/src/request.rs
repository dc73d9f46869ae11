//! One command execution against the service.
//!
//! A [`Request`] sends the first call of a submission and, for pending or
//! asynchronous answers, keeps polling with follow-up calls until a terminal
//! answer arrives or the attempt budget runs out.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::{Arguments, CommandId, CommandRef, PollPolicy, RequestParameter};
use crate::config::ConnectionConfig;
use crate::error::RequestError;
use crate::response::{RESULT_ERROR, RESULT_OK, RESULT_WAIT, Response};
use crate::transport::{Transport, TransportReply};

/// Process-wide counter for log correlation.
static INDEX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Settings shared by every request of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    /// Base URL
    pub endpoint: String,
    /// Polling of pending answers
    pub policy: PollPolicy,
    /// Value of the `callby` parameter
    pub caller_id: String,
    /// Prefix of identification tokens
    pub identity_prefix: String,
    /// Wire code of the argument carrying the acting user
    pub user_parameter: String,
}

impl RequestSettings {
    /// Settings from a connection config and an effective poll policy.
    pub fn new(config: &ConnectionConfig, policy: PollPolicy) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            policy,
            caller_id: config.caller_id.clone(),
            identity_prefix: config.identity_prefix.clone(),
            user_parameter: config.user_parameter.clone(),
        }
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default(), PollPolicy::default())
    }
}

/// Handle used to interrupt a request from another task.
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: Arc<watch::Sender<u64>>,
}

impl Interrupter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Interrupt every listener created before this call.
    pub fn interrupt(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    fn listener(&self) -> InterruptListener {
        InterruptListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Interrupter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct InterruptListener {
    rx: watch::Receiver<u64>,
}

impl InterruptListener {
    /// Resolves once an interrupt is observed.
    async fn interrupted(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One logical command execution.
pub struct Request {
    command: CommandRef,
    transport: Arc<dyn Transport>,
    settings: Arc<RequestSettings>,
    interrupter: Interrupter,
    listener: InterruptListener,
    attempt: u32,
    index: u64,
    identification: Option<String>,
}

impl Request {
    /// Create a request for `command`.
    pub fn new(
        command: CommandRef,
        transport: Arc<dyn Transport>,
        settings: Arc<RequestSettings>,
    ) -> Self {
        let interrupter = Interrupter::new();
        let listener = interrupter.listener();
        Self {
            command,
            transport,
            settings,
            interrupter,
            listener,
            attempt: 0,
            index: 0,
            identification: None,
        }
    }

    pub fn command(&self) -> CommandRef {
        self.command
    }

    /// Identity used for coalescing.
    pub fn id(&self) -> CommandId {
        self.command.id()
    }

    /// Pending answers received so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Log correlation index, assigned on first send.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Identification token of the current submission.
    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    /// Handle that interrupts this request.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Interrupt a pending wait or transport call.
    pub fn cancel(&self) {
        self.interrupter.interrupt();
    }

    /// Full URL for a set of arguments.
    pub fn url_for(&self, arguments: &Arguments) -> String {
        format!("{}?{}", self.settings.endpoint, arguments.to_query())
    }

    fn identification_for(&self, arguments: &Arguments) -> String {
        format!(
            "{}{}{}",
            self.settings.identity_prefix,
            arguments
                .get_by_code(&self.settings.user_parameter)
                .unwrap_or_default(),
            Local::now().format("%Y%m%d%H%M%S%3f")
        )
    }

    /// Run the post cycle until a terminal answer.
    ///
    /// Asynchronous commands never return their first `OK`; the answer to
    /// the follow-up poll is returned instead.
    pub async fn post(&mut self, mut arguments: Arguments) -> Result<Response, RequestError> {
        let mut follow_up = false;

        loop {
            let code = if follow_up {
                arguments.set(&RequestParameter::Counter, self.attempt.to_string());
                arguments.remove(&RequestParameter::CallBy);
                self.command.follow_up_code()
            } else {
                self.index = INDEX_COUNTER.fetch_add(1, Ordering::Relaxed);
                self.identification = Some(self.identification_for(&arguments));
                arguments.set(&RequestParameter::CallBy, self.settings.caller_id.clone());
                self.command.code()
            };
            arguments.set(&RequestParameter::Request, code.clone());
            arguments.insert(&RequestParameter::Id, self.identification.clone());

            debug!(
                request = %code,
                index = self.index,
                attempt = self.attempt,
                "Posting request"
            );
            let url = self.url_for(&arguments);
            let reply = self.send(&url).await?;
            if reply.status != 200 {
                return Err(RequestError::HttpStatus(reply.status));
            }

            let response = Response::new(self.command, reply.body);
            let result = match response.result() {
                Ok(result) => result,
                Err(e) => {
                    warn!(request = %code, index = self.index, error = %e, "Unexpected response");
                    return Ok(response);
                }
            };
            let message = response.message().unwrap_or_default();

            match result.as_str() {
                RESULT_ERROR => {
                    warn!(request = %code, index = self.index, "{} - {}", result, message);
                    return Err(RequestError::ErrorResponse {
                        code: response.error().unwrap_or_default(),
                        message,
                    });
                }
                RESULT_OK => {
                    info!(request = %code, index = self.index, "{} - {}", result, message);
                    if !(self.command.is_async() && !follow_up) {
                        return Ok(response);
                    }
                }
                RESULT_WAIT => {
                    self.attempt += 1;
                    if self.attempt >= self.settings.policy.max_attempts {
                        return Err(RequestError::MaxAttempts(self.attempt));
                    }
                    debug!(request = %code, index = self.index, "{} - {}", result, message);
                }
                _ => {
                    warn!(request = %code, index = self.index, "{} - {}", result, message);
                    return Ok(response);
                }
            }

            follow_up = true;
            self.pause().await?;
        }
    }

    async fn send(&mut self, url: &str) -> Result<TransportReply, RequestError> {
        tokio::select! {
            biased;
            _ = self.listener.interrupted() => Err(RequestError::Interrupted),
            reply = self.transport.get(url) => Ok(reply?),
        }
    }

    async fn pause(&mut self) -> Result<(), RequestError> {
        let delay = self.settings.policy.delay_for_attempt(self.attempt);
        tokio::select! {
            biased;
            _ = self.listener.interrupted() => Err(RequestError::Interrupted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("attempt", &self.attempt)
            .field("index", &self.index)
            .field("identification", &self.identification)
            .finish()
    }
}
