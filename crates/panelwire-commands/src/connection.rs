//! Connection to the service: request queue and dispatch.
//!
//! A [`Connection`] owns a FIFO of scheduled requests that a periodic worker
//! drains one at a time, and a processing lock shared with direct
//! [`Connection::post`] calls so that at most one cycle talks to the service
//! at any moment. A subscriber that posts from inside a cycle of the same
//! connection reuses the lock instead of waiting on it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command::{Arguments, CommandRef, PollPolicy};
use crate::config::ConnectionConfig;
use crate::error::RequestError;
use crate::queue::{QueueError, QueueStats, RequestQueue, ScheduleOutcome};
use crate::request::{Request, RequestSettings};
use crate::requester::{Requester, RequesterRegistry, Subscription};
use crate::response::Response;
use crate::transport::{HttpTransport, Transport, TransportError};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Connection whose processing lock the current task holds.
    static ACTIVE_CONNECTION: u64;
}

/// Queue and dispatcher for one service endpoint.
pub struct Connection {
    id: u64,
    transport: Arc<dyn Transport>,
    settings: RwLock<Arc<RequestSettings>>,
    queue: RequestQueue,
    registry: RequesterRegistry,
    processing: tokio::sync::Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a closed connection over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: &ConnectionConfig) -> Arc<Self> {
        let policy = config.poll_policy(&PollPolicy::default());
        Arc::new(Self {
            id: CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            transport,
            settings: RwLock::new(Arc::new(RequestSettings::new(config, policy))),
            queue: RequestQueue::new(config.queue_capacity),
            registry: RequesterRegistry::new(),
            processing: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        })
    }

    /// Create a closed connection over HTTP.
    pub fn http(config: &ConnectionConfig) -> Result<Arc<Self>, TransportError> {
        let transport = HttpTransport::new(&config.transport)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Apply `config` and start the queue worker if it is not running.
    pub fn open(self: &Arc<Self>, config: &ConnectionConfig) {
        let policy = {
            let mut settings = self.settings.write();
            let policy = config.poll_policy(&settings.policy);
            *settings = Arc::new(RequestSettings::new(config, policy.clone()));
            policy
        };

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(connection = self.id, "Connection already open");
            return;
        }

        let period = config.queue_period();
        let weak = Arc::downgrade(self);
        *worker = Some(tokio::spawn(run_worker(weak, period)));

        info!(
            connection = self.id,
            interval = ?policy.interval,
            attempts = policy.max_attempts,
            queue_period = ?period,
            "Connection opened"
        );
    }

    /// Stop the queue worker. Queued requests stay queued.
    pub fn close(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            info!(connection = self.id, "Connection closed");
        }
    }

    /// Whether the queue worker is running.
    pub fn is_open(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Queue `command` for the worker.
    pub fn schedule(&self, command: CommandRef) -> Result<ScheduleOutcome, QueueError> {
        let outcome = self.queue.push(self.request(command))?;
        match outcome {
            ScheduleOutcome::Queued => debug!(command = command.name(), "Request queued"),
            ScheduleOutcome::Coalesced => {
                debug!(command = command.name(), "Request already pending, coalesced")
            }
        }
        Ok(outcome)
    }

    /// Process `command` now, bypassing the queue.
    pub async fn post(&self, command: CommandRef) -> Result<Response, RequestError> {
        let mut request = self.request(command);

        let reentrant = ACTIVE_CONNECTION
            .try_with(|active| *active == self.id)
            .unwrap_or(false);
        if reentrant {
            debug!(command = command.name(), "Posting from inside a processing cycle");
            let _running = self.queue.begin(&request);
            return self.process_request(&mut request).await;
        }

        let _lock = self.processing.lock().await;
        let _running = self.queue.begin(&request);
        ACTIVE_CONNECTION
            .scope(self.id, self.process_request(&mut request))
            .await
    }

    /// Interrupt running requests and drop queued ones.
    ///
    /// Returns the number of dropped queued requests.
    pub fn cancel(&self) -> usize {
        let interrupted = self.queue.interrupt_running();
        let dropped = self.queue.clear();
        info!(connection = self.id, interrupted, dropped, "Requests cancelled");
        dropped
    }

    /// Process the head of the queue, if any.
    async fn process_next(&self) {
        let _lock = self.processing.lock().await;
        let Some((mut request, _running)) = self.queue.begin_next() else {
            return;
        };
        let command = request.command();

        // Failures are logged by process_request. Panics end only this cycle.
        let cycle = ACTIVE_CONNECTION.scope(self.id, self.process_request(&mut request));
        if AssertUnwindSafe(cycle).catch_unwind().await.is_err() {
            error!(
                connection = self.id,
                command = command.name(),
                "Request cycle panicked"
            );
            self.queue.record(false);
        }
    }

    /// Run one full cycle for `request`.
    ///
    /// Providers contribute arguments, receivers may veto, the request is
    /// posted, and on a terminal response every receiver is notified.
    async fn process_request(&self, request: &mut Request) -> Result<Response, RequestError> {
        let command = request.command();
        let id = command.id();

        let mut arguments = Arguments::new();
        for provider in self.registry.providers_for(id) {
            arguments.merge(provider.arguments_for_request(command).await);
        }

        let receivers = self.registry.receivers_for(id);
        for receiver in &receivers {
            if let Err(e) = receiver.will_post_request(command, &arguments).await {
                warn!(command = command.name(), error = %e, "Request vetoed");
                self.queue.record(false);
                return Err(e.into());
            }
        }

        let response = match request.post(arguments).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    command = command.name(),
                    index = request.index(),
                    error = %e,
                    "Request failed"
                );
                self.queue.record(false);
                return Err(e);
            }
        };
        self.queue.record(true);

        for receiver in &receivers {
            let notified = AssertUnwindSafe(receiver.request_complete(&response))
                .catch_unwind()
                .await;
            if notified.is_err() {
                error!(command = command.name(), "Response receiver panicked");
            }
        }

        Ok(response)
    }

    fn request(&self, command: CommandRef) -> Request {
        let settings = self.settings.read().clone();
        Request::new(command, self.transport.clone(), settings)
    }

    pub fn register_argument_provider(
        &self,
        provider: Arc<dyn Requester>,
        subscription: &Subscription,
    ) {
        self.registry.register_argument_provider(provider, subscription);
    }

    pub fn unregister_argument_provider(&self, provider: &Arc<dyn Requester>) {
        self.registry.unregister_argument_provider(provider);
    }

    pub fn register_response_receiver(
        &self,
        receiver: Arc<dyn Requester>,
        subscription: &Subscription,
    ) {
        self.registry.register_response_receiver(receiver, subscription);
    }

    pub fn unregister_response_receiver(&self, receiver: &Arc<dyn Requester>) {
        self.registry.unregister_response_receiver(receiver);
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Effective poll policy.
    pub fn policy(&self) -> PollPolicy {
        self.settings.read().policy.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_worker(connection: Weak<Connection>, period: std::time::Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.process_next().await;
    }
}
