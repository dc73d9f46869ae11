//! Request queue of a connection.
//!
//! A FIFO of pending requests plus the set of requests currently being
//! processed. Requests for a command that is already queued or running are
//! coalesced into the existing one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::command::CommandId;
use crate::request::{Interrupter, Request};

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests waiting in the queue
    pub queued: usize,
    /// Requests being processed
    pub running: usize,
    /// Requests that reached a terminal response
    pub processed_count: u64,
    /// Requests that failed
    pub failed_count: u64,
    /// Requests dropped because an equal one was pending
    pub coalesced_count: u64,
}

/// Outcome of scheduling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Appended to the tail of the queue.
    Queued,
    /// Dropped in favour of an equal queued or running request.
    Coalesced,
}

/// Queue error types.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full")]
    Full,
}

struct Running {
    token: u64,
    command: CommandId,
    interrupter: Interrupter,
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<Request>,
    running: Vec<Running>,
    next_token: u64,
}

impl QueueInner {
    fn mark_running(&mut self, request: &Request) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.running.push(Running {
            token,
            command: request.id(),
            interrupter: request.interrupter(),
        });
        token
    }
}

/// FIFO request queue with coalescing.
pub struct RequestQueue {
    inner: Arc<Mutex<QueueInner>>,
    capacity: usize,
    processed: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            capacity,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Append a request unless an equal one is queued or running.
    pub fn push(&self, request: Request) -> Result<ScheduleOutcome, QueueError> {
        let mut inner = self.inner.lock();
        let id = request.id();

        if inner.running.iter().any(|r| r.command == id) || inner.queue.iter().any(|r| r.id() == id)
        {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(ScheduleOutcome::Coalesced);
        }
        if inner.queue.len() >= self.capacity {
            return Err(QueueError::Full);
        }

        inner.queue.push_back(request);
        Ok(ScheduleOutcome::Queued)
    }

    /// Pop the head of the queue and mark it running.
    pub fn begin_next(&self) -> Option<(Request, RunningGuard)> {
        let mut inner = self.inner.lock();
        let request = inner.queue.pop_front()?;
        let token = inner.mark_running(&request);
        drop(inner);

        Some((request, self.guard(token)))
    }

    /// Mark a request that bypasses the queue as running.
    pub fn begin(&self, request: &Request) -> RunningGuard {
        let token = self.inner.lock().mark_running(request);
        self.guard(token)
    }

    fn guard(&self, token: u64) -> RunningGuard {
        RunningGuard {
            inner: self.inner.clone(),
            token,
        }
    }

    /// Whether a request for `command` is queued or running.
    pub fn contains(&self, command: CommandId) -> bool {
        let inner = self.inner.lock();
        inner.running.iter().any(|r| r.command == command)
            || inner.queue.iter().any(|r| r.id() == command)
    }

    /// Interrupt every running request. Returns how many were signalled.
    pub fn interrupt_running(&self) -> usize {
        let inner = self.inner.lock();
        for running in &inner.running {
            running.interrupter.interrupt();
        }
        inner.running.len()
    }

    /// Drop every queued request. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        dropped
    }

    /// Record the end of a cycle.
    pub fn record(&self, success: bool) {
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Number of requests being processed.
    pub fn running(&self) -> usize {
        self.inner.lock().running.len()
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            queued: inner.queue.len(),
            running: inner.running.len(),
            processed_count: self.processed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            coalesced_count: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Keeps a request marked running until dropped.
pub struct RunningGuard {
    inner: Arc<Mutex<QueueInner>>,
    token: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.lock().running.retain(|r| r.token != self.token);
    }
}
