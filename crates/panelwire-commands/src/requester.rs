//! Subscriber protocol around the request cycle.
//!
//! A [`Requester`] takes part in three steps of every cycle, in order:
//!
//! - [`Requester::arguments_for_request`] lets it contribute arguments, for
//!   example credentials;
//! - [`Requester::will_post_request`] lets it check mandatory arguments and
//!   veto the submission;
//! - [`Requester::request_complete`] hands it the terminal response. For
//!   asynchronous commands this only happens for the final answer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::command::{Arguments, CommandId, CommandRef};
use crate::error::MissingParameter;
use crate::response::Response;

/// Participant in the request cycle.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Arguments to add to a request for `command`.
    async fn arguments_for_request(&self, _command: CommandRef) -> Arguments {
        Arguments::new()
    }

    /// Check the collected arguments before anything is sent.
    async fn will_post_request(
        &self,
        _command: CommandRef,
        _arguments: &Arguments,
    ) -> Result<(), MissingParameter> {
        Ok(())
    }

    /// Terminal response of a cycle.
    async fn request_complete(&self, _response: &Response) {}
}

/// Commands a requester registers for.
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Every command, consulted before command-specific registrations.
    All,
    /// The listed commands only.
    Commands(Vec<CommandRef>),
}

impl Subscription {
    /// Subscription to a fixed list of commands.
    pub fn commands(commands: impl IntoIterator<Item = CommandRef>) -> Self {
        Subscription::Commands(commands.into_iter().collect())
    }
}

#[derive(Default)]
struct Buckets {
    all: Vec<Arc<dyn Requester>>,
    by_command: HashMap<CommandId, Vec<Arc<dyn Requester>>>,
}

impl Buckets {
    fn add(list: &mut Vec<Arc<dyn Requester>>, requester: &Arc<dyn Requester>) {
        if !list.iter().any(|r| Arc::ptr_eq(r, requester)) {
            list.push(requester.clone());
        }
    }

    fn register(&mut self, requester: &Arc<dyn Requester>, subscription: &Subscription) {
        match subscription {
            Subscription::All => Self::add(&mut self.all, requester),
            Subscription::Commands(commands) => {
                for command in commands {
                    Self::add(self.by_command.entry(command.id()).or_default(), requester);
                }
            }
        }
    }

    fn unregister(&mut self, requester: &Arc<dyn Requester>) {
        self.all.retain(|r| !Arc::ptr_eq(r, requester));
        for list in self.by_command.values_mut() {
            list.retain(|r| !Arc::ptr_eq(r, requester));
        }
        self.by_command.retain(|_, list| !list.is_empty());
    }

    fn matching(&self, command: CommandId) -> Vec<Arc<dyn Requester>> {
        let mut result = self.all.clone();
        if let Some(list) = self.by_command.get(&command) {
            for requester in list {
                Self::add(&mut result, requester);
            }
        }
        result
    }

    fn len(&self) -> usize {
        let mut seen: Vec<&Arc<dyn Requester>> = Vec::new();
        for requester in self.all.iter().chain(self.by_command.values().flatten()) {
            if !seen.iter().any(|r| Arc::ptr_eq(r, requester)) {
                seen.push(requester);
            }
        }
        seen.len()
    }
}

/// Registry of argument providers and response receivers.
///
/// Lookups return snapshots so callbacks run without the lock held.
#[derive(Default)]
pub struct RequesterRegistry {
    providers: RwLock<Buckets>,
    receivers: RwLock<Buckets>,
}

impl RequesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for [`Requester::arguments_for_request`] calls.
    pub fn register_argument_provider(
        &self,
        provider: Arc<dyn Requester>,
        subscription: &Subscription,
    ) {
        self.providers.write().register(&provider, subscription);
    }

    /// Remove a provider from every command it registered for.
    pub fn unregister_argument_provider(&self, provider: &Arc<dyn Requester>) {
        self.providers.write().unregister(provider);
    }

    /// Register for [`Requester::will_post_request`] and
    /// [`Requester::request_complete`] calls.
    pub fn register_response_receiver(
        &self,
        receiver: Arc<dyn Requester>,
        subscription: &Subscription,
    ) {
        self.receivers.write().register(&receiver, subscription);
    }

    /// Remove a receiver from every command it registered for.
    pub fn unregister_response_receiver(&self, receiver: &Arc<dyn Requester>) {
        self.receivers.write().unregister(receiver);
    }

    /// Providers for a command, wildcard registrations first.
    pub fn providers_for(&self, command: CommandId) -> Vec<Arc<dyn Requester>> {
        self.providers.read().matching(command)
    }

    /// Receivers for a command, wildcard registrations first.
    pub fn receivers_for(&self, command: CommandId) -> Vec<Arc<dyn Requester>> {
        self.receivers.read().matching(command)
    }

    /// Number of distinct registered providers.
    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    /// Number of distinct registered receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers.read().len()
    }
}
