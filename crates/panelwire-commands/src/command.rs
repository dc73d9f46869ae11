//! Command and parameter vocabularies.
//!
//! Bindings describe the operations they understand as closed enums that
//! implement [`Command`], and the query arguments they contribute as enums
//! that implement [`Parameter`]. The engine only ever sees `&'static dyn`
//! references to those variants.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reference to a command variant.
pub type CommandRef = &'static dyn Command;

/// Reference to a parameter variant.
pub type ParameterRef = &'static dyn Parameter;

/// Identity of a command variant across bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    binding: &'static str,
    name: &'static str,
}

impl CommandId {
    /// Create an identifier from a binding type name and a variant name.
    pub const fn new(binding: &'static str, name: &'static str) -> Self {
        Self { binding, name }
    }

    /// Symbolic name of the command.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity of a parameter variant across bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId {
    binding: &'static str,
    name: &'static str,
}

impl ParameterId {
    /// Create an identifier from a binding type name and a variant name.
    pub const fn new(binding: &'static str, name: &'static str) -> Self {
        Self { binding, name }
    }
}

/// An operation understood by the remote service.
pub trait Command: fmt::Debug + Send + Sync + 'static {
    /// Symbolic name, unique within the implementing type.
    fn name(&self) -> &'static str;

    /// Wire code sent with the first request of a submission.
    fn code(&self) -> String;

    /// Wire code sent with follow-up polls.
    fn follow_up_code(&self) -> String {
        self.code()
    }

    /// Whether the service may answer with a pending status.
    fn is_async(&self) -> bool {
        false
    }

    /// Identity used for registry lookups and queue coalescing.
    fn id(&self) -> CommandId {
        CommandId::new(std::any::type_name::<Self>(), self.name())
    }
}

/// A query argument understood by the remote service.
pub trait Parameter: fmt::Debug + Send + Sync + 'static {
    /// Symbolic name, unique within the implementing type.
    fn name(&self) -> &'static str;

    /// Key used when encoding the argument into the query string.
    fn code(&self) -> &'static str;

    /// Identity used for argument map lookups.
    fn id(&self) -> ParameterId {
        ParameterId::new(std::any::type_name::<Self>(), self.name())
    }
}

/// Parameters the engine itself attaches to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestParameter {
    /// Submission identification token.
    Id,
    /// Wire code of the command.
    Request,
    /// Caller identity, only sent on the first request.
    CallBy,
    /// Poll attempt counter, only sent on follow-ups.
    Counter,
}

impl Parameter for RequestParameter {
    fn name(&self) -> &'static str {
        match self {
            RequestParameter::Id => "ID",
            RequestParameter::Request => "REQUEST",
            RequestParameter::CallBy => "CALLBY",
            RequestParameter::Counter => "COUNTER",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RequestParameter::Id => "ID",
            RequestParameter::Request => "request",
            RequestParameter::CallBy => "callby",
            RequestParameter::Counter => "counter",
        }
    }
}

/// Arguments collected for one request, kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    entries: Vec<(ParameterRef, Option<String>)>,
}

impl Arguments {
    /// Create an empty argument map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a possibly absent value.
    pub fn insert(&mut self, parameter: ParameterRef, value: Option<String>) {
        let id = parameter.id();
        match self.entries.iter_mut().find(|(p, _)| p.id() == id) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((parameter, value)),
        }
    }

    /// Insert or replace a value.
    pub fn set(&mut self, parameter: ParameterRef, value: impl Into<String>) {
        self.insert(parameter, Some(value.into()));
    }

    /// Value of a parameter, `None` when absent or explicitly unset.
    pub fn get(&self, parameter: &dyn Parameter) -> Option<&str> {
        let id = parameter.id();
        self.entries
            .iter()
            .find(|(p, _)| p.id() == id)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Value of the first parameter whose wire code matches.
    pub fn get_by_code(&self, code: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| p.code() == code)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether the parameter has a value.
    pub fn contains(&self, parameter: &dyn Parameter) -> bool {
        self.get(parameter).is_some()
    }

    /// Remove a parameter, returning its value.
    pub fn remove(&mut self, parameter: &dyn Parameter) -> Option<String> {
        let id = parameter.id();
        let position = self.entries.iter().position(|(p, _)| p.id() == id)?;
        self.entries.remove(position).1
    }

    /// Merge another map into this one; colliding keys take the other value.
    pub fn merge(&mut self, other: Arguments) {
        for (parameter, value) in other.entries {
            self.insert(parameter, value);
        }
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterRef, Option<&str>)> {
        self.entries.iter().map(|(p, v)| (*p, v.as_deref()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as `code=value` pairs joined by `&`. Unset values are skipped.
    pub fn to_query(&self) -> String {
        self.entries
            .iter()
            .filter_map(|(p, v)| {
                v.as_ref()
                    .map(|value| format!("{}={}", p.code(), urlencoding::encode(value)))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Backoff applied between follow-up polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Wait the base interval every time.
    #[default]
    Fixed,
    /// Multiply the interval on every attempt, up to a cap in seconds.
    Exponential {
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound in seconds
        max_interval: u64,
    },
}

/// How a pending command is re-polled.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Base wait between polls
    pub interval: Duration,
    /// Maximum number of pending answers tolerated
    pub max_attempts: u32,
    /// Growth of the wait across attempts
    pub backoff: Backoff,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 10,
            backoff: Backoff::Fixed,
        }
    }
}

impl PollPolicy {
    /// Wait before the follow-up issued after `attempt` pending answers.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential {
                multiplier,
                max_interval,
            } => {
                let cap = Duration::from_secs(*max_interval);
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.interval.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs < 0.0 || secs >= cap.as_secs_f64() {
                    cap
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Probe {
        Ping,
        Poll,
    }

    impl Command for Probe {
        fn name(&self) -> &'static str {
            match self {
                Probe::Ping => "PING",
                Probe::Poll => "POLL",
            }
        }

        fn code(&self) -> String {
            match self {
                Probe::Ping => "PING".to_string(),
                Probe::Poll => "POLL1".to_string(),
            }
        }

        fn follow_up_code(&self) -> String {
            match self {
                Probe::Ping => self.code(),
                Probe::Poll => "POLL2".to_string(),
            }
        }

        fn is_async(&self) -> bool {
            matches!(self, Probe::Poll)
        }
    }

    #[derive(Debug)]
    enum Key {
        User,
        Note,
    }

    impl Parameter for Key {
        fn name(&self) -> &'static str {
            match self {
                Key::User => "USER",
                Key::Note => "NOTE",
            }
        }

        fn code(&self) -> &'static str {
            match self {
                Key::User => "user",
                Key::Note => "note",
            }
        }
    }

    #[test]
    fn test_command_identity() {
        assert_eq!(Probe::Ping.id(), Probe::Ping.id());
        assert_ne!(Probe::Ping.id(), Probe::Poll.id());
        assert_eq!(Probe::Poll.id().name(), "POLL");
        assert_eq!(Probe::Poll.follow_up_code(), "POLL2");
        assert!(!Probe::Ping.is_async());
    }

    #[test]
    fn test_same_name_in_other_binding_is_distinct() {
        assert_ne!(Key::User.id(), RequestParameter::Id.id());
        let other = ParameterId::new("other::Key", "USER");
        assert_ne!(Key::User.id(), other);
    }

    #[test]
    fn test_arguments_overwrite_keeps_position() {
        let mut args = Arguments::new();
        args.set(&Key::User, "alice");
        args.set(&Key::Note, "first");
        args.set(&Key::User, "bob");

        assert_eq!(args.len(), 2);
        assert_eq!(args.get(&Key::User), Some("bob"));
        assert_eq!(args.to_query(), "user=bob&note=first");
    }

    #[test]
    fn test_arguments_merge_later_wins() {
        let mut first = Arguments::new();
        first.set(&Key::User, "alice");
        let mut second = Arguments::new();
        second.set(&Key::User, "carol");
        second.insert(&Key::Note, None);

        first.merge(second);
        assert_eq!(first.get(&Key::User), Some("carol"));
        assert!(!first.contains(&Key::Note));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_query_skips_unset_and_encodes() {
        let mut args = Arguments::new();
        args.insert(&Key::User, None);
        args.set(&Key::Note, "a b&c");
        assert_eq!(args.to_query(), "note=a%20b%26c");
        assert_eq!(args.get_by_code("note"), Some("a b&c"));
    }

    #[test]
    fn test_remove() {
        let mut args = Arguments::new();
        args.set(&RequestParameter::CallBy, "IPH_61");
        assert_eq!(args.remove(&RequestParameter::CallBy), Some("IPH_61".to_string()));
        assert!(args.is_empty());
        assert_eq!(args.remove(&RequestParameter::CallBy), None);
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_interval: 10,
            },
        };

        assert_eq!(policy.delay_for_attempt(0).as_millis(), 1000);
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 1000);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 2000);
        assert_eq!(policy.delay_for_attempt(4).as_millis(), 8000);
        assert_eq!(policy.delay_for_attempt(5).as_millis(), 10000); // capped
        assert_eq!(policy.delay_for_attempt(u32::MAX).as_millis(), 10000);
    }
}
