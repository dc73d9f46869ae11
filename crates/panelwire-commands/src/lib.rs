//! Command protocol engine for polled alarm-panel services.
//!
//! Provides:
//! - Command and parameter vocabularies
//! - Response inspection of XML answers
//! - The post and poll cycle of a single request
//! - A connection with a coalescing request queue and subscriber dispatch
//! - HTTP and scripted transports

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod queue;
pub mod request;
pub mod requester;
pub mod response;
pub mod transport;

// Re-exports
pub use command::{
    Arguments, Backoff, Command, CommandId, CommandRef, Parameter, ParameterId, ParameterRef,
    PollPolicy, RequestParameter,
};

pub use config::ConnectionConfig;

pub use connection::Connection;

pub use error::{MissingParameter, RequestError, ResponseError};

pub use queue::{QueueError, QueueStats, RequestQueue, ScheduleOutcome};

pub use request::{Interrupter, Request, RequestSettings};

pub use requester::{Requester, RequesterRegistry, Subscription};

pub use response::{CommonElement, Document, DocumentError, Element, Response};

pub use transport::{
    HttpTransport, HttpTransportConfig, ScriptedTransport, Transport, TransportError,
    TransportReply, TransportStats,
};
