//! Alarm panel binding built on the panelwire command engine.
//!
//! Provides:
//! - Session management (login, logout, idle logout)
//! - Alarm commands, state decoding and channel updates
//! - Application configuration loading

pub mod alarm;
pub mod config;
pub mod session;

// Re-exports
pub use alarm::{
    AlarmChannel, AlarmCommand, AlarmConfig, AlarmError, AlarmPanel, AlarmParameter, AlarmState,
    ChannelCommand, ChannelUpdate, InstallationElement,
};

pub use config::{AppConfig, ConfigError};

pub use session::{
    Country, SessionCommand, SessionConfig, SessionError, SessionManager, SessionParameter,
    SessionStatus, UnknownCountry,
};
