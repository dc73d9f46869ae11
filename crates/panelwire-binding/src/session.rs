//! Session management.
//!
//! The [`SessionManager`] takes part in every request cycle of a connection.
//! It adds credentials, logs in on demand when no session hash is held,
//! tracks the hash handed out by the service, and logs out after a period
//! without traffic.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use panelwire_commands::{
    Arguments, Command, CommandRef, Connection, MissingParameter, Parameter, RequestError,
    Requester, Response, Subscription,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Idle seconds before logging out, when not configured.
pub const DEFAULT_IDLE_TIMEOUT: u64 = 60;

/// Country of the subscription, which fixes country and language codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Country {
    Italy,
    France,
    Spain,
    Portugal,
    England,
}

impl Country {
    pub fn country_code(&self) -> &'static str {
        match self {
            Country::Italy => "IT",
            Country::France => "FR",
            Country::Spain => "ES",
            Country::Portugal => "PT",
            Country::England => "EN",
        }
    }

    pub fn language_code(&self) -> &'static str {
        match self {
            Country::Italy => "it",
            Country::France => "fr",
            Country::Spain => "es",
            Country::Portugal => "pt",
            Country::England => "en",
        }
    }
}

/// Country name that matches no [`Country`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown country: {0}")]
pub struct UnknownCountry(pub String);

impl FromStr for Country {
    type Err = UnknownCountry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ITALY" => Ok(Country::Italy),
            "FRANCE" => Ok(Country::France),
            "SPAIN" => Ok(Country::Spain),
            "PORTUGAL" => Ok(Country::Portugal),
            "ENGLAND" => Ok(Country::England),
            _ => Err(UnknownCountry(s.to_string())),
        }
    }
}

impl TryFrom<String> for Country {
    type Error = UnknownCountry;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Session commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Login,
    Logout,
}

impl Command for SessionCommand {
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Login => "LOGIN",
            SessionCommand::Logout => "LOGOUT",
        }
    }

    fn code(&self) -> String {
        match self {
            SessionCommand::Login => "LOGIN".to_string(),
            SessionCommand::Logout => "CLS".to_string(),
        }
    }
}

/// Arguments contributed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionParameter {
    Country,
    Language,
    User,
    Password,
    Hash,
}

impl Parameter for SessionParameter {
    fn name(&self) -> &'static str {
        match self {
            SessionParameter::Country => "COUNTRY",
            SessionParameter::Language => "LANGUAGE",
            SessionParameter::User => "USER",
            SessionParameter::Password => "PASSWORD",
            SessionParameter::Hash => "HASH",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SessionParameter::Country => "Country",
            SessionParameter::Language => "lang",
            SessionParameter::User => "user",
            SessionParameter::Password => "pwd",
            SessionParameter::Hash => "hash",
        }
    }
}

/// Session configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Account name, usually a phone number
    pub user: Option<String>,
    /// Account password
    pub password: Option<String>,
    /// Country of the subscription
    pub country: Option<Country>,
    /// Idle seconds before logging out
    pub timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            country: None,
            timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("country", &self.country)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Session state as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Unknown,
    Online,
    Offline(String),
}

/// Session error types.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not attached to a connection")]
    Detached,

    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Default)]
struct IdleLogout {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Credentials provider and session hash tracker.
pub struct SessionManager {
    config: SessionConfig,
    hash: Arc<Mutex<Option<String>>>,
    connection: RwLock<Weak<Connection>>,
    idle: Arc<Mutex<IdleLogout>>,
    status: watch::Sender<SessionStatus>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::Unknown);
        Arc::new(Self {
            config,
            hash: Arc::new(Mutex::new(None)),
            connection: RwLock::new(Weak::new()),
            idle: Arc::new(Mutex::new(IdleLogout::default())),
            status,
        })
    }

    /// Take part in every request cycle of `connection`.
    pub fn attach(self: &Arc<Self>, connection: &Arc<Connection>) {
        *self.connection.write() = Arc::downgrade(connection);
        let requester: Arc<dyn Requester> = self.clone();
        connection.register_argument_provider(requester.clone(), &Subscription::All);
        connection.register_response_receiver(requester, &Subscription::All);
        debug!("Session attached");
    }

    /// Leave the connection and stop the idle logout.
    pub fn detach(self: &Arc<Self>) {
        let connection = std::mem::take(&mut *self.connection.write());
        if let Some(connection) = connection.upgrade() {
            let requester: Arc<dyn Requester> = self.clone();
            connection.unregister_argument_provider(&requester);
            connection.unregister_response_receiver(&requester);
        }

        let mut idle = self.idle.lock();
        idle.generation += 1;
        if let Some(handle) = idle.handle.take() {
            handle.abort();
        }
        drop(idle);

        self.status
            .send_replace(SessionStatus::Offline("detached".to_string()));
    }

    /// Current session hash.
    pub fn hash(&self) -> Option<String> {
        self.hash.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch session status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Idle time before an automatic logout.
    pub fn timeout(&self) -> Duration {
        match self.config.timeout {
            0 => Duration::from_secs(DEFAULT_IDLE_TIMEOUT),
            secs => Duration::from_secs(secs),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, SessionError> {
        self.connection.read().upgrade().ok_or(SessionError::Detached)
    }

    /// Log in now.
    pub async fn login(&self) -> Result<Response, SessionError> {
        let connection = self.connection()?;
        match connection.post(&SessionCommand::Login).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.status.send_replace(SessionStatus::Offline(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Log out if a session is held.
    pub async fn logout(&self) -> Result<Option<Response>, SessionError> {
        let logged_in = self.hash.lock().is_some();
        if !logged_in {
            return Ok(None);
        }
        let connection = self.connection()?;
        Ok(Some(connection.post(&SessionCommand::Logout).await?))
    }

    /// Restart the idle countdown.
    fn schedule_logout(&self) {
        let Ok(connection) = self.connection() else {
            return;
        };
        let connection = Arc::downgrade(&connection);
        let timeout = self.timeout();
        let hash = self.hash.clone();
        let state = self.idle.clone();

        let mut idle = self.idle.lock();
        idle.generation += 1;
        if let Some(handle) = idle.handle.take() {
            handle.abort();
        }
        let generation = idle.generation;

        idle.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let stale = state.lock().generation != generation || hash.lock().is_none();
            if stale {
                return;
            }
            let Some(connection) = connection.upgrade() else {
                return;
            };
            info!(idle = ?timeout, "Idle timeout, logging out");
            if let Err(e) = connection.post(&SessionCommand::Logout).await {
                warn!(error = %e, "Idle logout failed");
            }
        }));
    }

    /// Forget the idle countdown without aborting a logout in progress.
    fn clear_logout(&self) {
        let mut idle = self.idle.lock();
        idle.generation += 1;
        idle.handle = None;
    }
}

#[async_trait]
impl Requester for SessionManager {
    async fn arguments_for_request(&self, command: CommandRef) -> Arguments {
        let mut arguments = Arguments::new();
        let country = self.config.country;
        arguments.insert(
            &SessionParameter::Country,
            country.map(|c| c.country_code().to_string()),
        );
        arguments.insert(
            &SessionParameter::Language,
            country.map(|c| c.language_code().to_string()),
        );
        arguments.insert(&SessionParameter::User, self.config.user.clone());

        if command.id() == SessionCommand::Login.id() {
            arguments.insert(&SessionParameter::Password, self.config.password.clone());
        } else {
            let logged_in = self.hash.lock().is_some();
            if !logged_in {
                debug!(command = command.name(), "No session, logging in first");
                if let Err(e) = self.login().await {
                    warn!(error = %e, "Login failed");
                }
            }
            arguments.insert(&SessionParameter::Hash, self.hash());
        }

        arguments
    }

    async fn will_post_request(
        &self,
        command: CommandRef,
        arguments: &Arguments,
    ) -> Result<(), MissingParameter> {
        let required = [
            SessionParameter::Country,
            SessionParameter::Language,
            SessionParameter::User,
        ];
        for parameter in &required {
            if !arguments.contains(parameter) {
                return Err(MissingParameter::new(parameter));
            }
        }

        let credential = if command.id() == SessionCommand::Login.id() {
            SessionParameter::Password
        } else {
            SessionParameter::Hash
        };
        if !arguments.contains(&credential) {
            return Err(MissingParameter::new(&credential));
        }
        Ok(())
    }

    async fn request_complete(&self, response: &Response) {
        let id = response.command().id();

        if id == SessionCommand::Login.id() {
            if response.success() {
                let hash = match response.hash() {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        warn!(error = %e, "Login answer without session hash");
                        None
                    }
                };
                let online = hash.is_some();
                *self.hash.lock() = hash;
                if online {
                    info!("Logged in");
                    self.status.send_replace(SessionStatus::Online);
                    self.schedule_logout();
                }
            } else {
                let message = response.message().unwrap_or_default();
                warn!(message = %message, "Login refused");
                self.status.send_replace(SessionStatus::Offline(message));
            }
        } else if id == SessionCommand::Logout.id() {
            self.hash.lock().take();
            self.clear_logout();
            if response.success() {
                info!("Logged out");
            } else {
                warn!("Logout failed");
            }
        } else {
            self.schedule_logout();
        }
    }
}
