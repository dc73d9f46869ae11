//! Alarm panel binding.
//!
//! [`AlarmPanel`] issues the alarm commands of one installation, decodes the
//! answers and publishes the resulting channel values.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use panelwire_commands::{
    Arguments, Command, CommandRef, Connection, Element, MissingParameter, Parameter, QueueError,
    Requester, Response, ScheduleOutcome, Subscription,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Alarm commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCommand {
    Installation,
    Svr,
    Status,
    Disarmed,
    ArmedAll,
    ArmedNight,
    ArmedDay,
    ArmedPerimeter,
    Img,
    Inf,
}

static ALARM_COMMANDS: [AlarmCommand; 10] = [
    AlarmCommand::Installation,
    AlarmCommand::Svr,
    AlarmCommand::Status,
    AlarmCommand::Disarmed,
    AlarmCommand::ArmedAll,
    AlarmCommand::ArmedNight,
    AlarmCommand::ArmedDay,
    AlarmCommand::ArmedPerimeter,
    AlarmCommand::Img,
    AlarmCommand::Inf,
];

impl AlarmCommand {
    pub fn all() -> &'static [AlarmCommand] {
        &ALARM_COMMANDS
    }

    /// Alarm command behind a command reference.
    pub fn from_ref(command: CommandRef) -> Option<AlarmCommand> {
        let id = command.id();
        ALARM_COMMANDS.iter().find(|c| c.id() == id).copied()
    }

    /// Reference suitable for scheduling.
    pub fn as_command(&self) -> CommandRef {
        &ALARM_COMMANDS[*self as usize]
    }

    fn base_code(&self) -> &'static str {
        match self {
            AlarmCommand::Installation => "MYINSTALLATION",
            AlarmCommand::Svr => "SVR",
            AlarmCommand::Status => "EST",
            AlarmCommand::Disarmed => "DARM",
            AlarmCommand::ArmedAll => "ARM",
            AlarmCommand::ArmedNight => "ARMNIGHT",
            AlarmCommand::ArmedDay => "ARMDAY",
            AlarmCommand::ArmedPerimeter => "PERI",
            AlarmCommand::Img => "IMG",
            AlarmCommand::Inf => "INF",
        }
    }

    /// Whether the answer carries the alarm state.
    pub fn reports_state(&self) -> bool {
        matches!(
            self,
            AlarmCommand::Status
                | AlarmCommand::Disarmed
                | AlarmCommand::ArmedAll
                | AlarmCommand::ArmedNight
                | AlarmCommand::ArmedDay
                | AlarmCommand::ArmedPerimeter
        )
    }

    /// Whether the command changes the alarm state.
    pub fn is_arming(&self) -> bool {
        self.reports_state() && *self != AlarmCommand::Status
    }
}

impl Command for AlarmCommand {
    fn name(&self) -> &'static str {
        match self {
            AlarmCommand::Installation => "INSTALLATION",
            AlarmCommand::Svr => "SVR",
            AlarmCommand::Status => "STATUS",
            AlarmCommand::Disarmed => "DISARMED",
            AlarmCommand::ArmedAll => "ARMED_ALL",
            AlarmCommand::ArmedNight => "ARMED_NIGHT",
            AlarmCommand::ArmedDay => "ARMED_DAY",
            AlarmCommand::ArmedPerimeter => "ARMED_PERIMETER",
            AlarmCommand::Img => "IMG",
            AlarmCommand::Inf => "INF",
        }
    }

    fn code(&self) -> String {
        if self.is_async() {
            format!("{}1", self.base_code())
        } else {
            self.base_code().to_string()
        }
    }

    fn follow_up_code(&self) -> String {
        format!("{}2", self.base_code())
    }

    fn is_async(&self) -> bool {
        !matches!(
            self,
            AlarmCommand::Installation | AlarmCommand::Svr | AlarmCommand::Inf
        )
    }
}

impl FromStr for AlarmCommand {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALARM_COMMANDS
            .iter()
            .find(|c| c.name() == s)
            .copied()
            .ok_or_else(|| AlarmError::UnknownCommand(s.to_string()))
    }
}

/// Arguments contributed by the alarm panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmParameter {
    Installation,
    Panel,
    Service,
    Ibs,
    Device,
    Signal,
    SignalType,
}

impl Parameter for AlarmParameter {
    fn name(&self) -> &'static str {
        match self {
            AlarmParameter::Installation => "INSTALLATION",
            AlarmParameter::Panel => "PANEL",
            AlarmParameter::Service => "SERVICE",
            AlarmParameter::Ibs => "IBS",
            AlarmParameter::Device => "DEVICE",
            AlarmParameter::Signal => "SIGNAL",
            AlarmParameter::SignalType => "SIGNALTYPE",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AlarmParameter::Installation => "numinst",
            AlarmParameter::Panel => "panel",
            AlarmParameter::Service => "idservice",
            AlarmParameter::Ibs => "instibs",
            AlarmParameter::Device => "device",
            AlarmParameter::Signal => "idsignal",
            AlarmParameter::SignalType => "signaltype",
        }
    }
}

/// Alarm state reported by the panel.
///
/// Combined states carry both an indoor and a perimeter part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmState {
    Disarmed,
    ArmedAll,
    ArmedNight,
    ArmedDay,
    ArmedPerimeter,
    ArmedAllPerimeter,
    ArmedDayPerimeter,
    ArmedNightPerimeter,
    Busy,
    Unknown,
}

impl AlarmState {
    /// Decode a status code.
    pub fn from_code(code: &str) -> Option<AlarmState> {
        let state = match code {
            "0" => AlarmState::Disarmed,
            "A" | "1" => AlarmState::ArmedAll,
            "Q" => AlarmState::ArmedNight,
            "P" => AlarmState::ArmedDay,
            "3" => AlarmState::ArmedPerimeter,
            "4" => AlarmState::ArmedAllPerimeter,
            "B" => AlarmState::ArmedDayPerimeter,
            "C" => AlarmState::ArmedNightPerimeter,
            "BUSY" => AlarmState::Busy,
            "UNKNOWN" => AlarmState::Unknown,
            _ => return None,
        };
        Some(state)
    }

    /// Indoor part of the state.
    pub fn indoor(&self) -> AlarmState {
        match self {
            AlarmState::Disarmed | AlarmState::ArmedPerimeter => AlarmState::Disarmed,
            AlarmState::ArmedAll | AlarmState::ArmedAllPerimeter => AlarmState::ArmedAll,
            AlarmState::ArmedNight | AlarmState::ArmedNightPerimeter => AlarmState::ArmedNight,
            AlarmState::ArmedDay | AlarmState::ArmedDayPerimeter => AlarmState::ArmedDay,
            AlarmState::Busy => AlarmState::Busy,
            AlarmState::Unknown => AlarmState::Unknown,
        }
    }

    /// Perimeter part of the state.
    pub fn perimeter(&self) -> AlarmState {
        match self {
            AlarmState::ArmedPerimeter
            | AlarmState::ArmedAllPerimeter
            | AlarmState::ArmedDayPerimeter
            | AlarmState::ArmedNightPerimeter => AlarmState::ArmedPerimeter,
            AlarmState::Busy => AlarmState::Busy,
            AlarmState::Unknown => AlarmState::Unknown,
            _ => AlarmState::Disarmed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlarmState::Disarmed => "DISARMED",
            AlarmState::ArmedAll => "ARMED_ALL",
            AlarmState::ArmedNight => "ARMED_NIGHT",
            AlarmState::ArmedDay => "ARMED_DAY",
            AlarmState::ArmedPerimeter => "ARMED_PERIMETER",
            AlarmState::ArmedAllPerimeter => "ARMED_ALL_PERIMETER",
            AlarmState::ArmedDayPerimeter => "ARMED_DAY_PERIMETER",
            AlarmState::ArmedNightPerimeter => "ARMED_NIGHT_PERIMETER",
            AlarmState::Busy => "BUSY",
            AlarmState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values published by the alarm panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlarmChannel {
    Status,
    Perimeter,
    InstallationName,
    CodewordVerisure,
    CodewordCustomer,
    CodewordCoercion,
    Emails,
    Phones,
    Devices,
    Svr,
}

static ALARM_CHANNELS: [AlarmChannel; 10] = [
    AlarmChannel::Status,
    AlarmChannel::Perimeter,
    AlarmChannel::InstallationName,
    AlarmChannel::CodewordVerisure,
    AlarmChannel::CodewordCustomer,
    AlarmChannel::CodewordCoercion,
    AlarmChannel::Emails,
    AlarmChannel::Phones,
    AlarmChannel::Devices,
    AlarmChannel::Svr,
];

impl AlarmChannel {
    pub fn all() -> &'static [AlarmChannel] {
        &ALARM_CHANNELS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmChannel::Status => "status",
            AlarmChannel::Perimeter => "perimeter",
            AlarmChannel::InstallationName => "installationName",
            AlarmChannel::CodewordVerisure => "codewordVerisure",
            AlarmChannel::CodewordCustomer => "codewordCustomer",
            AlarmChannel::CodewordCoercion => "codewordCoercion",
            AlarmChannel::Emails => "emails",
            AlarmChannel::Phones => "phones",
            AlarmChannel::Devices => "devices",
            AlarmChannel::Svr => "svr",
        }
    }

    /// Command whose answer refreshes this channel.
    pub fn refresh_command(&self) -> AlarmCommand {
        match self {
            AlarmChannel::Status | AlarmChannel::Perimeter => AlarmCommand::Status,
            AlarmChannel::Svr => AlarmCommand::Svr,
            _ => AlarmCommand::Installation,
        }
    }
}

impl fmt::Display for AlarmChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmChannel {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALARM_CHANNELS
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| AlarmError::UnknownChannel(s.to_string()))
    }
}

/// Installation details in the answer to [`AlarmCommand::Installation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationElement {
    Name,
    CodewordVerisure,
    CodewordCustomer,
    CodewordCoercion,
    Emails,
    Phones,
    Devices,
}

impl InstallationElement {
    pub const ALL: [InstallationElement; 7] = [
        InstallationElement::Name,
        InstallationElement::CodewordVerisure,
        InstallationElement::CodewordCustomer,
        InstallationElement::CodewordCoercion,
        InstallationElement::Emails,
        InstallationElement::Phones,
        InstallationElement::Devices,
    ];

    /// Channel the value is published on.
    pub fn channel(&self) -> AlarmChannel {
        match self {
            InstallationElement::Name => AlarmChannel::InstallationName,
            InstallationElement::CodewordVerisure => AlarmChannel::CodewordVerisure,
            InstallationElement::CodewordCustomer => AlarmChannel::CodewordCustomer,
            InstallationElement::CodewordCoercion => AlarmChannel::CodewordCoercion,
            InstallationElement::Emails => AlarmChannel::Emails,
            InstallationElement::Phones => AlarmChannel::Phones,
            InstallationElement::Devices => AlarmChannel::Devices,
        }
    }
}

impl Element for InstallationElement {
    fn name(&self) -> &'static str {
        match self {
            InstallationElement::Name => "NAME",
            InstallationElement::CodewordVerisure => "CODEWORD_VERISURE",
            InstallationElement::CodewordCustomer => "CODEWORD_CUSTOMER",
            InstallationElement::CodewordCoercion => "CODEWORD_COERCION",
            InstallationElement::Emails => "EMAILS",
            InstallationElement::Phones => "PHONES",
            InstallationElement::Devices => "DEVICES",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            InstallationElement::Name => "/PET/INSTALLATION/@alias",
            InstallationElement::CodewordVerisure => "/PET/INSTALLATION/CODEWORDS/@securitas",
            InstallationElement::CodewordCustomer => "/PET/INSTALLATION/CODEWORDS/@customer",
            InstallationElement::CodewordCoercion => "/PET/INSTALLATION/CODEWORDS/@coercion",
            InstallationElement::Emails => "/PET/INSTALLATION/EMAILS/EMAIL/@address",
            InstallationElement::Phones => "/PET/INSTALLATION/PHONES/PHONE/@number",
            InstallationElement::Devices => "/PET/INSTALLATION/DEVICES",
        }
    }
}

/// A new channel value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub channel: AlarmChannel,
    pub value: String,
}

/// Command addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Re-read the channel value.
    Refresh,
    /// Abort pending work and re-read the state.
    Cancel,
    /// Set a new value.
    Set(String),
}

impl From<&str> for ChannelCommand {
    fn from(value: &str) -> Self {
        match value {
            "REFRESH" => ChannelCommand::Refresh,
            "CANCEL" => ChannelCommand::Cancel,
            other => ChannelCommand::Set(other.to_string()),
        }
    }
}

/// Alarm panel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Installation number
    pub installation: Option<String>,
    /// Panel type
    pub panel: Option<String>,
    /// Minutes between status refreshes, zero disables
    pub refresh: u64,
}

/// Alarm error types.
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("Unknown alarm command: {0}")]
    UnknownCommand(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {0} is read-only")]
    ReadOnlyChannel(AlarmChannel),

    #[error("Alarm panel is not attached to a connection")]
    Detached,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Alarm panel of one installation.
pub struct AlarmPanel {
    config: AlarmConfig,
    connection: RwLock<Weak<Connection>>,
    updates: broadcast::Sender<ChannelUpdate>,
    states: Mutex<HashMap<AlarmChannel, String>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl AlarmPanel {
    pub fn new(config: AlarmConfig) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            connection: RwLock::new(Weak::new()),
            updates,
            states: Mutex::new(HashMap::new()),
            refresh: Mutex::new(None),
        })
    }

    /// Take part in the cycles of every alarm command on `connection`.
    pub fn attach(self: &Arc<Self>, connection: &Arc<Connection>) {
        *self.connection.write() = Arc::downgrade(connection);

        let requester: Arc<dyn Requester> = self.clone();
        let subscription =
            Subscription::commands(AlarmCommand::all().iter().map(|c| c as CommandRef));
        connection.register_argument_provider(requester.clone(), &subscription);
        connection.register_response_receiver(requester, &subscription);

        if self.config.refresh > 0 {
            let period = Duration::from_secs(self.config.refresh.saturating_mul(60));
            match Instant::now().checked_add(period) {
                Some(start) => {
                    let handle =
                        tokio::spawn(run_refresh(Arc::downgrade(connection), start, period));
                    if let Some(previous) = self.refresh.lock().replace(handle) {
                        previous.abort();
                    }
                }
                None => warn!(
                    refresh = self.config.refresh,
                    "Refresh period out of range, periodic refresh disabled"
                ),
            }
        }
        debug!(refresh = self.config.refresh, "Alarm panel attached");
    }

    /// Leave the connection and stop periodic refreshes.
    pub fn detach(self: &Arc<Self>) {
        if let Some(handle) = self.refresh.lock().take() {
            handle.abort();
        }
        let connection = std::mem::take(&mut *self.connection.write());
        if let Some(connection) = connection.upgrade() {
            let requester: Arc<dyn Requester> = self.clone();
            connection.unregister_argument_provider(&requester);
            connection.unregister_response_receiver(&requester);
        }
    }

    /// Receive channel updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelUpdate> {
        self.updates.subscribe()
    }

    /// Last value published on a channel.
    pub fn state(&self, channel: AlarmChannel) -> Option<String> {
        self.states.lock().get(&channel).cloned()
    }

    /// Act on a command addressed to a channel.
    pub fn handle_command(
        &self,
        channel: AlarmChannel,
        command: ChannelCommand,
    ) -> Result<ScheduleOutcome, AlarmError> {
        let connection = self
            .connection
            .read()
            .upgrade()
            .ok_or(AlarmError::Detached)?;

        let target = match command {
            ChannelCommand::Cancel => {
                connection.cancel();
                AlarmCommand::Status
            }
            ChannelCommand::Refresh => channel.refresh_command(),
            ChannelCommand::Set(value) => match channel {
                AlarmChannel::Status | AlarmChannel::Perimeter => {
                    let target: AlarmCommand = value.parse()?;
                    if !target.is_arming() {
                        return Err(AlarmError::UnknownCommand(value));
                    }
                    target
                }
                other => return Err(AlarmError::ReadOnlyChannel(other)),
            },
        };

        Ok(connection.schedule(target.as_command())?)
    }

    fn publish(&self, channel: AlarmChannel, value: impl Into<String>) {
        let value = value.into();
        self.states.lock().insert(channel, value.clone());
        // Nobody listening is fine.
        let _ = self.updates.send(ChannelUpdate { channel, value });
    }

    fn publish_state(&self, state: AlarmState) {
        self.publish(AlarmChannel::Status, state.indoor().name());
        self.publish(AlarmChannel::Perimeter, state.perimeter().name());
    }

    fn publish_installation(&self, response: Option<&Response>) {
        for element in InstallationElement::ALL {
            match response {
                Some(response) => match response.get(&element) {
                    Ok(value) => self.publish(element.channel(), value),
                    Err(e) => warn!(error = %e, "Incomplete installation details"),
                },
                None => self.publish(element.channel(), "IDLE"),
            }
        }
    }
}

#[async_trait]
impl Requester for AlarmPanel {
    async fn arguments_for_request(&self, _command: CommandRef) -> Arguments {
        let mut arguments = Arguments::new();
        arguments.insert(&AlarmParameter::Installation, self.config.installation.clone());
        arguments.insert(&AlarmParameter::Panel, self.config.panel.clone());
        arguments
    }

    async fn will_post_request(
        &self,
        command: CommandRef,
        arguments: &Arguments,
    ) -> Result<(), MissingParameter> {
        for parameter in [AlarmParameter::Installation, AlarmParameter::Panel] {
            if !arguments.contains(&parameter) {
                return Err(MissingParameter::new(&parameter));
            }
        }

        match AlarmCommand::from_ref(command) {
            Some(c) if c.reports_state() => self.publish_state(AlarmState::Busy),
            Some(AlarmCommand::Installation) => {
                for element in InstallationElement::ALL {
                    self.publish(element.channel(), "BUSY");
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn request_complete(&self, response: &Response) {
        let Some(command) = AlarmCommand::from_ref(response.command()) else {
            return;
        };

        match command {
            c if c.reports_state() => {
                if !response.success() {
                    self.publish_state(AlarmState::Unknown);
                    return;
                }
                match response.status() {
                    Ok(code) => match AlarmState::from_code(&code) {
                        Some(state) => self.publish_state(state),
                        None => {
                            warn!(code = %code, "Unknown alarm state code");
                            self.publish_state(AlarmState::Unknown);
                        }
                    },
                    Err(e) => warn!(error = %e, "Alarm state missing"),
                }
            }
            AlarmCommand::Installation => {
                self.publish_installation(response.success().then_some(response));
            }
            AlarmCommand::Svr => {
                if response.success() {
                    match response.sim() {
                        Ok(sim) => self.publish(AlarmChannel::Svr, sim),
                        Err(e) => warn!(error = %e, "SIM details missing"),
                    }
                }
            }
            other => debug!(command = other.name(), "No channel for command"),
        }
    }
}

async fn run_refresh(connection: Weak<Connection>, start: Instant, period: Duration) {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if let Err(e) = connection.schedule(&AlarmCommand::Status) {
            warn!(error = %e, "Failed to schedule status refresh");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(AlarmCommand::Status.code(), "EST1");
        assert_eq!(AlarmCommand::Status.follow_up_code(), "EST2");
        assert_eq!(AlarmCommand::Installation.code(), "MYINSTALLATION");
        assert_eq!(AlarmCommand::ArmedPerimeter.code(), "PERI1");
        assert!(!AlarmCommand::Inf.is_async());
        assert!(AlarmCommand::Img.is_async());
    }

    #[test]
    fn test_command_lookup() {
        assert_eq!(
            "ARMED_NIGHT".parse::<AlarmCommand>().unwrap(),
            AlarmCommand::ArmedNight
        );
        assert!("armed_night".parse::<AlarmCommand>().is_err());
        assert_eq!(
            AlarmCommand::from_ref(&AlarmCommand::Svr),
            Some(AlarmCommand::Svr)
        );
        assert_eq!(AlarmCommand::ArmedDay.as_command().name(), "ARMED_DAY");
    }

    #[test]
    fn test_state_decoding() {
        let state = AlarmState::from_code("4").unwrap();
        assert_eq!(state.indoor(), AlarmState::ArmedAll);
        assert_eq!(state.perimeter(), AlarmState::ArmedPerimeter);

        let state = AlarmState::from_code("3").unwrap();
        assert_eq!(state.indoor(), AlarmState::Disarmed);
        assert_eq!(state.perimeter(), AlarmState::ArmedPerimeter);

        let state = AlarmState::from_code("Q").unwrap();
        assert_eq!(state.indoor(), AlarmState::ArmedNight);
        assert_eq!(state.perimeter(), AlarmState::Disarmed);

        assert_eq!(AlarmState::from_code("1"), Some(AlarmState::ArmedAll));
        assert_eq!(AlarmState::Busy.perimeter(), AlarmState::Busy);
        assert!(AlarmState::from_code("Z").is_none());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(
            "installationName".parse::<AlarmChannel>().unwrap(),
            AlarmChannel::InstallationName
        );
        assert_eq!(
            AlarmChannel::Phones.refresh_command(),
            AlarmCommand::Installation
        );
        assert_eq!(AlarmChannel::Perimeter.refresh_command(), AlarmCommand::Status);
        assert!("nope".parse::<AlarmChannel>().is_err());
    }

    #[test]
    fn test_channel_command_parsing() {
        assert_eq!(ChannelCommand::from("REFRESH"), ChannelCommand::Refresh);
        assert_eq!(ChannelCommand::from("CANCEL"), ChannelCommand::Cancel);
        assert_eq!(
            ChannelCommand::from("ARMED_ALL"),
            ChannelCommand::Set("ARMED_ALL".to_string())
        );
    }
}
