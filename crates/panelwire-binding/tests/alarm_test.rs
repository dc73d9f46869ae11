//! Alarm panel tests against a scripted service.

use std::sync::Arc;
use std::time::Duration;

use panelwire_binding::{
    AlarmChannel, AlarmCommand, AlarmConfig, AlarmError, AlarmPanel, ChannelCommand,
    ChannelUpdate, Country, SessionConfig, SessionManager,
};
use panelwire_commands::{
    Connection, ConnectionConfig, RequestError, ScheduleOutcome, ScriptedTransport,
};

const INSTALLATION: &str = r#"<PET>
  <RES>OK</RES>
  <INSTALLATION alias="Home">
    <CODEWORDS securitas="alpha" customer="bravo" coercion="charlie"/>
    <EMAILS><EMAIL address="first@example.com"/><EMAIL address="second@example.com"/></EMAILS>
    <PHONES><PHONE number="0612345678"/></PHONES>
    <DEVICES>4</DEVICES>
  </INSTALLATION>
</PET>"#;

fn alarm_config() -> AlarmConfig {
    AlarmConfig {
        installation: Some("1234567".to_string()),
        panel: Some("SDVFAST".to_string()),
        refresh: 0,
    }
}

fn setup(config: AlarmConfig) -> (Arc<ScriptedTransport>, Arc<Connection>, Arc<AlarmPanel>) {
    let transport = Arc::new(ScriptedTransport::new());
    let connection = Connection::new(transport.clone(), &ConnectionConfig::default());
    let panel = AlarmPanel::new(config);
    panel.attach(&connection);
    (transport, connection, panel)
}

fn update(channel: AlarmChannel, value: &str) -> ChannelUpdate {
    ChannelUpdate {
        channel,
        value: value.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_with_session() {
    let (transport, connection, panel) = setup(alarm_config());
    let session = SessionManager::new(SessionConfig {
        user: Some("3331234567".to_string()),
        password: Some("secret".to_string()),
        country: Some(Country::Spain),
        timeout: 300,
    });
    session.attach(&connection);

    transport.push_body("<PET><RES>OK</RES><HASH>abc123</HASH></PET>");
    transport.push_body("<PET><RES>OK</RES><MSG>Request processing</MSG></PET>");
    transport.push_body("<PET><RES>OK</RES><STATUS>4</STATUS></PET>");
    let mut updates = panel.subscribe();

    connection.post(&AlarmCommand::Status).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].contains("request=EST1"));
    assert!(requests[1].contains("numinst=1234567"));
    assert!(requests[1].contains("panel=SDVFAST"));
    assert!(requests[1].contains("hash=abc123"));
    assert!(requests[2].contains("request=EST2"));

    assert_eq!(updates.try_recv().unwrap(), update(AlarmChannel::Status, "BUSY"));
    assert_eq!(updates.try_recv().unwrap(), update(AlarmChannel::Perimeter, "BUSY"));
    assert_eq!(updates.try_recv().unwrap(), update(AlarmChannel::Status, "ARMED_ALL"));
    assert_eq!(
        updates.try_recv().unwrap(),
        update(AlarmChannel::Perimeter, "ARMED_PERIMETER")
    );
    assert_eq!(panel.state(AlarmChannel::Status).as_deref(), Some("ARMED_ALL"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_installation_vetoes() {
    let (transport, connection, panel) = setup(AlarmConfig {
        installation: None,
        ..alarm_config()
    });

    match connection.post(&AlarmCommand::Status).await {
        Err(RequestError::MissingParameter(e)) => assert_eq!(e.parameter, "INSTALLATION"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(transport.request_count(), 0);
    assert!(panel.state(AlarmChannel::Status).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_status_is_unknown() {
    let (transport, connection, panel) = setup(alarm_config());
    transport.push_body("<PET><RES>KO</RES><MSG>Panel offline</MSG></PET>");

    connection.post(&AlarmCommand::Status).await.unwrap();
    assert_eq!(panel.state(AlarmChannel::Status).as_deref(), Some("UNKNOWN"));
    assert_eq!(panel.state(AlarmChannel::Perimeter).as_deref(), Some("UNKNOWN"));
}

#[tokio::test(start_paused = true)]
async fn test_installation_details() {
    let (transport, connection, panel) = setup(alarm_config());
    transport.push_body(INSTALLATION);

    connection.post(&AlarmCommand::Installation).await.unwrap();

    assert!(transport.requests()[0].contains("request=MYINSTALLATION"));
    assert_eq!(panel.state(AlarmChannel::InstallationName).as_deref(), Some("Home"));
    assert_eq!(panel.state(AlarmChannel::CodewordCoercion).as_deref(), Some("charlie"));
    assert_eq!(
        panel.state(AlarmChannel::Emails).as_deref(),
        Some("first@example.com")
    );
    assert_eq!(panel.state(AlarmChannel::Phones).as_deref(), Some("0612345678"));
    assert_eq!(panel.state(AlarmChannel::Devices).as_deref(), Some("4"));
}

#[tokio::test(start_paused = true)]
async fn test_refused_installation_is_idle() {
    let (transport, connection, panel) = setup(alarm_config());
    transport.push_body("<PET><RES>KO</RES></PET>");

    connection.post(&AlarmCommand::Installation).await.unwrap();
    assert_eq!(panel.state(AlarmChannel::InstallationName).as_deref(), Some("IDLE"));
    assert_eq!(panel.state(AlarmChannel::Devices).as_deref(), Some("IDLE"));
}

#[tokio::test(start_paused = true)]
async fn test_svr_publishes_sim() {
    let (transport, connection, panel) = setup(alarm_config());
    transport.push_body("<PET><RES>OK</RES><SIM>34600000000</SIM></PET>");

    connection.post(&AlarmCommand::Svr).await.unwrap();
    assert_eq!(panel.state(AlarmChannel::Svr).as_deref(), Some("34600000000"));
}

#[tokio::test(start_paused = true)]
async fn test_handle_command_schedules() {
    let (_transport, connection, panel) = setup(alarm_config());

    let outcome = panel
        .handle_command(AlarmChannel::Status, ChannelCommand::from("ARMED_NIGHT"))
        .unwrap();
    assert_eq!(outcome, ScheduleOutcome::Queued);

    let outcome = panel
        .handle_command(AlarmChannel::Phones, ChannelCommand::Refresh)
        .unwrap();
    assert_eq!(outcome, ScheduleOutcome::Queued);
    assert_eq!(connection.stats().queued, 2);

    assert!(matches!(
        panel.handle_command(AlarmChannel::Emails, ChannelCommand::from("x")),
        Err(AlarmError::ReadOnlyChannel(AlarmChannel::Emails))
    ));
    assert!(matches!(
        panel.handle_command(AlarmChannel::Status, ChannelCommand::from("STATUS")),
        Err(AlarmError::UnknownCommand(_))
    ));

    let outcome = panel
        .handle_command(AlarmChannel::Status, ChannelCommand::Cancel)
        .unwrap();
    assert_eq!(outcome, ScheduleOutcome::Queued);
    assert_eq!(connection.stats().queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_detached_panel() {
    let (_transport, _connection, panel) = setup(alarm_config());
    panel.detach();
    assert!(matches!(
        panel.handle_command(AlarmChannel::Status, ChannelCommand::Refresh),
        Err(AlarmError::Detached)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh() {
    let (_transport, connection, _panel) = setup(AlarmConfig {
        refresh: 1,
        ..alarm_config()
    });

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(connection.stats().queued, 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connection.stats().queued, 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let stats = connection.stats();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.coalesced_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_refresh_is_ignored() {
    let (_transport, connection, panel) = setup(AlarmConfig {
        refresh: u64::MAX,
        ..alarm_config()
    });

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(connection.stats().queued, 0);

    // Channel commands still work.
    panel
        .handle_command(AlarmChannel::Status, ChannelCommand::Refresh)
        .unwrap();
    assert_eq!(connection.stats().queued, 1);
}
