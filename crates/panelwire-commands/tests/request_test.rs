//! Post and poll cycle tests.
//!
//! Runs requests against a scripted transport with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use panelwire_commands::{
    Arguments, Backoff, Command, ConnectionConfig, Parameter, PollPolicy, Request, RequestError,
    RequestSettings, ScriptedTransport, TransportReply,
};

#[derive(Debug)]
enum Panel {
    Status,
    Arm,
}

impl Command for Panel {
    fn name(&self) -> &'static str {
        match self {
            Panel::Status => "STATUS",
            Panel::Arm => "ARM",
        }
    }

    fn code(&self) -> String {
        match self {
            Panel::Status => "EST".to_string(),
            Panel::Arm => "ARM1".to_string(),
        }
    }

    fn follow_up_code(&self) -> String {
        match self {
            Panel::Status => self.code(),
            Panel::Arm => "ARM2".to_string(),
        }
    }

    fn is_async(&self) -> bool {
        matches!(self, Panel::Arm)
    }
}

#[derive(Debug)]
enum Key {
    User,
}

impl Parameter for Key {
    fn name(&self) -> &'static str {
        "USER"
    }

    fn code(&self) -> &'static str {
        "user"
    }
}

fn body(result: &str) -> String {
    format!("<PET><RES>{result}</RES><MSG>message</MSG></PET>")
}

fn settings(max_attempts: u32) -> Arc<RequestSettings> {
    let policy = PollPolicy {
        interval: Duration::from_secs(3),
        max_attempts,
        backoff: Backoff::Fixed,
    };
    Arc::new(RequestSettings::new(&ConnectionConfig::default(), policy))
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

#[tokio::test(start_paused = true)]
async fn test_sync_ok_sends_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("OK"));

    let mut request = Request::new(&Panel::Status, transport.clone(), settings(10));
    let mut arguments = Arguments::new();
    arguments.set(&Key::User, "alice");
    let response = request.post(arguments).await.unwrap();

    assert!(response.success());
    assert_eq!(transport.request_count(), 1);

    let url = &transport.requests()[0];
    assert!(url.starts_with("https://mob2217.securitasdirect.es:12010/WebService/ws.do?"));
    assert_eq!(query_value(url, "request").as_deref(), Some("EST"));
    assert_eq!(query_value(url, "callby").as_deref(), Some("IPH_61"));
    assert_eq!(query_value(url, "user").as_deref(), Some("alice"));
    assert!(query_value(url, "counter").is_none());

    let token = query_value(url, "ID").unwrap();
    assert!(token.starts_with("IPH_______________alice"));
    assert_eq!(token.len(), "IPH_______________alice".len() + 17);
    assert_eq!(request.identification(), Some(token.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_async_ok_follows_up_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("OK"));
    transport.push_body("<PET><RES>OK</RES><STATUS>1</STATUS></PET>");

    let mut request = Request::new(&Panel::Arm, transport.clone(), settings(10));
    let response = request.post(Arguments::new()).await.unwrap();

    assert_eq!(response.status().unwrap(), "1");
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);

    assert_eq!(query_value(&requests[0], "request").as_deref(), Some("ARM1"));
    assert_eq!(query_value(&requests[1], "request").as_deref(), Some("ARM2"));
    assert!(query_value(&requests[1], "callby").is_none());
    assert_eq!(query_value(&requests[1], "counter").as_deref(), Some("0"));
    assert_eq!(
        query_value(&requests[0], "ID"),
        query_value(&requests[1], "ID")
    );
}

#[tokio::test(start_paused = true)]
async fn test_wait_polls_until_terminal() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("WAIT"));
    transport.push_body(body("WAIT"));
    transport.push_body(body("OK"));

    let started = tokio::time::Instant::now();
    let mut request = Request::new(&Panel::Arm, transport.clone(), settings(10));
    let response = request.post(Arguments::new()).await.unwrap();

    assert!(response.success());
    assert_eq!(request.attempt(), 2);
    assert!(started.elapsed() >= Duration::from_secs(6));

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(query_value(&requests[1], "counter").as_deref(), Some("1"));
    assert_eq!(query_value(&requests[2], "counter").as_deref(), Some("2"));
    assert_eq!(query_value(&requests[2], "request").as_deref(), Some("ARM2"));
}

#[tokio::test(start_paused = true)]
async fn test_single_attempt_budget() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("WAIT"));
    transport.push_body(body("OK"));

    let mut request = Request::new(&Panel::Status, transport.clone(), settings(1));
    let result = request.post(Arguments::new()).await;

    assert!(matches!(result, Err(RequestError::MaxAttempts(1))));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_response() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body("<PET><RES>ERROR</RES><ERR>99</ERR><MSG>Bad</MSG></PET>");

    let mut request = Request::new(&Panel::Arm, transport.clone(), settings(10));
    match request.post(Arguments::new()).await {
        Err(RequestError::ErrorResponse { code, message }) => {
            assert_eq!(code, "99");
            assert_eq!(message, "Bad");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_http_status_failure() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_reply(TransportReply {
        status: 503,
        body: String::new(),
    });

    let mut request = Request::new(&Panel::Status, transport.clone(), settings(10));
    let result = request.post(Arguments::new()).await;
    assert!(matches!(result, Err(RequestError::HttpStatus(503))));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_result_is_returned() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("MAYBE"));

    let mut request = Request::new(&Panel::Arm, transport.clone(), settings(10));
    let response = request.post(Arguments::new()).await.unwrap();
    assert_eq!(response.result().unwrap(), "MAYBE");
    assert!(!response.success());
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_pause() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("WAIT"));
    transport.push_body(body("OK"));

    let mut request = Request::new(&Panel::Arm, transport.clone(), settings(10));
    let interrupter = request.interrupter();

    let (result, _) = tokio::join!(request.post(Arguments::new()), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        interrupter.interrupt();
    });

    assert!(matches!(result, Err(RequestError::Interrupted)));
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.pending_replies(), 1);
}

#[tokio::test]
async fn test_fresh_token_per_submission() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_body(body("OK"));
    transport.push_body(body("OK"));

    let mut request = Request::new(&Panel::Status, transport.clone(), settings(10));
    request.post(Arguments::new()).await.unwrap();
    let first_index = request.index();
    std::thread::sleep(Duration::from_millis(5));
    request.post(Arguments::new()).await.unwrap();

    let requests = transport.requests();
    assert_ne!(
        query_value(&requests[0], "ID"),
        query_value(&requests[1], "ID")
    );
    assert!(request.index() > first_index);
}
