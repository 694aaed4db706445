//! Forced-polling client against a mocked long-polling endpoint.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use amp_client::{Client, ClientError, TopicEvent, TransportError, TransportKind};
use amp_core::{Codec, Message, ProtocolVersion, UpdateType};
use amp_settings::ClientSettings;
use assert_matches::assert_matches;
use common::eventually;
use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn polling_settings(server: &MockServer) -> ClientSettings {
    let mut settings = ClientSettings {
        force_polling: true,
        socket_url: String::new(),
        polling_url: format!("{}/pooling", server.uri()),
        ..ClientSettings::default()
    };
    settings.polling.retry_delay_ms = 100;
    settings
}

fn pack(message: &Message) -> String {
    Codec::new(ProtocolVersion::V2).pack(message).unwrap()
}

async fn bodies(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect()
}

#[tokio::test]
async fn long_poll_delivers_and_rearms_with_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pooling"))
        .and(body_string(r#"{"t":1,"b":{"t1":0}}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string(pack(&Message::publish(
            "t1",
            5,
            UpdateType::Full,
            Some(json!({"price": 10})),
        ))))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pooling"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .with_priority(10)
        .mount(&server)
        .await;

    let client = Client::builder(polling_settings(&server)).build().unwrap();
    assert_eq!(client.transport(), TransportKind::Polling);

    let events: Arc<Mutex<Vec<TopicEvent>>> = Arc::default();
    let log = Arc::clone(&events);
    let _ = client.subscribe("t1", move |event| log.lock().push(event.clone()));

    eventually("first state", || !events.lock().is_empty()).await;
    assert_matches!(&events.lock()[0], TopicEvent::State { ts: 5, update_type: Some(UpdateType::Full), .. });
    assert_eq!(client.snapshot("t1").unwrap().to_value(), json!({"price": 10}));

    let mut rearmed = false;
    for _ in 0..100 {
        if bodies(&server).await.iter().any(|b| b == r#"{"t":1,"b":{"t1":5}}"#) {
            rearmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rearmed, "expected a re-armed poll carrying ts 5");
    client.close();
}

#[tokio::test]
async fn unsubscribe_stops_rearming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .mount(&server)
        .await;

    let client = Client::builder(polling_settings(&server)).build().unwrap();
    let id = client.subscribe("t1", |_| {});
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bodies(&server).await.len() >= 2);

    assert!(client.unsubscribe("t1", id));
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = bodies(&server).await.len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bodies(&server).await.len(), settled);
    client.close();
}

#[tokio::test]
async fn request_over_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string("{\"t\":2,\"i\":1,\"u\":\"math/add\"}\n{\"x\":1,\"y\":2}"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"t\":3,\"i\":1}\n{\"sum\":3}"))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder(polling_settings(&server)).build().unwrap();
    let reply = client.request("math/add", json!({"x": 1, "y": 2})).await.unwrap();
    assert_eq!(reply, json!({"sum": 3}));
    assert_eq!(client.pending_requests(), 0);
    client.close();
}

#[tokio::test]
async fn polling_status_error_fails_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = Client::builder(polling_settings(&server)).build().unwrap();
    let err = client.request("math/add", json!({})).await.unwrap_err();
    assert!(err.is_transport());
    assert_matches!(err, ClientError::Transport(TransportError::Http { status: 500, .. }));
    assert_eq!(client.pending_requests(), 0);
    client.close();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut settings = polling_settings(&server);
    settings.request_timeout_ms = 200;
    let client = Client::builder(settings).build().unwrap();

    let err = client.request("slow", json!(null)).await.unwrap_err();
    assert_matches!(err, ClientError::Timeout { correlation_id: 1, timeout_ms: 200 });
    assert!(err.is_transport());
    assert_eq!(client.pending_requests(), 0);
    client.close();
}

#[tokio::test]
async fn set_meta_sends_meta_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string(r#"{"t":9,"m":{"app":"demo","lang":"en"}}"#))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder(polling_settings(&server)).build().unwrap();
    let meta = BTreeMap::from([
        ("app".to_string(), "demo".to_string()),
        ("lang".to_string(), "en".to_string()),
    ]);
    client.set_meta(meta).await.unwrap();
    client.close();
}
