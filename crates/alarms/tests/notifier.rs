use std::sync::Arc;
use std::time::Duration;

use o2ims_alarms::{Dispatcher, DispatcherConfig};
use o2ims_core::Object;
use o2ims_store::{SubscriptionIndex, SubscriptionInfo};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

fn sub(id: &str, callback: String, filter: Option<&str>) -> SubscriptionInfo {
    let mut doc = obj(json!({"callback": callback, "consumerSubscriptionId": format!("consumer-{}", id)}));
    if let Some(f) = filter { doc.insert("filter".into(), json!(f)); }
    SubscriptionInfo::from_object(id, &doc).unwrap()
}

fn alarm() -> Object {
    obj(json!({
        "alarmEventRecordId": "0b7f2a7e-0000-4000-8000-000000000001",
        "resourceID": "my-host",
        "perceivedSeverity": "CRITICAL",
    }))
}

#[tokio::test]
async fn matched_subscriptions_receive_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/hit")).respond_with(ResponseTemplate::new(204)).expect(1).mount(&server).await;
    Mock::given(method("POST")).and(path("/miss")).respond_with(ResponseTemplate::new(204)).expect(0).mount(&server).await;

    let index = Arc::new(SubscriptionIndex::new());
    index.insert(sub("hit", format!("{}/hit", server.uri()), Some("(eq,resourceID,my-host)")));
    index.insert(sub("miss", format!("{}/miss", server.uri()), Some("(eq,resourceID,other-host)")));
    let dispatcher = Dispatcher::new(index, DispatcherConfig::default()).unwrap();

    let handles = dispatcher.notify(&alarm());
    assert_eq!(handles.len(), 1);
    for h in handles { h.await.unwrap(); }

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: Value = received[0].body_json().unwrap();
    assert_eq!(body["alarmSubscriptionId"], "hit");
    assert_eq!(body["consumerSubscriptionId"], "consumer-hit");
    assert_eq!(
        body["objectRef"],
        "/o2ims-infrastructureMonitoring/v1/alarms/0b7f2a7e-0000-4000-8000-000000000001"
    );
    assert_eq!(body["alarmEventRecord"], Value::Object(alarm()));
}

#[tokio::test]
async fn failing_or_slow_callbacks_do_not_affect_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/ok")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
    Mock::given(method("POST")).and(path("/broken")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let index = Arc::new(SubscriptionIndex::new());
    for name in ["ok", "broken", "slow"] {
        index.insert(sub(name, format!("{}/{}", server.uri(), name), None));
    }
    let cfg = DispatcherConfig { timeout: Duration::from_millis(200), ..Default::default() };
    let dispatcher = Dispatcher::new(index, cfg).unwrap();

    let started = std::time::Instant::now();
    let handles = dispatcher.notify(&alarm());
    assert_eq!(handles.len(), 3);
    for h in handles { h.await.unwrap(); }
    assert!(started.elapsed() < Duration::from_secs(3), "slow callback must be cut by the timeout");

    let paths: Vec<String> = server.received_requests().await.unwrap().iter().map(|r| r.url.path().to_string()).collect();
    assert!(paths.contains(&"/ok".to_string()));
    assert!(paths.contains(&"/broken".to_string()));
}

#[tokio::test]
async fn unreachable_callback_is_dropped_quietly() {
    let index = Arc::new(SubscriptionIndex::new());
    index.insert(sub("gone", "http://127.0.0.1:9/cb".into(), None));
    let dispatcher = Dispatcher::new(index, DispatcherConfig::default()).unwrap();
    for h in dispatcher.notify(&alarm()) { h.await.unwrap(); }
}
