use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use o2ims_alarms::{AlarmsServer, ServerOptions};
use o2ims_persist::{KvStore, MemoryStore};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE: &str = "/o2ims-infrastructureMonitoring/v1";

async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, body)
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_request(verb: &str, uri: &str, content_type: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(verb)
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_patch(uri: &str, body: Value) -> Request<Body> { json_request("PATCH", uri, "application/merge-patch+json", body) }

fn get(uri: &str) -> Request<Body> { Request::builder().uri(uri).body(Body::empty()).unwrap() }

fn webhook(status: &str, severity: &str) -> Value {
    json!({
        "receiver": "oran_alarm_receiver",
        "status": status,
        "alerts": [{
            "status": status,
            "labels": {"alertname": "NodeDown", "severity": severity, "instance": "my-host"},
            "annotations": {"summary": "node is down"},
            "startsAt": "2025-01-01T10:00:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "fingerprint": "fp-1"
        }],
        "version": "4"
    })
}

async fn wait_for_requests(server: &MockServer, n: usize) -> Vec<wiremock::Request> {
    for _ in 0..100 {
        let got = server.received_requests().await.unwrap_or_default();
        if got.len() >= n { return got; }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

#[tokio::test]
async fn health_is_ok() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let resp = server.router().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()[..], b"ok");
}

#[tokio::test]
async fn subscription_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let server = AlarmsServer::new(store.clone(), ServerOptions::default()).unwrap();
    let app = server.router();
    let subs = format!("{}/alarmSubscriptions", BASE);

    let (status, created) = call(
        app.clone(),
        json_post(&subs, json!({"callback": "https://smo.example.com/cb", "consumerSubscriptionId": "c-1", "filter": "(eq,perceivedSeverity,CRITICAL)"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["alarmSubscriptionId"].as_str().unwrap().to_string();
    assert_eq!(created["consumerSubscriptionId"], "c-1");
    assert!(store.get(&id).await.unwrap().is_some());
    assert!(server.subscriptions.index().get(&id).is_some());

    let (status, list) = call(app.clone(), get(&subs)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, one) = call(app.clone(), get(&format!("{}/{}?fields=callback", subs, id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one, json!({"callback": "https://smo.example.com/cb"}));

    let del = Request::builder().method("DELETE").uri(format!("{}/{}", subs, id)).body(Body::empty()).unwrap();
    assert_eq!(call(app.clone(), del).await.0, StatusCode::NO_CONTENT);
    assert!(server.subscriptions.index().is_empty());
    let del_again = Request::builder().method("DELETE").uri(format!("{}/{}", subs, id)).body(Body::empty()).unwrap();
    assert_eq!(call(app.clone(), del_again).await.0, StatusCode::NO_CONTENT);

    let (status, body) = call(app.clone(), get(&format!("{}/{}", subs, id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn invalid_subscriptions_are_rejected() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let subs = format!("{}/alarmSubscriptions", BASE);
    for body in [json!({"filter": "(eq,a,b)"}), json!({"callback": "not a url"}), json!({"callback": "http://x", "filter": "(eq,a"})] {
        let (status, problem) = call(server.router(), json_post(&subs, body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(problem["status"], 400);
    }
    assert!(server.subscriptions.index().is_empty());
}

#[tokio::test]
async fn webhook_alert_is_recorded_and_notified() {
    let sink = MockServer::start().await;
    Mock::given(method("POST")).and(path("/critical")).respond_with(ResponseTemplate::new(200)).mount(&sink).await;
    Mock::given(method("POST")).and(path("/minor")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&sink).await;

    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let app = server.router();
    let subs = format!("{}/alarmSubscriptions", BASE);
    for (name, severity) in [("critical", "CRITICAL"), ("minor", "MINOR")] {
        let body = json!({"callback": format!("{}/{}", sink.uri(), name), "filter": format!("(eq,perceivedSeverity,{})", severity)});
        assert_eq!(call(app.clone(), json_post(&subs, body)).await.0, StatusCode::OK);
    }

    let (status, _) = call(app.clone(), json_post("/internal/v1/caas-alerts/alertmanager", webhook("firing", "critical"))).await;
    assert_eq!(status, StatusCode::OK);

    let received = wait_for_requests(&sink, 1).await;
    assert_eq!(received.len(), 1);
    let envelope: Value = received[0].body_json().unwrap();
    assert_eq!(envelope["alarmEventRecord"]["perceivedSeverity"], "CRITICAL");
    assert_eq!(envelope["alarmEventRecord"]["extensions"]["summary"], "node is down");

    let (status, alarms) = call(app.clone(), get(&format!("{}/alarms?filter=(eq,extensions/instance,my-host)", BASE))).await;
    assert_eq!(status, StatusCode::OK);
    let alarms = alarms.as_array().unwrap().clone();
    assert_eq!(alarms.len(), 1);
    let id = alarms[0]["alarmEventRecordId"].as_str().unwrap();

    let (status, one) = call(app.clone(), get(&format!("{}/alarms/{}", BASE, id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["alarmRaisedTime"], "2025-01-01T10:00:00Z");

    // Same alert again: nothing changed, nothing sent.
    call(app.clone(), json_post("/internal/v1/caas-alerts/alertmanager", webhook("firing", "critical"))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.received_requests().await.unwrap().len(), 1);

    let (status, _) = call(app.clone(), get(&format!("{}/alarms/{}", BASE, uuid_like()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_webhook_payload_is_400() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let (status, body) = call(server.router(), json_post("/internal/v1/caas-alerts/alertmanager", json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Failed to decode input");
}

#[tokio::test]
async fn out_of_band_store_edits_reach_the_index() {
    let store = Arc::new(MemoryStore::new());
    let server = AlarmsServer::new(store.clone(), ServerOptions::default()).unwrap();
    let cancel = o2ims_core::CancellationToken::new();
    let task = server.subscriptions.spawn_resync(cancel.clone());

    let doc = json!({"callback": "http://smo/cb", "filter": "(eq,resourceID,my-host)"});
    store.add("external-1", doc.as_object().unwrap()).await.unwrap();
    for _ in 0..100 {
        if server.subscriptions.index().get("external-1").is_some() { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.subscriptions.index().get("external-1").is_some());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn callbacks_must_be_unique() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let subs = format!("{}/alarmSubscriptions", BASE);
    let body = json!({"callback": "https://smo.example.com/cb"});
    assert_eq!(call(server.router(), json_post(&subs, body.clone())).await.0, StatusCode::OK);

    let (status, problem) = call(server.router(), json_post(&subs, json!({"callback": "https://smo.example.com/cb", "filter": "(eq,perceivedSeverity,MAJOR)"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(problem["detail"].as_str().unwrap().contains("callback value must be unique"), "{}", problem);
    assert_eq!(server.subscriptions.index().len(), 1);

    assert_eq!(call(server.router(), json_post(&subs, json!({"callback": "https://smo.example.com/other"}))).await.0, StatusCode::OK);
}

#[tokio::test]
async fn alarms_are_acknowledged_once() {
    let sink = MockServer::start().await;
    Mock::given(method("POST")).and(path("/cb")).respond_with(ResponseTemplate::new(200)).mount(&sink).await;

    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let app = server.router();
    let subs = format!("{}/alarmSubscriptions", BASE);
    assert_eq!(call(app.clone(), json_post(&subs, json!({"callback": format!("{}/cb", sink.uri())}))).await.0, StatusCode::OK);
    call(app.clone(), json_post("/internal/v1/caas-alerts/alertmanager", webhook("firing", "major"))).await;
    wait_for_requests(&sink, 1).await;

    let (_, alarms) = call(app.clone(), get(&format!("{}/alarms", BASE))).await;
    let id = alarms[0]["alarmEventRecordId"].as_str().unwrap().to_string();
    let one = format!("{}/alarms/{}", BASE, id);

    for bad in [json!({}), json!({"alarmAcknowledged": false}), json!({"alarmAcknowledged": true, "perceivedSeverity": "CLEARED"}), json!({"perceivedSeverity": "MAJOR"})] {
        let (status, _) = call(app.clone(), json_patch(&one, bad.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", bad);
    }
    let (status, _) = call(app.clone(), json_patch(&one, json!({"perceivedSeverity": "CLEARED"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let put = json_request("PUT", &one, "application/json", json!({"alarmAcknowledged": true}));
    assert_eq!(call(app.clone(), put).await.0, StatusCode::BAD_REQUEST);

    let (status, body) = call(app.clone(), json_patch(&one, json!({"alarmAcknowledged": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"alarmAcknowledged": true}));

    let (_, record) = call(app.clone(), get(&one)).await;
    assert_eq!(record["alarmAcknowledged"], true);
    assert!(record["alarmAcknowledgedTime"].is_string());
    let received = wait_for_requests(&sink, 2).await;
    assert_eq!(received.len(), 2);

    let (status, problem) = call(app.clone(), json_patch(&one, json!({"alarmAcknowledged": true}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["status"], 409);

    let (status, _) = call(app.clone(), json_patch(&format!("{}/alarms/{}", BASE, uuid_like()), json!({"alarmAcknowledged": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn service_configuration_is_patched_and_replaced() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let cfg = format!("{}/alarmServiceConfiguration", BASE);

    let (status, body) = call(server.router(), get(&cfg)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"retentionPeriod": 1}));

    let (status, body) = call(server.router(), json_patch(&cfg, json!({"extensions": {"team": "ran"}}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"retentionPeriod": 1, "extensions": {"team": "ran"}}));

    let (status, _) = call(server.router(), json_patch(&cfg, json!({"retentionPeriod": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let put = json_request("PUT", &cfg, "application/json", json!({"retentionPeriod": 5}));
    let (status, body) = call(server.router(), put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"retentionPeriod": 5}));
    assert_eq!(server.service_config.current().await.retention_period, 5);

    let put = json_request("PUT", &cfg, "application/json", json!({"extensions": {}}));
    assert_eq!(call(server.router(), put).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_versions_are_listed() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let want = json!({"uriPrefix": BASE, "apiVersions": [{"version": "1.0.0"}]});
    for uri in ["/o2ims-infrastructureMonitoring/api_versions", "/o2ims-infrastructureMonitoring/v1/api_versions"] {
        let (status, body) = call(server.router(), get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, want);
    }
}

#[tokio::test]
async fn resolved_alarms_are_pruned_after_retention() {
    let server = AlarmsServer::new(Arc::new(MemoryStore::new()), ServerOptions::default()).unwrap();
    let app = server.router();
    call(app.clone(), json_post("/internal/v1/caas-alerts/alertmanager", webhook("firing", "major"))).await;
    let mut resolved = webhook("resolved", "major");
    resolved["alerts"][0]["endsAt"] = json!("2025-01-01T11:00:00Z");
    call(app.clone(), json_post("/internal/v1/caas-alerts/alertmanager", resolved)).await;
    assert_eq!(server.repository.len().await, 1);

    let cutoff_day = chrono::DateTime::parse_from_rfc3339("2025-01-02T10:59:00Z").unwrap().with_timezone(&chrono::Utc);
    assert_eq!(server.service_config.prune(cutoff_day).await, 0);
    assert_eq!(server.service_config.prune(cutoff_day + chrono::Duration::minutes(2)).await, 1);
    assert_eq!(server.repository.len().await, 0);
}

fn uuid_like() -> &'static str { "00000000-0000-4000-8000-000000000000" }
