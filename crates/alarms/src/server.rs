//! HTTP surface: alarm and subscription collections, service configuration, API versions,
//! the Alertmanager webhook, health.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use o2ims_api::{problem, Adapter, AdapterConfig};
use o2ims_core::{CancellationToken, O2Result};
use o2ims_persist::KvStore;
use o2ims_store::SubscriptionIndex;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::alertmanager::WebhookNotification;
use crate::config::{DispatcherConfig, API_PREFIX, API_ROOT, API_VERSION, WEBHOOK_PATH};
use crate::infrastructure::InfrastructureCache;
use crate::ingest::{AlarmPipeline, Source};
use crate::notifier::Dispatcher;
use crate::records::{AlarmRepository, AlarmsHandler};
use crate::service_config::ServiceConfigHandler;
use crate::subscriptions::SubscriptionsHandler;

/// Options the server is assembled from.
#[derive(Default)]
pub struct ServerOptions {
    pub dispatcher: DispatcherConfig,
    pub external_address: Option<String>,
    pub infrastructure: Option<Arc<InfrastructureCache>>,
}

/// The wired-up alarm service, shared by the router and the background tasks.
pub struct AlarmsServer {
    pub repository: Arc<AlarmRepository>,
    pub subscriptions: Arc<SubscriptionsHandler>,
    pub pipeline: Arc<AlarmPipeline>,
    pub service_config: Arc<ServiceConfigHandler>,
    alarms_adapter: Arc<Adapter>,
    subscriptions_adapter: Arc<Adapter>,
    service_config_adapter: Arc<Adapter>,
}

impl AlarmsServer {
    pub fn new(store: Arc<dyn KvStore>, opts: ServerOptions) -> O2Result<Self> {
        let index = Arc::new(SubscriptionIndex::new());
        let repository = Arc::new(AlarmRepository::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&index), opts.dispatcher)?);
        let pipeline = Arc::new(AlarmPipeline::new(Arc::clone(&repository), Arc::clone(&dispatcher), opts.infrastructure));
        let subscriptions = Arc::new(SubscriptionsHandler::new(store, index));
        let service_config = Arc::new(ServiceConfigHandler::new(Arc::clone(&repository)));

        let alarms = Arc::new(AlarmsHandler::new(Arc::clone(&repository), dispatcher));
        let alarms_adapter = Arc::new(Adapter::new(AdapterConfig {
            path_variables: vec!["alarmEventRecordId".into()],
            list: Some(alarms.clone()),
            get: Some(alarms.clone()),
            update: Some(alarms),
            external_address: opts.external_address.clone(),
            ..Default::default()
        })?);
        let subscriptions_adapter = Arc::new(Adapter::new(AdapterConfig {
            path_variables: vec!["alarmSubscriptionId".into()],
            list: Some(subscriptions.clone()),
            get: Some(subscriptions.clone()),
            add: Some(subscriptions.clone()),
            delete: Some(subscriptions.clone()),
            external_address: opts.external_address.clone(),
            ..Default::default()
        })?);
        let service_config_adapter = Arc::new(Adapter::new(AdapterConfig {
            get: Some(service_config.clone()),
            update: Some(service_config.clone()),
            external_address: opts.external_address,
            ..Default::default()
        })?);
        Ok(Self {
            repository,
            subscriptions,
            pipeline,
            service_config,
            alarms_adapter,
            subscriptions_adapter,
            service_config_adapter,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&format!("{}/alarms", API_PREFIX), self.alarms_adapter.method_router())
            .route(&format!("{}/alarms/{{alarmEventRecordId}}", API_PREFIX), self.alarms_adapter.method_router())
            .route(&format!("{}/alarmSubscriptions", API_PREFIX), self.subscriptions_adapter.method_router())
            .route(
                &format!("{}/alarmSubscriptions/{{alarmSubscriptionId}}", API_PREFIX),
                self.subscriptions_adapter.method_router(),
            )
            .route(&format!("{}/alarmServiceConfiguration", API_PREFIX), self.service_config_adapter.method_router())
            .route(&format!("{}/api_versions", API_ROOT), get(api_versions))
            .route(&format!("{}/api_versions", API_PREFIX), get(api_versions))
            .route(WEBHOOK_PATH, post(webhook))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(Arc::clone(&self.pipeline))
            .layer(TraceLayer::new_for_http())
    }
}

// Only v1 exists, so the root and versioned listings agree.
async fn api_versions() -> Json<Value> {
    Json(json!({ "uriPrefix": API_PREFIX, "apiVersions": [{ "version": API_VERSION }] }))
}

async fn webhook(State(pipeline): State<Arc<AlarmPipeline>>, body: Bytes) -> Response {
    let notification: WebhookNotification = match serde_json::from_slice(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "alertmanager webhook: bad payload");
            return problem(StatusCode::BAD_REQUEST, "Failed to decode input");
        }
    };
    // Ingestion is not tied to the Alertmanager connection.
    let ctx = CancellationToken::new();
    match pipeline.handle_alerts(&ctx, &notification.alerts, Source::Webhook).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, "alertmanager webhook: handling failed");
            problem(StatusCode::INTERNAL_SERVER_ERROR, "Failed to handle alerts")
        }
    }
}
