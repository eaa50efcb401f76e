//! Notification fan-out: one detached task per matched subscription.
//!
//! Deliveries are at-most-once. Each task owns a clone of the HTTP client and is bounded by
//! the client timeout; nothing ties it to the request that ingested the alarm.

use std::sync::Arc;

use metrics::counter;
use o2ims_core::{O2Error, O2Result, Object};
use o2ims_store::{SubscriptionIndex, SubscriptionInfo};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::records::ALARM_ID_FIELD;

pub struct Dispatcher {
    client: reqwest::Client,
    index: Arc<SubscriptionIndex>,
    object_ref_prefix: String,
}

impl Dispatcher {
    pub fn new(index: Arc<SubscriptionIndex>, cfg: DispatcherConfig) -> O2Result<Self> {
        cfg.validate()?;
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| O2Error::internal(format!("notification client: {}", e)))?;
        Ok(Self { client, index, object_ref_prefix: cfg.object_ref_prefix })
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex> { &self.index }

    /// Body POSTed to a subscriber's callback.
    pub fn envelope(&self, sub: &SubscriptionInfo, alarm: &Object) -> Value {
        let id = alarm.get(ALARM_ID_FIELD).and_then(Value::as_str).unwrap_or_default();
        json!({
            "alarmSubscriptionId": sub.id,
            "consumerSubscriptionId": sub.consumer_subscription_id,
            "objectRef": format!("{}/{}", self.object_ref_prefix, id),
            "alarmEventRecord": alarm,
        })
    }

    /// Match `alarm` against the current index and start one delivery per hit. The
    /// returned handles may be dropped; the tasks keep running.
    pub fn notify(&self, alarm: &Object) -> Vec<JoinHandle<()>> {
        let snap = self.index.current();
        let hits = self.index.match_alarm(alarm);
        debug!(matched = hits.len(), subscriptions = snap.len(), "alarm matched");
        hits.iter()
            .filter_map(|id| snap.items.get(id))
            .map(|sub| {
                let body = self.envelope(sub, alarm);
                let client = self.client.clone();
                let callback = sub.callback.clone();
                let sub_id = sub.id.clone();
                tokio::spawn(async move { deliver(client, sub_id, callback, body).await })
            })
            .collect()
    }
}

async fn deliver(client: reqwest::Client, sub_id: String, callback: String, body: Value) {
    let outcome = client.post(&callback).json(&body).send().await.and_then(|r| r.error_for_status());
    match outcome {
        Ok(resp) => {
            counter!("notifications_sent_total", 1u64);
            info!(subscription = %sub_id, callback = %callback, status = resp.status().as_u16(), "notification sent");
        }
        Err(e) => {
            counter!("notifications_failed_total", 1u64);
            warn!(subscription = %sub_id, callback = %callback, error = %e, "notification failed");
        }
    }
}
