//! Alarm subscriptions: persisted in a [`KvStore`], mirrored into the [`SubscriptionIndex`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use o2ims_api::{
    AddHandler, AddRequest, AddResponse, DeleteHandler, DeleteRequest, GetHandler, GetRequest, GetResponse,
    ListHandler, ListRequest, ListResponse,
};
use o2ims_core::stream::from_items;
use o2ims_core::{CancellationToken, O2Error, O2Result, Object};
use o2ims_persist::KvStore;
use o2ims_store::{SubscriptionIndex, SubscriptionInfo, FIELD_CALLBACK, FIELD_CONSUMER_ID, FIELD_FILTER};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub const SUBSCRIPTION_ID_FIELD: &str = "alarmSubscriptionId";

pub struct SubscriptionsHandler {
    store: Arc<dyn KvStore>,
    index: Arc<SubscriptionIndex>,
    /// Serializes the callback uniqueness check with the insert.
    adding: Mutex<()>,
}

fn with_id(id: &str, mut doc: Object) -> Object {
    doc.insert(SUBSCRIPTION_ID_FIELD.into(), Value::String(id.to_string()));
    doc
}

fn optional_text(object: &Object, field: &str) -> O2Result<Option<String>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(O2Error::Validation(format!(
            "'{}' must be a string, got {}",
            field,
            o2ims_core::json_type_name(other)
        ))),
    }
}

/// Reduce a request body to the persisted `{consumerSubscriptionId, filter, callback}` shape.
fn validated(object: &Object) -> O2Result<Object> {
    let callback = optional_text(object, FIELD_CALLBACK)?
        .filter(|c| !c.is_empty())
        .ok_or_else(|| O2Error::validation("callback is mandatory"))?;
    let url = Url::parse(&callback).map_err(|e| O2Error::Validation(format!("callback '{}': {}", callback, e)))?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(O2Error::Validation(format!("callback '{}' must be an absolute http(s) URL", callback)));
    }
    let mut doc = Object::new();
    if let Some(consumer) = optional_text(object, FIELD_CONSUMER_ID)? {
        doc.insert(FIELD_CONSUMER_ID.into(), Value::String(consumer));
    }
    if let Some(filter) = optional_text(object, FIELD_FILTER)? {
        o2ims_search::parse_selector(&filter)?;
        doc.insert(FIELD_FILTER.into(), Value::String(filter));
    }
    doc.insert(FIELD_CALLBACK.into(), Value::String(callback));
    Ok(doc)
}

impl SubscriptionsHandler {
    pub fn new(store: Arc<dyn KvStore>, index: Arc<SubscriptionIndex>) -> Self { Self { store, index, adding: Mutex::new(()) } }

    pub fn index(&self) -> &Arc<SubscriptionIndex> { &self.index }

    /// Rebuild the index from the store.
    pub async fn rehydrate(&self) -> O2Result<usize> {
        let started = Instant::now();
        let entries = self.store.get_all().await?;
        let skipped = self.index.replace_from_entries(&entries);
        histogram!("subscription_resync_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(count = self.index.len(), skipped, "subscriptions: resynced");
        Ok(self.index.len())
    }

    /// Rehydrate whenever the store epoch moves, until cancelled.
    pub fn spawn_resync(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        let mut rx = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() { break; }
                        if let Err(e) = me.rehydrate().await {
                            warn!(error = %e, "subscriptions: resync failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ListHandler for SubscriptionsHandler {
    async fn list(&self, _ctx: &CancellationToken, _req: ListRequest) -> O2Result<ListResponse> {
        let entries = self.store.get_all().await?;
        Ok(ListResponse::items(from_items(entries.into_iter().map(|(id, doc)| with_id(&id, doc)))))
    }
}

#[async_trait]
impl GetHandler for SubscriptionsHandler {
    async fn get(&self, _ctx: &CancellationToken, req: GetRequest) -> O2Result<GetResponse> {
        let id = req.variables.first().cloned().unwrap_or_default();
        match self.store.get(&id).await? {
            Some(doc) => Ok(GetResponse { object: with_id(&id, doc) }),
            None => Err(O2Error::NotFound(format!("subscription '{}'", id))),
        }
    }
}

#[async_trait]
impl AddHandler for SubscriptionsHandler {
    async fn add(&self, _ctx: &CancellationToken, req: AddRequest) -> O2Result<AddResponse> {
        let doc = validated(&req.object)?;
        let id = Uuid::new_v4().to_string();
        let info = SubscriptionInfo::from_object(&id, &doc)?;
        let _adding = self.adding.lock().await;
        if let Some(existing) = self.index.find_by_callback(&info.callback) {
            warn!(callback = %info.callback, existing = %existing.id, "subscription callback already in use");
            return Err(O2Error::validation("callback value must be unique"));
        }
        self.store.add(&id, &doc).await?;
        self.index.insert(info);
        info!(id = %id, "subscription added");
        Ok(AddResponse { object: with_id(&id, doc) })
    }
}

#[async_trait]
impl DeleteHandler for SubscriptionsHandler {
    async fn delete(&self, _ctx: &CancellationToken, req: DeleteRequest) -> O2Result<()> {
        let id = req.variables.first().cloned().unwrap_or_default();
        self.store.delete(&id).await?;
        if self.index.remove(&id) { info!(id = %id, "subscription deleted"); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

    #[test]
    fn validation_keeps_only_known_fields() {
        let doc = validated(&obj(json!({"callback": "https://sink/cb", "filter": "(eq,a,b)", "extra": 1}))).unwrap();
        assert_eq!(Value::Object(doc), json!({"callback": "https://sink/cb", "filter": "(eq,a,b)"}));
    }

    #[test]
    fn validation_rejects_bad_callbacks_and_filters() {
        for body in [
            json!({}),
            json!({"callback": ""}),
            json!({"callback": "/relative"}),
            json!({"callback": "ftp://sink/cb"}),
            json!({"callback": 3}),
            json!({"callback": "http://sink", "filter": "(like,a,b)"}),
            json!({"callback": "http://sink", "consumerSubscriptionId": false}),
        ] {
            assert!(matches!(validated(&obj(body.clone())), Err(O2Error::Validation(_))), "{}", body);
        }
    }
}
