//! Alarm service configuration: how long resolved alarms are kept.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use o2ims_api::{GetHandler, GetRequest, GetResponse, UpdateHandler, UpdateRequest, UpdateResponse};
use o2ims_core::{CancellationToken, O2Error, O2Result, Object};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::records::AlarmRepository;

/// Days a resolved alarm is kept.
pub const DEFAULT_RETENTION_DAYS: u32 = 1;
pub const MIN_RETENTION_DAYS: u32 = 1;
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

const RETENTION_FIELD: &str = "retentionPeriod";
const EXTENSIONS_FIELD: &str = "extensions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    pub retention_period: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

impl Default for ServiceConfiguration {
    fn default() -> Self { Self { retention_period: DEFAULT_RETENTION_DAYS, extensions: BTreeMap::new() } }
}

fn retention_from(v: &Value) -> O2Result<u32> {
    let days = v
        .as_u64()
        .ok_or_else(|| O2Error::Validation(format!("{} must be a whole number of days", RETENTION_FIELD)))?;
    if days < u64::from(MIN_RETENTION_DAYS) {
        return Err(O2Error::Validation(format!(
            "{} must be greater than or equal to {} (day)",
            RETENTION_FIELD, MIN_RETENTION_DAYS
        )));
    }
    u32::try_from(days).map_err(|_| O2Error::Validation(format!("{} is too large", RETENTION_FIELD)))
}

fn extensions_from(v: &Value) -> O2Result<BTreeMap<String, String>> {
    let Value::Object(map) = v else {
        return Err(O2Error::Validation(format!("{} must be an object", EXTENSIONS_FIELD)));
    };
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k.clone(), s.clone())),
            other => Err(O2Error::Validation(format!(
                "extension '{}' must be a string, got {}",
                k,
                o2ims_core::json_type_name(other)
            ))),
        })
        .collect()
}

impl ServiceConfiguration {
    pub fn retention(&self) -> chrono::Duration { chrono::Duration::days(i64::from(self.retention_period)) }

    pub fn to_object(&self) -> O2Result<Object> {
        match serde_json::to_value(self).map_err(|e| O2Error::internal(e.to_string()))? {
            Value::Object(map) => Ok(map),
            _ => Err(O2Error::internal("service configuration did not serialize to an object")),
        }
    }

    /// The configuration after applying `body`. A merge keeps absent fields; a replace
    /// needs `retentionPeriod` and clears absent extensions.
    pub fn updated(&self, body: &Object, replace: bool) -> O2Result<Self> {
        let present = |field: &str| body.get(field).filter(|v| !v.is_null());
        let retention_period = match present(RETENTION_FIELD) {
            Some(v) => retention_from(v)?,
            None if replace => return Err(O2Error::Validation(format!("{} is mandatory", RETENTION_FIELD))),
            None => self.retention_period,
        };
        let extensions = match present(EXTENSIONS_FIELD) {
            Some(v) => extensions_from(v)?,
            None if replace => BTreeMap::new(),
            None => self.extensions.clone(),
        };
        Ok(Self { retention_period, extensions })
    }
}

/// Get/patch/put handler for the configuration, and the cleanup it drives.
pub struct ServiceConfigHandler {
    current: RwLock<ServiceConfiguration>,
    repo: Arc<AlarmRepository>,
}

impl ServiceConfigHandler {
    pub fn new(repo: Arc<AlarmRepository>) -> Self { Self { current: RwLock::new(ServiceConfiguration::default()), repo } }

    pub async fn current(&self) -> ServiceConfiguration { self.current.read().await.clone() }

    /// Remove resolved alarms cleared longer than the retention period before `now`.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.current().await.retention();
        let removed = self.repo.prune_resolved(cutoff).await;
        if removed > 0 {
            counter!("alarms_pruned_total", removed as u64);
            info!(removed, cutoff = %cutoff, "alarms: resolved alarms pruned");
        }
        removed
    }

    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => { me.prune(Utc::now()).await; }
                }
            }
            debug!("alarms: cleanup stopped");
        })
    }
}

#[async_trait]
impl GetHandler for ServiceConfigHandler {
    async fn get(&self, _ctx: &CancellationToken, _req: GetRequest) -> O2Result<GetResponse> {
        Ok(GetResponse { object: self.current().await.to_object()? })
    }
}

#[async_trait]
impl UpdateHandler for ServiceConfigHandler {
    async fn update(&self, _ctx: &CancellationToken, req: UpdateRequest) -> O2Result<UpdateResponse> {
        let updated = {
            let mut cur = self.current.write().await;
            let next = cur.updated(&req.object, req.replace)?;
            *cur = next.clone();
            next
        };
        info!(retention_days = updated.retention_period, "alarms: service configuration updated");
        self.prune(Utc::now()).await;
        Ok(UpdateResponse { object: updated.to_object()? })
    }
}
