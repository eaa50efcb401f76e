//! Alarm event records: the canonical alarm shape, an in-memory repository keyed by
//! Alertmanager fingerprint, and the list/get handler behind the `alarms` collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use o2ims_api::{
    GetHandler, GetRequest, GetResponse, ListHandler, ListRequest, ListResponse, UpdateHandler, UpdateRequest,
    UpdateResponse,
};
use o2ims_core::stream::from_items;
use o2ims_core::{CancellationToken, O2Error, O2Result, Object};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::notifier::Dispatcher;

pub const ALARM_ID_FIELD: &str = "alarmEventRecordId";
pub const ACKNOWLEDGED_FIELD: &str = "alarmAcknowledged";
pub const PERCEIVED_SEVERITY_FIELD: &str = "perceivedSeverity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PerceivedSeverity {
    Critical,
    Major,
    Minor,
    Warning,
    Indeterminate,
    Cleared,
}

impl PerceivedSeverity {
    /// Map an Alertmanager `severity` label.
    pub fn from_label(label: &str) -> Self {
        match label {
            "cleared" => Self::Cleared,
            "critical" => Self::Critical,
            "major" => Self::Major,
            "minor" | "low" => Self::Minor,
            "warning" | "info" => Self::Warning,
            _ => Self::Indeterminate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEventRecord {
    pub alarm_event_record_id: Uuid,
    #[serde(rename = "alarmDefinitionID", default, skip_serializing_if = "Option::is_none")]
    pub alarm_definition_id: Option<Uuid>,
    #[serde(rename = "probableCauseID", default, skip_serializing_if = "Option::is_none")]
    pub probable_cause_id: Option<Uuid>,
    pub alarm_raised_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_changed_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_cleared_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_acknowledged_time: Option<DateTime<Utc>>,
    pub alarm_acknowledged: bool,
    pub perceived_severity: PerceivedSeverity,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    #[serde(rename = "resourceID", default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<Uuid>,
    #[serde(rename = "resourceTypeID", default, skip_serializing_if = "Option::is_none")]
    pub resource_type_id: Option<Uuid>,
}

impl AlarmEventRecord {
    pub fn to_object(&self) -> O2Result<Object> {
        match serde_json::to_value(self).map_err(|e| O2Error::internal(e.to_string()))? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(O2Error::internal("alarm record did not serialize to an object")),
        }
    }
}

/// An alarm as produced by the converter, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlarm {
    pub fingerprint: String,
    pub resolved: bool,
    pub raised: DateTime<Utc>,
    pub cleared: Option<DateTime<Utc>>,
    pub severity: PerceivedSeverity,
    pub definition_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub resource_type_id: Option<Uuid>,
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Stored {
    record: AlarmEventRecord,
    resolved: bool,
    generation: i64,
}

impl Stored {
    fn differs(&self, alarm: &NewAlarm) -> bool {
        let r = &self.record;
        self.resolved != alarm.resolved
            || r.perceived_severity != alarm.severity
            || r.alarm_cleared_time != alarm.cleared
            || r.alarm_definition_id != alarm.definition_id
            || r.resource_id != alarm.resource_id
            || r.resource_type_id != alarm.resource_type_id
            || r.extensions != alarm.extensions
    }
}

/// Alarm records keyed by fingerprint.
#[derive(Default)]
pub struct AlarmRepository {
    inner: RwLock<FxHashMap<String, Stored>>,
}

impl AlarmRepository {
    pub fn new() -> Self { Self::default() }

    pub async fn len(&self) -> usize { self.inner.read().await.len() }

    /// Insert or update each alarm, stamping `generation`. Returns the records that are
    /// new or whose content changed.
    pub async fn upsert(&self, alarms: Vec<NewAlarm>, generation: i64, now: DateTime<Utc>) -> Vec<AlarmEventRecord> {
        let mut map = self.inner.write().await;
        let mut changed = Vec::new();
        for alarm in alarms {
            match map.get_mut(&alarm.fingerprint) {
                Some(stored) => {
                    stored.generation = generation;
                    if !stored.differs(&alarm) { continue; }
                    let r = &mut stored.record;
                    r.alarm_raised_time = alarm.raised;
                    r.alarm_changed_time = Some(now);
                    r.alarm_cleared_time = alarm.cleared;
                    r.perceived_severity = alarm.severity;
                    r.alarm_definition_id = alarm.definition_id;
                    r.resource_id = alarm.resource_id;
                    r.resource_type_id = alarm.resource_type_id;
                    r.extensions = alarm.extensions;
                    stored.resolved = alarm.resolved;
                    changed.push(stored.record.clone());
                }
                None => {
                    let record = AlarmEventRecord {
                        alarm_event_record_id: Uuid::new_v4(),
                        alarm_definition_id: alarm.definition_id,
                        probable_cause_id: None,
                        alarm_raised_time: alarm.raised,
                        alarm_changed_time: Some(now),
                        alarm_cleared_time: alarm.cleared,
                        alarm_acknowledged_time: None,
                        alarm_acknowledged: false,
                        perceived_severity: alarm.severity,
                        extensions: alarm.extensions,
                        resource_id: alarm.resource_id,
                        resource_type_id: alarm.resource_type_id,
                    };
                    debug!(fingerprint = %alarm.fingerprint, id = %record.alarm_event_record_id, "alarm recorded");
                    changed.push(record.clone());
                    map.insert(alarm.fingerprint, Stored { record, resolved: alarm.resolved, generation });
                }
            }
        }
        changed
    }

    /// Resolve every unresolved record stamped before `generation`.
    pub async fn resolve_stale(&self, generation: i64, now: DateTime<Utc>) -> Vec<AlarmEventRecord> {
        let mut map = self.inner.write().await;
        let mut changed = Vec::new();
        for stored in map.values_mut().filter(|s| !s.resolved && s.generation < generation) {
            stored.resolved = true;
            let r = &mut stored.record;
            r.perceived_severity = PerceivedSeverity::Cleared;
            r.alarm_cleared_time = Some(now);
            r.alarm_changed_time = Some(now);
            changed.push(r.clone());
        }
        changed
    }

    /// Every record, oldest raised first.
    pub async fn list(&self) -> Vec<AlarmEventRecord> {
        let mut out: Vec<_> = self.inner.read().await.values().map(|s| s.record.clone()).collect();
        out.sort_by(|a, b| {
            a.alarm_raised_time.cmp(&b.alarm_raised_time).then(a.alarm_event_record_id.cmp(&b.alarm_event_record_id))
        });
        out
    }

    pub async fn get(&self, id: &Uuid) -> Option<AlarmEventRecord> {
        self.inner.read().await.values().find(|s| &s.record.alarm_event_record_id == id).map(|s| s.record.clone())
    }

    /// Mark a record acknowledged. Acknowledging twice is a conflict.
    pub async fn acknowledge(&self, id: &Uuid, now: DateTime<Utc>) -> O2Result<AlarmEventRecord> {
        let mut map = self.inner.write().await;
        let stored = map
            .values_mut()
            .find(|s| &s.record.alarm_event_record_id == id)
            .ok_or_else(|| O2Error::NotFound(format!("alarm '{}'", id)))?;
        let r = &mut stored.record;
        if r.alarm_acknowledged { return Err(O2Error::conflict("Alarm record is already acknowledged")); }
        r.alarm_acknowledged = true;
        r.alarm_acknowledged_time = Some(now);
        r.alarm_changed_time = Some(now);
        Ok(r.clone())
    }

    /// Drop resolved records cleared before `cutoff`. Returns how many went.
    pub async fn prune_resolved(&self, cutoff: DateTime<Utc>) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, s| !(s.resolved && s.record.alarm_cleared_time.map_or(false, |t| t < cutoff)));
        before - map.len()
    }
}

/// List/get/patch handler over the repository. Acknowledgements are notified like any
/// other change.
pub struct AlarmsHandler {
    repo: Arc<AlarmRepository>,
    dispatcher: Arc<Dispatcher>,
}

impl AlarmsHandler {
    pub fn new(repo: Arc<AlarmRepository>, dispatcher: Arc<Dispatcher>) -> Self { Self { repo, dispatcher } }
}

fn alarm_id(variables: &[String]) -> O2Result<Uuid> {
    let raw = variables.first().map(String::as_str).unwrap_or_default();
    Uuid::parse_str(raw).map_err(|_| O2Error::Validation(format!("'{}' is not a valid alarm id", raw)))
}

#[async_trait]
impl ListHandler for AlarmsHandler {
    async fn list(&self, _ctx: &CancellationToken, _req: ListRequest) -> O2Result<ListResponse> {
        let items = self.repo.list().await.iter().map(AlarmEventRecord::to_object).collect::<O2Result<Vec<_>>>()?;
        Ok(ListResponse::items(from_items(items)))
    }
}

#[async_trait]
impl GetHandler for AlarmsHandler {
    async fn get(&self, _ctx: &CancellationToken, req: GetRequest) -> O2Result<GetResponse> {
        let id = alarm_id(&req.variables)?;
        let record = self.repo.get(&id).await.ok_or_else(|| O2Error::NotFound(format!("alarm '{}'", id)))?;
        Ok(GetResponse { object: record.to_object()? })
    }
}

#[async_trait]
impl UpdateHandler for AlarmsHandler {
    async fn update(&self, _ctx: &CancellationToken, req: UpdateRequest) -> O2Result<UpdateResponse> {
        let id = alarm_id(&req.variables)?;
        if req.replace { return Err(O2Error::validation("alarm event records can only be patched")); }
        if self.repo.get(&id).await.is_none() { return Err(O2Error::NotFound(format!("alarm '{}'", id))); }

        let ack = req.object.get(ACKNOWLEDGED_FIELD).filter(|v| !v.is_null());
        let severity = req.object.get(PERCEIVED_SEVERITY_FIELD).filter(|v| !v.is_null());
        match (ack, severity) {
            (None, None) => Err(O2Error::validation("at least one field is required to patch")),
            (Some(_), Some(_)) => Err(O2Error::validation(
                "either alarmAcknowledged or perceivedSeverity shall be included in a request message content, but not both",
            )),
            (None, Some(sev)) => {
                if sev.as_str() != Some("CLEARED") {
                    return Err(O2Error::validation("only the value CLEARED is permitted in the perceivedSeverity field"));
                }
                // Every alarm raised from Alertmanager clears automatically.
                Err(O2Error::conflict("cannot clear an alarm with clearing type other than MANUAL"))
            }
            (Some(ack), None) => {
                if ack.as_bool() != Some(true) {
                    return Err(O2Error::validation("alarmAcknowledged field is expected to be true"));
                }
                let record = self.repo.acknowledge(&id, Utc::now()).await?;
                info!(id = %id, "alarm acknowledged");
                self.dispatcher.notify(&record.to_object()?);
                let mut object = Object::new();
                object.insert(ACKNOWLEDGED_FIELD.into(), serde_json::Value::Bool(true));
                Ok(UpdateResponse { object })
            }
        }
    }
}
