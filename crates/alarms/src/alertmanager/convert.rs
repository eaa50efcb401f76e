//! Alertmanager alerts to [`NewAlarm`]s, enriched through the infrastructure cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use o2ims_core::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{Alert, AlertStatus};
use crate::infrastructure::InfrastructureCache;
use crate::records::{NewAlarm, PerceivedSeverity};

pub const CLUSTER_LABEL: &str = "managed_cluster";
pub const ALERTNAME_LABEL: &str = "alertname";
pub const SEVERITY_LABEL: &str = "severity";

/// Alertmanager encodes "unset" as the year-one timestamp.
fn set(t: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> { t.filter(|t| t.year() > 1) }

/// Labels, then annotations, then `generatorURL`; later entries win.
fn extensions(alert: &Alert) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.extend(alert.labels.clone().unwrap_or_default());
    out.extend(alert.annotations.clone().unwrap_or_default());
    if let Some(url) = &alert.generator_url {
        out.insert("generatorURL".to_string(), url.clone());
    }
    out
}

fn cluster_id(labels: &BTreeMap<String, String>) -> Option<Uuid> {
    let raw = labels.get(CLUSTER_LABEL)?;
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(value = %raw, error = %e, "managed_cluster label is not a uuid");
            None
        }
    }
}

/// Convert one alert. `None` when `startsAt`, `status` or `fingerprint` is missing.
pub async fn convert_alert(ctx: &CancellationToken, alert: &Alert, infra: Option<&InfrastructureCache>) -> Option<NewAlarm> {
    let Some(raised) = set(alert.starts_at) else {
        error!(fingerprint = ?alert.fingerprint, "alert has no startsAt, skipping");
        return None;
    };
    let Some(status) = alert.status else {
        error!(fingerprint = ?alert.fingerprint, "alert has no status, skipping");
        return None;
    };
    let Some(fingerprint) = alert.fingerprint.clone() else {
        error!("alert has no fingerprint, skipping");
        return None;
    };

    let labels = alert.labels.clone().unwrap_or_default();
    let raw_severity = labels.get(SEVERITY_LABEL).cloned().unwrap_or_default();
    let severity = match status {
        AlertStatus::Resolved => PerceivedSeverity::Cleared,
        AlertStatus::Firing => PerceivedSeverity::from_label(&raw_severity),
    };

    let resource_id = cluster_id(&labels);
    let mut resource_type_id = None;
    let mut definition_id = None;
    if let (Some(cluster), Some(infra)) = (resource_id, infra) {
        match infra.get_object_type_id(ctx, cluster).await {
            Ok(t) => resource_type_id = Some(t),
            Err(e) => warn!(cluster = %cluster, error = %e, "no object type for cluster"),
        }
        if let Some(type_id) = resource_type_id {
            let name = labels.get(ALERTNAME_LABEL).map(String::as_str).unwrap_or("Unknown");
            match infra.get_alarm_definition_id(ctx, type_id, name, &raw_severity).await {
                Ok(d) => definition_id = Some(d),
                Err(e) => warn!(type_id = %type_id, name, severity = %raw_severity, error = %e, "no alarm definition"),
            }
        }
    }

    Some(NewAlarm {
        fingerprint,
        resolved: status == AlertStatus::Resolved,
        raised,
        cleared: set(alert.ends_at),
        severity,
        definition_id,
        resource_id,
        resource_type_id,
        extensions: extensions(alert),
    })
}

pub async fn convert_alerts(ctx: &CancellationToken, alerts: &[Alert], infra: Option<&InfrastructureCache>) -> Vec<NewAlarm> {
    let mut out = Vec::with_capacity(alerts.len());
    for alert in alerts {
        if let Some(a) = convert_alert(ctx, alert, infra).await { out.push(a); }
    }
    info!(alerts = alerts.len(), records = out.len(), "alerts converted");
    out
}
