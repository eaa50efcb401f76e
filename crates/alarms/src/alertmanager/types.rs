//! Alertmanager payloads: the webhook alert-group notification and `/api/v2/alerts` items.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One alert of a webhook notification. Everything is optional on the wire; the converter
/// decides what is mandatory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL", default)]
    pub generator_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub status: Option<AlertStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub status: Option<AlertStatus>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub group_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
    #[serde(rename = "externalURL", default)]
    pub external_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub group_key: String,
    #[serde(default)]
    pub truncated_alerts: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlertState {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub silenced_by: Vec<String>,
    #[serde(default)]
    pub inhibited_by: Vec<String>,
}

/// Item of `GET /api/v2/alerts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlert {
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL", default)]
    pub generator_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub status: Option<ApiAlertState>,
}

impl ApiAlert {
    /// Webhook view: resolved with `endsAt` kept once `endsAt` has passed, firing otherwise.
    pub fn into_webhook(self, now: DateTime<Utc>) -> Alert {
        let (status, ends_at) = match self.ends_at {
            Some(end) if now > end => (AlertStatus::Resolved, Some(end)),
            _ => (AlertStatus::Firing, None),
        };
        Alert {
            annotations: self.annotations,
            labels: self.labels,
            starts_at: self.starts_at,
            ends_at,
            generator_url: self.generator_url,
            fingerprint: self.fingerprint,
            status: Some(status),
        }
    }
}

pub fn api_alerts_to_webhook(alerts: Vec<ApiAlert>, now: DateTime<Utc>) -> Vec<Alert> {
    alerts.into_iter().map(|a| a.into_webhook(now)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn webhook_payload_decodes() {
        let raw = r#"{
            "receiver": "oran_alarm_receiver",
            "status": "firing",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "NodeDown", "severity": "critical"},
                "annotations": {"summary": "node down"},
                "startsAt": "2025-01-01T10:00:00Z",
                "endsAt": "0001-01-01T00:00:00Z",
                "generatorURL": "http://prom/graph",
                "fingerprint": "abc"
            }],
            "groupLabels": {},
            "commonLabels": {"alertname": "NodeDown"},
            "commonAnnotations": {},
            "externalURL": "http://am",
            "version": "4",
            "groupKey": "{}:{}"
        }"#;
        let n: WebhookNotification = serde_json::from_str(raw).unwrap();
        assert_eq!(n.alerts.len(), 1);
        assert_eq!(n.alerts[0].status, Some(AlertStatus::Firing));
        assert_eq!(n.alerts[0].generator_url.as_deref(), Some("http://prom/graph"));
        assert_eq!(n.version, "4");
    }

    #[test]
    fn api_alerts_resolve_once_ended() {
        let now = Utc::now();
        let ended = ApiAlert { ends_at: Some(now - Duration::minutes(1)), ..Default::default() }.into_webhook(now);
        assert_eq!(ended.status, Some(AlertStatus::Resolved));
        assert!(ended.ends_at.is_some());

        let active = ApiAlert { ends_at: Some(now + Duration::minutes(5)), ..Default::default() }.into_webhook(now);
        assert_eq!(active.status, Some(AlertStatus::Firing));
        assert!(active.ends_at.is_none());
    }
}
