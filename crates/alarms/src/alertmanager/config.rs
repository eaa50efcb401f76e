//! Merge the ORAN receiver and route into an existing Alertmanager configuration.
//!
//! The merge is idempotent: earlier ORAN receivers and routes are dropped before the fresh
//! ones are prepended, so applying it twice yields the same document.

use o2ims_core::{O2Error, O2Result};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::config::{AlertmanagerConfig, DEFAULT_CA_FILE, DEFAULT_TOKEN_FILE, ORAN_RECEIVER};

/// What Alertmanager needs to reach the alarms webhook.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub webhook_url: String,
    pub credentials_file: String,
    pub ca_file: String,
}

impl ReceiverSettings {
    pub fn for_config(cfg: &AlertmanagerConfig) -> Self {
        Self {
            webhook_url: cfg.webhook_url(),
            credentials_file: DEFAULT_TOKEN_FILE.to_string(),
            ca_file: DEFAULT_CA_FILE.to_string(),
        }
    }
}

fn mapping<const N: usize>(pairs: [(&str, Value); N]) -> Value {
    Value::Mapping(pairs.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
}

fn names(item: &Value, field: &str) -> bool {
    item.get(field).and_then(Value::as_str) == Some(ORAN_RECEIVER)
}

fn oran_receiver(settings: &ReceiverSettings) -> Value {
    mapping([
        ("name", Value::from(ORAN_RECEIVER)),
        (
            "webhook_configs",
            Value::Sequence(vec![mapping([
                ("send_resolved", Value::Bool(true)),
                ("url", Value::from(settings.webhook_url.as_str())),
                (
                    "http_config",
                    mapping([
                        (
                            "authorization",
                            mapping([
                                ("type", Value::from("Bearer")),
                                ("credentials_file", Value::from(settings.credentials_file.as_str())),
                            ]),
                        ),
                        ("tls_config", mapping([("ca_file", Value::from(settings.ca_file.as_str()))])),
                    ]),
                ),
            ])]),
        ),
    ])
}

fn oran_route() -> Value {
    mapping([
        ("receiver", Value::from(ORAN_RECEIVER)),
        ("group_wait", Value::from("30s")),
        ("group_interval", Value::from("1m")),
        ("repeat_interval", Value::from("4h")),
        ("matchers", Value::Sequence(vec![Value::from(r#"alertname!~"Watchdog""#)])),
        ("continue", Value::Bool(true)),
    ])
}

/// Sequence under `key` without the entries whose `field` names the ORAN receiver.
fn without_oran(map: &Mapping, key: &str, field: &str) -> Vec<Value> {
    match map.get(key) {
        Some(Value::Sequence(items)) => items.iter().filter(|i| !names(i, field)).cloned().collect(),
        _ => Vec::new(),
    }
}

/// Parse `yaml` and return it with the ORAN receiver first in `receivers` and the ORAN
/// route first under the main route, whose `group_by` is emptied.
pub fn add_oran_route_to_config(yaml: &str, settings: &ReceiverSettings) -> O2Result<Value> {
    let parsed: Value = serde_yaml::from_str(yaml).map_err(|e| O2Error::Validation(format!("alertmanager config: {}", e)))?;
    let mut config = match parsed {
        Value::Mapping(m) => m,
        Value::Null => {
            return Err(O2Error::validation("existing alertmanager config is empty, it must already carry defaults"))
        }
        other => return Err(O2Error::Validation(format!("alertmanager config must be a mapping, got {:?}", other))),
    };

    let mut receivers = vec![oran_receiver(settings)];
    receivers.extend(without_oran(&config, "receivers", "name"));
    config.insert(Value::from("receivers"), Value::Sequence(receivers));
    info!(receiver = ORAN_RECEIVER, "alertmanager: receiver configured");

    let mut route = match config.remove("route") {
        Some(Value::Mapping(r)) => r,
        _ => {
            info!("alertmanager: creating main route");
            let mut r = Mapping::new();
            r.insert(Value::from("receiver"), Value::from(ORAN_RECEIVER));
            r
        }
    };
    route.insert(Value::from("group_by"), Value::Sequence(Vec::new()));
    let mut routes = vec![oran_route()];
    routes.extend(without_oran(&route, "routes", "receiver"));
    route.insert(Value::from("routes"), Value::Sequence(routes));
    config.insert(Value::from("route"), Value::Mapping(route));

    debug!("alertmanager: config merged");
    Ok(Value::Mapping(config))
}

pub fn render(config: &Value) -> O2Result<String> {
    serde_yaml::to_string(config).map_err(|e| O2Error::internal(format!("encoding alertmanager config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXISTING: &str = r#"
global:
  resolve_timeout: 5m
receivers:
  - name: "null"
route:
  group_by:
  - namespace
  group_interval: 5m
  group_wait: 30s
  receiver: "null"
  repeat_interval: 12h
  routes:
    - match:
        alertname: Watchdog
      receiver: "null"
"#;

    fn settings() -> ReceiverSettings {
        ReceiverSettings {
            webhook_url: "https://alarms.example.com/internal/v1/caas-alerts/alertmanager".into(),
            credentials_file: "/token".into(),
            ca_file: "/ca.crt".into(),
        }
    }

    fn count(items: &Value, field: &str) -> usize {
        items.as_sequence().unwrap().iter().filter(|i| names(i, field)).count()
    }

    #[test]
    fn merge_prepends_receiver_and_route() {
        let merged = add_oran_route_to_config(EXISTING, &settings()).unwrap();
        let receivers = &merged["receivers"];
        assert_eq!(receivers[0]["name"], Value::from(ORAN_RECEIVER));
        assert_eq!(receivers[1]["name"], Value::from("null"));
        let hook = &receivers[0]["webhook_configs"][0];
        assert_eq!(hook["send_resolved"], Value::Bool(true));
        assert_eq!(hook["http_config"]["authorization"]["credentials_file"], Value::from("/token"));
        assert_eq!(hook["http_config"]["tls_config"]["ca_file"], Value::from("/ca.crt"));

        let route = &merged["route"];
        assert_eq!(route["group_by"], Value::Sequence(vec![]));
        assert_eq!(route["receiver"], Value::from("null"));
        assert_eq!(route["routes"][0]["receiver"], Value::from(ORAN_RECEIVER));
        assert_eq!(route["routes"][0]["continue"], Value::Bool(true));
        assert_eq!(route["routes"][1]["receiver"], Value::from("null"));
        assert_eq!(merged["global"]["resolve_timeout"], Value::from("5m"));
    }

    #[test]
    fn merge_is_idempotent() {
        let once = add_oran_route_to_config(EXISTING, &settings()).unwrap();
        let twice = add_oran_route_to_config(&render(&once).unwrap(), &settings()).unwrap();
        assert_eq!(count(&twice["receivers"], "name"), 1);
        assert_eq!(count(&twice["route"]["routes"], "receiver"), 1);
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_route_is_created() {
        let merged = add_oran_route_to_config("receivers: []\n", &settings()).unwrap();
        assert_eq!(merged["route"]["receiver"], Value::from(ORAN_RECEIVER));
        assert_eq!(merged["route"]["routes"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn empty_or_invalid_config_is_rejected() {
        for bad in ["", "~", "- a\n- b\n", "a: [unclosed"] {
            assert!(add_oran_route_to_config(bad, &settings()).is_err(), "{:?}", bad);
        }
    }
}
