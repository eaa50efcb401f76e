//! Configuration structs and well-known names.

use std::path::PathBuf;
use std::time::Duration;

use o2ims_core::{O2Error, O2Result};

pub const API_ROOT: &str = "/o2ims-infrastructureMonitoring";
pub const API_PREFIX: &str = "/o2ims-infrastructureMonitoring/v1";
pub const API_VERSION: &str = "1.0.0";
pub const WEBHOOK_PATH: &str = "/internal/v1/caas-alerts/alertmanager";

pub const OBSERVABILITY_NAMESPACE: &str = "open-cluster-management-observability";
pub const ALERTMANAGER_SECRET: &str = "alertmanager-config";
pub const ALERTMANAGER_SECRET_KEY: &str = "alertmanager.yaml";
pub const ORAN_RECEIVER: &str = "oran_alarm_receiver";

pub const DEFAULT_AM_HOST: &str = "alertmanager.open-cluster-management-observability.svc:9095";
pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/service-ca.crt";

pub const ENV_AM_HOST: &str = "ALARMS_SERVER_AM_HOST";
pub const ENV_TOKEN_FILE: &str = "ALARMS_SERVER_TOKEN_FILE";
pub const ENV_CA_FILE: &str = "ALARMS_SERVER_CA_FILE";

/// Notification delivery settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-callback deadline; deliveries never inherit the caller's cancellation.
    pub timeout: Duration,
    /// Prefix of `objectRef`, the record id is appended.
    pub object_ref_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(2), object_ref_prefix: format!("{}/alarms", API_PREFIX) }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> O2Result<()> {
        if self.timeout.is_zero() { return Err(O2Error::validation("notification timeout must be positive")); }
        Ok(())
    }
}

/// Alertmanager pull client and receiver settings.
#[derive(Debug, Clone)]
pub struct AlertmanagerConfig {
    /// `host:port` of the Alertmanager API, reached over https.
    pub host: String,
    /// Full base URL; overrides `host` (plain http is allowed here).
    pub base_url: Option<String>,
    pub token_file: PathBuf,
    /// Extra CA bundle; ignored when the file does not exist.
    pub ca_file: Option<PathBuf>,
    pub sync_interval: Duration,
    /// URL Alertmanager uses to reach this server's webhook, without the path.
    pub alarm_server_url: String,
}

impl AlertmanagerConfig {
    /// Defaults overridden by the `ALARMS_SERVER_*` environment variables.
    pub fn from_env(alarm_server_url: impl Into<String>, sync_interval: Duration) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            host: var(ENV_AM_HOST).unwrap_or_else(|| DEFAULT_AM_HOST.to_string()),
            base_url: None,
            token_file: var(ENV_TOKEN_FILE).unwrap_or_else(|| DEFAULT_TOKEN_FILE.to_string()).into(),
            ca_file: Some(var(ENV_CA_FILE).unwrap_or_else(|| DEFAULT_CA_FILE.to_string()).into()),
            sync_interval,
            alarm_server_url: alarm_server_url.into(),
        }
    }

    pub fn base(&self) -> String {
        match &self.base_url {
            Some(b) => b.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.host),
        }
    }

    pub fn webhook_url(&self) -> String {
        format!("{}{}", self.alarm_server_url.trim_end_matches('/'), WEBHOOK_PATH)
    }

    pub fn validate(&self) -> O2Result<()> {
        if self.base_url.is_none() && self.host.is_empty() {
            return Err(O2Error::validation("alertmanager host is mandatory"));
        }
        if self.sync_interval.is_zero() { return Err(O2Error::validation("alert sync interval must be positive")); }
        url::Url::parse(&self.base()).map_err(|e| O2Error::Validation(format!("alertmanager url: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn am() -> AlertmanagerConfig {
        AlertmanagerConfig {
            host: "am:9095".into(),
            base_url: None,
            token_file: "/tmp/token".into(),
            ca_file: None,
            sync_interval: Duration::from_secs(60),
            alarm_server_url: "https://alarms.example.com/".into(),
        }
    }

    #[test]
    fn urls_are_derived() {
        let cfg = am();
        assert_eq!(cfg.base(), "https://am:9095");
        assert_eq!(cfg.webhook_url(), "https://alarms.example.com/internal/v1/caas-alerts/alertmanager");
        let cfg = AlertmanagerConfig { base_url: Some("http://127.0.0.1:1234/".into()), ..am() };
        assert_eq!(cfg.base(), "http://127.0.0.1:1234");
    }

    #[test]
    fn zero_durations_are_rejected() {
        assert!(am().validate().is_ok());
        assert!(AlertmanagerConfig { sync_interval: Duration::ZERO, ..am() }.validate().is_err());
        assert!(DispatcherConfig { timeout: Duration::ZERO, ..Default::default() }.validate().is_err());
    }
}
