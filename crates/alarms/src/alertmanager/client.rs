//! Pull client for the Alertmanager `/api/v2/alerts` endpoint.

use std::time::Duration;

use o2ims_core::{CancellationToken, O2Error, O2Result};
use tracing::{debug, info};

use super::types::ApiAlert;
use crate::config::{AlertmanagerConfig, ORAN_RECEIVER};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AlertmanagerClient {
    cfg: AlertmanagerConfig,
}

impl AlertmanagerClient {
    pub fn new(cfg: AlertmanagerConfig) -> O2Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &AlertmanagerConfig { &self.cfg }

    /// Built per call so rotated tokens and CA bundles are picked up.
    fn http(&self) -> O2Result<(reqwest::Client, String)> {
        let token = std::fs::read_to_string(&self.cfg.token_file)
            .map_err(|e| O2Error::Internal(format!("reading token {}: {}", self.cfg.token_file.display(), e)))?;
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).min_tls_version(reqwest::tls::Version::TLS_1_2);
        if let Some(ca) = self.cfg.ca_file.as_ref().filter(|p| p.exists()) {
            let pem = std::fs::read(ca).map_err(|e| O2Error::Internal(format!("reading CA {}: {}", ca.display(), e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| O2Error::Internal(format!("parsing CA {}: {}", ca.display(), e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| O2Error::internal(format!("alertmanager client: {}", e)))?;
        Ok((client, token.trim().to_string()))
    }

    /// Active alerts routed to the ORAN receiver, silenced ones included.
    pub async fn get_alerts(&self, ctx: &CancellationToken) -> O2Result<Vec<ApiAlert>> {
        let (client, token) = self.http()?;
        let url = format!("{}/api/v2/alerts", self.cfg.base());
        let receiver = format!("^({})$", ORAN_RECEIVER);
        let request = client
            .get(&url)
            .query(&[("active", "true"), ("receiver", receiver.as_str()), ("silenced", "true")])
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send();
        let resp = tokio::select! {
            _ = ctx.cancelled() => return Err(O2Error::Cancelled),
            resp = request => resp.map_err(|e| O2Error::Upstream(format!("GET {}: {}", url, e)))?,
        };
        let status = resp.status();
        let body = resp.text().await.map_err(|e| O2Error::Upstream(format!("reading alertmanager response: {}", e)))?;
        if status != reqwest::StatusCode::OK {
            return Err(O2Error::Upstream(format!("alertmanager API returned {}: {}", status.as_u16(), body)));
        }
        let alerts: Vec<ApiAlert> = serde_json::from_str(&body)
            .map_err(|e| O2Error::Upstream(format!("parsing alertmanager response: {}, body: {}", e, body)))?;
        debug!(bytes = body.len(), "alertmanager response");
        info!(alerts = alerts.len(), "alertmanager: got alerts");
        Ok(alerts)
    }
}
