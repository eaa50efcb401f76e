//! Alertmanager integration: payload types, conversion, pull client and receiver setup.

pub mod client;
pub mod config;
pub mod convert;
pub mod types;

use anyhow::{anyhow, Context, Result};
use tracing::info;

pub use client::AlertmanagerClient;
pub use config::{add_oran_route_to_config, render, ReceiverSettings};
pub use convert::{convert_alert, convert_alerts};
pub use types::{api_alerts_to_webhook, Alert, AlertStatus, ApiAlert, WebhookNotification};

use crate::config::{ALERTMANAGER_SECRET, ALERTMANAGER_SECRET_KEY, OBSERVABILITY_NAMESPACE};

/// Read the current Alertmanager config from its Secret.
pub async fn read_config(client: kube::Client) -> Result<String> {
    o2ims_kubehub::read_secret_key(client, OBSERVABILITY_NAMESPACE, ALERTMANAGER_SECRET, ALERTMANAGER_SECRET_KEY)
        .await?
        .ok_or_else(|| {
            anyhow!(
                "secret {}/{} does not contain key {}",
                OBSERVABILITY_NAMESPACE,
                ALERTMANAGER_SECRET,
                ALERTMANAGER_SECRET_KEY
            )
        })
}

/// Merge the ORAN receiver into the Alertmanager Secret and write it back.
pub async fn setup(client: kube::Client, settings: &ReceiverSettings) -> Result<()> {
    let existing = read_config(client.clone()).await?;
    let merged = add_oran_route_to_config(&existing, settings).context("merging alertmanager config")?;
    let text = render(&merged)?;
    o2ims_kubehub::write_secret_key(client, OBSERVABILITY_NAMESPACE, ALERTMANAGER_SECRET, ALERTMANAGER_SECRET_KEY, &text)
        .await?;
    info!("alertmanager: merged ORAN receiver into existing config");
    Ok(())
}
