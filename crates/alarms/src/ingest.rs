//! Alert ingestion: convert, record, resolve stale alarms, notify subscribers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use o2ims_core::{CancellationToken, O2Result};
use tracing::{error, info, warn};

use crate::alertmanager::{api_alerts_to_webhook, convert_alerts, Alert, AlertmanagerClient};
use crate::infrastructure::InfrastructureCache;
use crate::notifier::Dispatcher;
use crate::records::AlarmRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Alertmanager pushed an alert group; only the alerts in it are known.
    Webhook,
    /// Full set of active alerts pulled from the Alertmanager API.
    Api,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Api => "api",
        }
    }
}

pub struct AlarmPipeline {
    repo: Arc<AlarmRepository>,
    dispatcher: Arc<Dispatcher>,
    infra: Option<Arc<InfrastructureCache>>,
    generation: AtomicI64,
}

impl AlarmPipeline {
    pub fn new(repo: Arc<AlarmRepository>, dispatcher: Arc<Dispatcher>, infra: Option<Arc<InfrastructureCache>>) -> Self {
        Self { repo, dispatcher, infra, generation: AtomicI64::new(0) }
    }

    pub fn repository(&self) -> &Arc<AlarmRepository> { &self.repo }

    /// Record `alerts` and notify matching subscribers of every record that changed.
    /// A pull (`Source::Api`) carries the full active set, so records it does not
    /// mention are resolved, even when the set is empty.
    pub async fn handle_alerts(&self, ctx: &CancellationToken, alerts: &[Alert], source: Source) -> O2Result<usize> {
        if alerts.is_empty() && source == Source::Webhook { return Ok(0); }
        let started = Instant::now();
        let alarms = convert_alerts(ctx, alerts, self.infra.as_deref()).await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();

        let mut changed = self.repo.upsert(alarms, generation, now).await;
        if source == Source::Api {
            changed.extend(self.repo.resolve_stale(generation, now).await);
        }

        let mut notified = 0usize;
        for record in &changed {
            match record.to_object() {
                Ok(obj) => notified += self.dispatcher.notify(&obj).len(),
                Err(e) => warn!(id = %record.alarm_event_record_id, error = %e, "alarm not notified"),
            }
        }
        counter!("alerts_ingested_total", alerts.len() as u64, "source" => source.as_str());
        histogram!("alerts_sync_ms", started.elapsed().as_secs_f64() * 1000.0, "source" => source.as_str());
        info!(source = source.as_str(), alerts = alerts.len(), changed = changed.len(), notified, "alarms: alerts handled");
        Ok(changed.len())
    }

    /// One pull from the Alertmanager API.
    pub async fn sync_alerts(&self, ctx: &CancellationToken, client: &AlertmanagerClient) -> O2Result<usize> {
        let alerts = api_alerts_to_webhook(client.get_alerts(ctx).await?, Utc::now());
        self.handle_alerts(ctx, &alerts, Source::Api).await
    }

    /// Pull every `interval` until cancelled; failures are logged and the next tick retries.
    pub fn spawn_sync_scheduler(
        self: &Arc<Self>,
        client: Arc<AlertmanagerClient>,
        interval: Duration,
        ctx: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "alarms: alert sync scheduler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = me.sync_alerts(&ctx, &client).await {
                            error!(error = %e, "alarms: alert sync failed");
                        }
                    }
                }
            }
            info!("alarms: alert sync scheduler stopped");
        })
    }
}
