//! Infrastructure object-type cache.
//!
//! Three levels: node cluster -> node cluster type -> alarm dictionary -> definitions keyed
//! by `(alarm name, severity)`. Filled in bulk by [`InfrastructureCache::fetch_all`] and
//! per key on a miss. The maps sit behind one async mutex that stays held across a miss
//! fetch, so concurrent misses on one key reach the upstream once.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use o2ims_core::{CancellationToken, O2Error, O2Result};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const ALARM_DICTIONARY_EXTENSION: &str = "alarmDictionaryID";
pub const SEVERITY_FIELD: &str = "severity";
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(3600);
pub const LIST_TIMEOUT: Duration = Duration::from_secs(30);
pub const SINGLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCluster {
    pub node_cluster_id: Uuid,
    pub node_cluster_type_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClusterType {
    pub node_cluster_type_id: Uuid,
    #[serde(default)]
    pub extensions: Option<serde_json::Map<String, serde_json::Value>>,
}

impl NodeClusterType {
    pub fn alarm_dictionary_id(&self) -> O2Result<Uuid> {
        let ext = self.extensions.as_ref().ok_or_else(|| O2Error::upstream("node cluster type has no extensions"))?;
        let raw = ext
            .get(ALARM_DICTIONARY_EXTENSION)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| O2Error::upstream("node cluster type has no alarm dictionary id"))?;
        Uuid::parse_str(raw).map_err(|e| O2Error::Upstream(format!("alarm dictionary id '{}': {}", raw, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmDefinition {
    pub alarm_definition_id: Uuid,
    pub alarm_name: String,
    #[serde(default)]
    pub alarm_additional_fields: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmDictionary {
    pub alarm_dictionary_id: Uuid,
    #[serde(default)]
    pub alarm_definition: Vec<AlarmDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DefinitionKey {
    pub name: String,
    pub severity: String,
}

pub type Definitions = FxHashMap<DefinitionKey, Uuid>;

impl AlarmDictionary {
    /// Definitions without a severity are skipped.
    pub fn definitions(&self) -> Definitions {
        let mut out = Definitions::default();
        for def in &self.alarm_definition {
            let severity = def.alarm_additional_fields.as_ref().and_then(|f| f.get(SEVERITY_FIELD)).and_then(|s| s.as_str());
            match severity {
                Some(severity) => {
                    out.insert(DefinitionKey { name: def.alarm_name.clone(), severity: severity.to_string() }, def.alarm_definition_id);
                }
                None => error!(definition = %def.alarm_definition_id, "alarm definition has no severity"),
            }
        }
        debug!(dictionary = %self.alarm_dictionary_id, count = out.len(), "alarm definitions");
        out
    }
}

/// Upstream inventory the cache reads through.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn node_clusters(&self) -> O2Result<Vec<NodeCluster>>;
    async fn node_cluster(&self, id: Uuid) -> O2Result<NodeCluster>;
    async fn node_cluster_types(&self) -> O2Result<Vec<NodeClusterType>>;
    async fn node_cluster_type(&self, id: Uuid) -> O2Result<NodeClusterType>;
    async fn alarm_dictionaries(&self) -> O2Result<Vec<AlarmDictionary>>;
    async fn alarm_dictionary(&self, id: Uuid) -> O2Result<AlarmDictionary>;
}

/// REST client for the cluster server inventory API.
pub struct ClusterServerClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ClusterServerClient {
    pub fn new(base: &str, token: impl Into<String>) -> O2Result<Self> {
        url::Url::parse(base).map_err(|e| O2Error::Validation(format!("cluster server url '{}': {}", base, e)))?;
        let http = reqwest::Client::builder().build().map_err(|e| O2Error::internal(e.to_string()))?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string(), token: token.into() })
    }

    pub fn from_token_file(base: &str, token_file: &Path) -> O2Result<Self> {
        let token = std::fs::read_to_string(token_file)
            .map_err(|e| O2Error::Internal(format!("reading token {}: {}", token_file.display(), e)))?;
        Self::new(base, token.trim().to_string())
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str, timeout: Duration) -> O2Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| O2Error::Upstream(format!("GET {}: {}", url, e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND { return Err(O2Error::NotFound(url)); }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(O2Error::Upstream(format!("GET {}: status {}: {}", url, status.as_u16(), body)));
        }
        resp.json::<T>().await.map_err(|e| O2Error::Upstream(format!("GET {}: decode: {}", url, e)))
    }
}

#[async_trait]
impl InventoryClient for ClusterServerClient {
    async fn node_clusters(&self) -> O2Result<Vec<NodeCluster>> { self.fetch("/node-clusters", LIST_TIMEOUT).await }
    async fn node_cluster(&self, id: Uuid) -> O2Result<NodeCluster> {
        self.fetch(&format!("/node-clusters/{}", id), SINGLE_TIMEOUT).await
    }
    async fn node_cluster_types(&self) -> O2Result<Vec<NodeClusterType>> {
        self.fetch("/node-cluster-types", LIST_TIMEOUT).await
    }
    async fn node_cluster_type(&self, id: Uuid) -> O2Result<NodeClusterType> {
        self.fetch(&format!("/node-cluster-types/{}", id), SINGLE_TIMEOUT).await
    }
    async fn alarm_dictionaries(&self) -> O2Result<Vec<AlarmDictionary>> {
        self.fetch("/alarm-dictionaries", LIST_TIMEOUT).await
    }
    async fn alarm_dictionary(&self, id: Uuid) -> O2Result<AlarmDictionary> {
        self.fetch(&format!("/alarm-dictionaries/{}", id), SINGLE_TIMEOUT).await
    }
}

#[derive(Default)]
struct Maps {
    cluster_to_type: FxHashMap<Uuid, Uuid>,
    type_to_dictionary: FxHashMap<Uuid, Uuid>,
    dictionary_definitions: FxHashMap<Uuid, Definitions>,
}

async fn cancellable<T>(ctx: &CancellationToken, fut: impl std::future::Future<Output = O2Result<T>>) -> O2Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(O2Error::Cancelled),
        out = fut => out,
    }
}

pub struct InfrastructureCache {
    client: Arc<dyn InventoryClient>,
    maps: Mutex<Maps>,
}

impl InfrastructureCache {
    pub fn new(client: Arc<dyn InventoryClient>) -> Self { Self { client, maps: Mutex::new(Maps::default()) } }

    /// Replace all three levels from the upstream lists.
    pub async fn fetch_all(&self, ctx: &CancellationToken) -> O2Result<()> {
        let clusters = cancellable(ctx, self.client.node_clusters()).await?;
        let types = cancellable(ctx, self.client.node_cluster_types()).await?;
        let dictionaries = cancellable(ctx, self.client.alarm_dictionaries()).await?;

        let cluster_to_type = clusters.iter().map(|c| (c.node_cluster_id, c.node_cluster_type_id)).collect();
        let mut type_to_dictionary = FxHashMap::default();
        for t in &types {
            match t.alarm_dictionary_id() {
                Ok(d) => { type_to_dictionary.insert(t.node_cluster_type_id, d); }
                Err(e) => error!(node_cluster_type = %t.node_cluster_type_id, error = %e, "no alarm dictionary"),
            }
        }
        let dictionary_definitions = dictionaries.iter().map(|d| (d.alarm_dictionary_id, d.definitions())).collect();

        *self.maps.lock().await = Maps { cluster_to_type, type_to_dictionary, dictionary_definitions };
        info!(clusters = clusters.len(), types = types.len(), dictionaries = dictionaries.len(), "infrastructure: synced");
        Ok(())
    }

    /// Node cluster type of a node cluster.
    pub async fn get_object_type_id(&self, ctx: &CancellationToken, cluster_id: Uuid) -> O2Result<Uuid> {
        let mut maps = self.maps.lock().await;
        if let Some(t) = maps.cluster_to_type.get(&cluster_id) { return Ok(*t); }
        counter!("infra_cache_misses_total", 1u64, "level" => "node_cluster");
        info!(node_cluster = %cluster_id, "node cluster not cached");
        let cluster = cancellable(ctx, self.client.node_cluster(cluster_id)).await?;
        maps.cluster_to_type.insert(cluster_id, cluster.node_cluster_type_id);
        Ok(cluster.node_cluster_type_id)
    }

    /// Alarm definition for `(name, severity)` in the dictionary of a node cluster type.
    /// A definition missing from a cached dictionary triggers one refetch of that dictionary.
    pub async fn get_alarm_definition_id(
        &self,
        ctx: &CancellationToken,
        type_id: Uuid,
        name: &str,
        severity: &str,
    ) -> O2Result<Uuid> {
        let mut maps = self.maps.lock().await;
        let dictionary_id = match maps.type_to_dictionary.get(&type_id) {
            Some(d) => *d,
            None => {
                counter!("infra_cache_misses_total", 1u64, "level" => "node_cluster_type");
                let t = cancellable(ctx, self.client.node_cluster_type(type_id)).await?;
                let d = t.alarm_dictionary_id()?;
                maps.type_to_dictionary.insert(type_id, d);
                d
            }
        };

        let key = DefinitionKey { name: name.to_string(), severity: severity.to_string() };
        let mut refetched = false;
        if !maps.dictionary_definitions.contains_key(&dictionary_id) {
            counter!("infra_cache_misses_total", 1u64, "level" => "alarm_dictionary");
            let dict = cancellable(ctx, self.client.alarm_dictionary(dictionary_id)).await?;
            maps.dictionary_definitions.insert(dictionary_id, dict.definitions());
            refetched = true;
        }
        if let Some(id) = maps.dictionary_definitions.get(&dictionary_id).and_then(|defs| defs.get(&key)) {
            return Ok(*id);
        }
        if !refetched {
            counter!("infra_cache_misses_total", 1u64, "level" => "alarm_definition");
            debug!(dictionary = %dictionary_id, name, severity, "refetching alarm definitions");
            let dict = cancellable(ctx, self.client.alarm_dictionary(dictionary_id)).await?;
            let defs = dict.definitions();
            let found = defs.get(&key).copied();
            maps.dictionary_definitions.insert(dictionary_id, defs);
            if let Some(id) = found { return Ok(id); }
        }
        Err(O2Error::NotFound(format!("alarm definition name={} severity={} in dictionary {}", name, severity, dictionary_id)))
    }

    /// `fetch_all` with up to `max` attempts, backing off 1s, 2s, 4s... Cancellation
    /// during a backoff ends the loop quietly.
    pub async fn fetch_all_with_retry(&self, ctx: &CancellationToken, max: usize) -> O2Result<()> {
        let mut backoff = Duration::from_secs(1);
        let mut last = O2Error::internal("no attempt made");
        for attempt in 1..=max {
            match self.fetch_all(ctx).await {
                Ok(()) => return Ok(()),
                Err(O2Error::Cancelled) => return Ok(()),
                Err(e) => last = e,
            }
            if attempt == max { break; }
            warn!(attempt, max, error = %last, "infrastructure: fetch failed");
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => backoff *= 2,
            }
        }
        Err(O2Error::Upstream(format!("failed after {} attempts: {}", max, last)))
    }

    /// Initial retrying fetch, then a full refresh every `interval` until cancelled.
    pub fn spawn_sync(self: &Arc<Self>, ctx: CancellationToken, interval: Duration) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = me.fetch_all_with_retry(&ctx, 3).await {
                error!(error = %e, "infrastructure: initial sync failed");
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = me.fetch_all(&ctx).await {
                            error!(error = %e, "infrastructure: sync failed");
                        }
                    }
                }
            }
            info!("infrastructure: sync stopped");
        })
    }
}
