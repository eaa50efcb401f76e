//! O2IMS kubehub: Kubernetes-backed persistence and Secret access.
//!
//! `ConfigMapStore` keeps one JSON document per `data` key of a single ConfigMap and
//! watches that ConfigMap so out-of-band edits reach subscribers of the epoch.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::{counter, histogram};
use o2ims_core::{CancellationToken, O2Error, O2Result, Object};
use o2ims_persist::{decode_value, encode_value, Entries, KvStore};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn storage(e: kube::Error) -> O2Error { O2Error::Storage(e.to_string()) }

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    epoch: watch::Sender<u64>,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        let (epoch, _rx) = watch::channel(0u64);
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string(), name: name.to_string(), epoch }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn connect(namespace: &str, name: &str) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client, namespace, name))
    }

    pub fn name(&self) -> &str { &self.name }

    fn bump(&self) { self.epoch.send_modify(|e| *e = e.wrapping_add(1)); }

    /// Create the ConfigMap when it does not exist yet.
    async fn ensure(&self) -> O2Result<()> {
        if self.api.get_opt(&self.name).await.map_err(storage)?.is_some() { return Ok(()); }
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some(self.name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                info!(ns = %self.namespace, name = %self.name, "configmap created");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(storage(e)),
        }
    }

    async fn patch_data(&self, data: serde_json::Value) -> O2Result<()> {
        let started = Instant::now();
        self.ensure().await?;
        let patch = json!({ "data": data });
        self.api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(storage)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    /// Watch the ConfigMap until cancelled, bumping the epoch on every event.
    pub async fn watch(&self, cancel: CancellationToken) {
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let stream = watcher::watcher(self.api.clone(), cfg).default_backoff();
        futures::pin_mut!(stream);
        info!(ns = %self.namespace, name = %self.name, "configmap watcher started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Event::Applied(_))) | Some(Ok(Event::Deleted(_))) => self.bump(),
                Some(Ok(Event::Restarted(list))) => {
                    debug!(count = list.len(), "watch restart");
                    self.bump();
                }
                Some(Err(e)) => warn!(error = %e, name = %self.name, "configmap watch error"),
                None => break,
            }
        }
        info!(name = %self.name, "configmap watcher stopped");
    }

    /// Run [`ConfigMapStore::watch`] on the runtime.
    pub fn spawn_watch(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.watch(cancel).await })
    }
}

#[async_trait]
impl KvStore for ConfigMapStore {
    async fn add(&self, key: &str, value: &Object) -> O2Result<()> {
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), json!(encode_value(value)?));
        self.patch_data(data.into()).await?;
        self.bump();
        Ok(())
    }

    async fn delete(&self, key: &str) -> O2Result<()> {
        let Some(cm) = self.api.get_opt(&self.name).await.map_err(storage)? else { return Ok(()) };
        if !cm.data.as_ref().is_some_and(|d| d.contains_key(key)) { return Ok(()); }
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), serde_json::Value::Null);
        self.patch_data(data.into()).await?;
        self.bump();
        Ok(())
    }

    async fn get(&self, key: &str) -> O2Result<Option<Object>> {
        let cm = self.api.get_opt(&self.name).await.map_err(storage)?;
        match cm.and_then(|c| c.data).and_then(|mut d| d.remove(key)) {
            Some(raw) => decode_value(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> O2Result<Entries> {
        let started = Instant::now();
        let cm = self.api.get_opt(&self.name).await.map_err(storage)?;
        let mut out = Entries::new();
        for (key, raw) in cm.and_then(|c| c.data).unwrap_or_default() {
            match decode_value(&key, &raw) {
                Ok(v) => { out.insert(key, v); }
                Err(e) => warn!(error = %e, key = %key, "skipping undecodable entry"),
            }
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn subscribe(&self) -> watch::Receiver<u64> { self.epoch.subscribe() }
}

/// Read one `data` key of a Secret as UTF-8 text.
pub async fn read_secret_key(client: Client, namespace: &str, name: &str, key: &str) -> Result<Option<String>> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = api.get(name).await.with_context(|| format!("reading secret {}/{}", namespace, name))?;
    let Some(bytes) = secret.data.and_then(|mut d| d.remove(key)) else { return Ok(None) };
    let text = String::from_utf8(bytes.0).with_context(|| format!("secret key '{}' is not UTF-8", key))?;
    Ok(Some(text))
}

/// Replace one key of an existing Secret.
pub async fn write_secret_key(client: Client, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let patch = json!({ "stringData": { key: value } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("updating secret {}/{}", namespace, name))?;
    info!(ns = %namespace, name = %name, key = %key, "secret updated");
    Ok(())
}
