//! O2IMS persistence: a small key-value contract with change notification.
//!
//! Every mutation bumps an epoch published on a `watch` channel. Consumers that keep a
//! derived view (the subscription index) re-read `get_all` when the epoch moves, which
//! also covers edits made behind our back (someone editing the ConfigMap by hand).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use o2ims_core::{O2Error, O2Result, Object};
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Snapshot of the whole store, ordered by key.
pub type Entries = BTreeMap<String, Object>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace `key`.
    async fn add(&self, key: &str, value: &Object) -> O2Result<()>;
    /// Remove `key`. Absent keys are not an error.
    async fn delete(&self, key: &str) -> O2Result<()>;
    async fn get(&self, key: &str) -> O2Result<Option<Object>>;
    async fn get_all(&self) -> O2Result<Entries>;
    /// Epoch that moves on every observed change, local or external.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Stored values are JSON documents kept as strings (the ConfigMap `data` shape).
pub fn encode_value(value: &Object) -> O2Result<String> {
    serde_json::to_string(value).map_err(|e| O2Error::Storage(format!("encode: {}", e)))
}

pub fn decode_value(key: &str, raw: &str) -> O2Result<Object> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(O2Error::Storage(format!("value of '{}' is {}, expected an object", key, o2ims_core::json_type_name(&other)))),
        Err(e) => Err(O2Error::Storage(format!("decode '{}': {}", key, e))),
    }
}

/// Process-local store, used by tests and `serve --in-memory`.
pub struct MemoryStore {
    data: RwLock<Entries>,
    epoch: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (epoch, _rx) = watch::channel(0u64);
        Self { data: RwLock::new(Entries::new()), epoch }
    }

    pub fn with_entries(entries: Entries) -> Self {
        let (epoch, _rx) = watch::channel(0u64);
        Self { data: RwLock::new(entries), epoch }
    }

    fn bump(&self) {
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn add(&self, key: &str, value: &Object) -> O2Result<()> {
        let started = Instant::now();
        self.data.write().await.insert(key.to_string(), value.clone());
        self.bump();
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(key, "persist: add");
        Ok(())
    }

    async fn delete(&self, key: &str) -> O2Result<()> {
        let removed = self.data.write().await.remove(key).is_some();
        if removed { self.bump(); }
        debug!(key, removed, "persist: delete");
        Ok(())
    }

    async fn get(&self, key: &str) -> O2Result<Option<Object>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn get_all(&self) -> O2Result<Entries> {
        let started = Instant::now();
        let out = self.data.read().await.clone();
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn subscribe(&self) -> watch::Receiver<u64> { self.epoch.subscribe() }
}
