//! O2IMS store: the in-RAM subscription index.
//!
//! Readers load an immutable `SubscriptionSnapshot` through `ArcSwap`; writers build a new
//! map and swap it in whole. Matching an alarm never observes a half-applied resync.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{gauge, histogram};
use o2ims_core::{O2Error, O2Result, Object};
use o2ims_persist::Entries;
use o2ims_search::{parse_selector, Selector};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const FIELD_CONSUMER_ID: &str = "consumerSubscriptionId";
pub const FIELD_CALLBACK: &str = "callback";
pub const FIELD_FILTER: &str = "filter";

/// A subscription with its filter already parsed.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: String,
    pub consumer_subscription_id: Option<String>,
    pub callback: String,
    pub filter: Option<String>,
    /// `None` accepts every alarm.
    pub selector: Option<Selector>,
}

impl SubscriptionInfo {
    /// Build from the persisted `{consumerSubscriptionId, filter, callback}` document.
    pub fn from_object(id: &str, object: &Object) -> O2Result<Self> {
        let text = |field: &str| object.get(field).and_then(JsonValue::as_str).map(str::to_string);
        let callback = text(FIELD_CALLBACK)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| O2Error::Validation(format!("subscription '{}' has no callback", id)))?;
        let filter = text(FIELD_FILTER).filter(|f| !f.trim().is_empty());
        let selector = filter.as_deref().map(parse_selector).transpose()?;
        Ok(Self { id: id.to_string(), consumer_subscription_id: text(FIELD_CONSUMER_ID), callback, filter, selector })
    }

    pub fn accepts(&self, alarm: &Object) -> O2Result<bool> {
        match &self.selector {
            Some(sel) => sel.matches(alarm),
            None => Ok(true),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<String, Arc<SubscriptionInfo>>,
}

impl SubscriptionSnapshot {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Shared, swap-on-write subscription index.
pub struct SubscriptionIndex {
    snap: ArcSwap<SubscriptionSnapshot>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self { Self::new() }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self { snap: ArcSwap::from_pointee(SubscriptionSnapshot::default()) }
    }

    pub fn current(&self) -> Arc<SubscriptionSnapshot> { self.snap.load_full() }
    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }
    pub fn get(&self, id: &str) -> Option<Arc<SubscriptionInfo>> { self.snap.load().items.get(id).cloned() }

    /// The subscription already delivering to `callback`, if any.
    pub fn find_by_callback(&self, callback: &str) -> Option<Arc<SubscriptionInfo>> {
        self.snap.load().items.values().find(|info| info.callback == callback).cloned()
    }

    fn publish(&self, len: usize) {
        gauge!("subscriptions_active", len as f64);
    }

    /// Swap in a complete new map.
    pub fn replace(&self, items: FxHashMap<String, Arc<SubscriptionInfo>>) {
        let epoch = self.snap.load().epoch.wrapping_add(1);
        let len = items.len();
        self.snap.store(Arc::new(SubscriptionSnapshot { epoch, items }));
        self.publish(len);
        debug!(epoch, count = len, "subscription index replaced");
    }

    /// Rebuild from persisted entries. Entries that fail to parse are skipped; the count of
    /// skipped entries is returned.
    pub fn replace_from_entries(&self, entries: &Entries) -> usize {
        let mut items = FxHashMap::default();
        let mut skipped = 0usize;
        for (id, doc) in entries {
            match SubscriptionInfo::from_object(id, doc) {
                Ok(info) => { items.insert(id.clone(), Arc::new(info)); }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, id = %id, "skipping invalid subscription");
                }
            }
        }
        self.replace(items);
        skipped
    }

    pub fn insert(&self, info: SubscriptionInfo) {
        let info = Arc::new(info);
        self.snap.rcu(|cur| {
            let mut items = cur.items.clone();
            items.insert(info.id.clone(), Arc::clone(&info));
            SubscriptionSnapshot { epoch: cur.epoch.wrapping_add(1), items }
        });
        self.publish(self.len());
    }

    /// Remove `id`; absent ids leave the index untouched.
    pub fn remove(&self, id: &str) -> bool {
        if !self.snap.load().items.contains_key(id) { return false; }
        self.snap.rcu(|cur| {
            let mut items = cur.items.clone();
            items.remove(id);
            SubscriptionSnapshot { epoch: cur.epoch.wrapping_add(1), items }
        });
        self.publish(self.len());
        true
    }

    /// Ids of every subscription whose filter accepts `alarm`. A filter that errors on
    /// this alarm (type mismatch) counts as no match.
    pub fn match_alarm(&self, alarm: &Object) -> FxHashSet<String> {
        let started = Instant::now();
        let snap = self.snap.load();
        let mut out = FxHashSet::default();
        for (id, info) in snap.items.iter() {
            match info.accepts(alarm) {
                Ok(true) => { out.insert(id.clone()); }
                Ok(false) => {}
                Err(e) => debug!(error = %e, id = %id, "subscription filter rejected alarm"),
            }
        }
        histogram!("selector_eval_ms", started.elapsed().as_secs_f64() * 1000.0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: JsonValue) -> Object { v.as_object().cloned().unwrap() }

    fn info(id: &str, filter: Option<&str>) -> SubscriptionInfo {
        let mut doc = obj(json!({"callback": format!("http://sink/{}", id)}));
        if let Some(f) = filter { doc.insert("filter".into(), json!(f)); }
        SubscriptionInfo::from_object(id, &doc).unwrap()
    }

    #[test]
    fn from_object_requires_callback_and_valid_filter() {
        assert!(SubscriptionInfo::from_object("x", &obj(json!({"filter": "(eq,a,b)"}))).is_err());
        assert!(SubscriptionInfo::from_object("x", &obj(json!({"callback": "http://c", "filter": "(bad"}))).is_err());
        let i = SubscriptionInfo::from_object("x", &obj(json!({"callback": "http://c", "filter": "  ", "consumerSubscriptionId": "c1"}))).unwrap();
        assert!(i.selector.is_none());
        assert_eq!(i.consumer_subscription_id.as_deref(), Some("c1"));
    }

    #[test]
    fn insert_and_remove_swap_whole_snapshots() {
        let idx = SubscriptionIndex::new();
        let before = idx.current();
        idx.insert(info("a", None));
        idx.insert(info("b", Some("(eq,x,1)")));
        assert_eq!(before.len(), 0, "old snapshot is immutable");
        assert_eq!(idx.len(), 2);
        assert!(idx.remove("a"));
        assert!(!idx.remove("a"));
        assert!(idx.get("a").is_none());
        assert_eq!(idx.current().epoch, 3);
    }

    #[test]
    fn unfiltered_subscription_matches_everything() {
        let idx = SubscriptionIndex::new();
        idx.insert(info("all", None));
        idx.insert(info("num", Some("(gt,count,3)")));
        let hits = idx.match_alarm(&obj(json!({"count": true})));
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec!["all".to_string()]);
    }
}
