//! Cluster, app instance, and trust policy caches.
//!
//! The engine only reads these and reports state transitions through the
//! setters. The keyed in-memory implementation notifies subscribers on every
//! change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};

use crate::model::{AppInst, AppInstKey, ClusterInst, ClusterInstKey, TrackedState, TrustPolicy};
use crate::{Error, Result};

#[async_trait]
pub trait ClusterInstCache: Send + Sync + 'static {
    async fn get(&self, key: &ClusterInstKey) -> Option<ClusterInst>;

    async fn get_all_keys(&self) -> Vec<ClusterInstKey>;

    async fn set_state(&self, key: &ClusterInstKey, state: TrackedState) -> Result<()>;

    /// Move to an error state and record why.
    async fn set_error(&self, key: &ClusterInstKey, state: TrackedState, err: String)
    -> Result<()>;
}

#[async_trait]
pub trait AppInstCache: Send + Sync + 'static {
    async fn get(&self, key: &AppInstKey) -> Option<AppInst>;

    async fn get_all_keys(&self) -> Vec<AppInstKey>;

    async fn set_state(&self, key: &AppInstKey, state: TrackedState) -> Result<()>;

    async fn set_error(&self, key: &AppInstKey, state: TrackedState, err: String) -> Result<()>;
}

#[async_trait]
pub trait TrustPolicyCache: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Option<TrustPolicy>;

    async fn get_all_keys(&self) -> Vec<String>;
}

/// Values stored in a [`KeyedCache`] carry tracked state.
pub trait Tracked: Clone + Send + Sync + 'static {
    type Key: Ord + Clone + std::fmt::Display + Send + Sync + 'static;

    fn key(&self) -> &Self::Key;

    fn set_tracked_state(&mut self, state: TrackedState);

    fn push_error(&mut self, err: String);
}

impl Tracked for ClusterInst {
    type Key = ClusterInstKey;

    fn key(&self) -> &ClusterInstKey {
        &self.key
    }

    fn set_tracked_state(&mut self, state: TrackedState) {
        self.state = state;
        self.state_changed_at = Some(Utc::now());
    }

    fn push_error(&mut self, err: String) {
        self.errors.push(err);
    }
}

impl Tracked for AppInst {
    type Key = AppInstKey;

    fn key(&self) -> &AppInstKey {
        &self.key
    }

    fn set_tracked_state(&mut self, state: TrackedState) {
        self.state = state;
        self.state_changed_at = Some(Utc::now());
    }

    fn push_error(&mut self, err: String) {
        self.errors.push(err);
    }
}

/// In-memory keyed store with change notification.
pub struct KeyedCache<V: Tracked> {
    items: RwLock<BTreeMap<V::Key, V>>,
    notify: broadcast::Sender<V::Key>,
}

impl<V: Tracked> Default for KeyedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Tracked> KeyedCache<V> {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            items: RwLock::new(BTreeMap::new()),
            notify,
        }
    }

    /// Receive the key of every value that changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<V::Key> {
        self.notify.subscribe()
    }

    pub async fn update(&self, value: V) {
        let key = value.key().clone();
        self.items.write().await.insert(key.clone(), value);
        // no subscribers is fine
        let _ = self.notify.send(key);
    }

    pub async fn delete(&self, key: &V::Key) -> Option<V> {
        let removed = self.items.write().await.remove(key);
        if removed.is_some() {
            let _ = self.notify.send(key.clone());
        }
        removed
    }

    async fn get_value(&self, key: &V::Key) -> Option<V> {
        self.items.read().await.get(key).cloned()
    }

    async fn keys(&self) -> Vec<V::Key> {
        self.items.read().await.keys().cloned().collect()
    }

    async fn modify(&self, key: &V::Key, f: impl FnOnce(&mut V) + Send) -> Result<()> {
        {
            let mut items = self.items.write().await;
            let value = items
                .get_mut(key)
                .ok_or_else(|| Error::Lookup(format!("{key} not found in cache")))?;
            f(value);
        }
        let _ = self.notify.send(key.clone());
        Ok(())
    }
}

#[async_trait]
impl ClusterInstCache for KeyedCache<ClusterInst> {
    async fn get(&self, key: &ClusterInstKey) -> Option<ClusterInst> {
        self.get_value(key).await
    }

    async fn get_all_keys(&self) -> Vec<ClusterInstKey> {
        self.keys().await
    }

    async fn set_state(&self, key: &ClusterInstKey, state: TrackedState) -> Result<()> {
        self.modify(key, |v| v.set_tracked_state(state)).await
    }

    async fn set_error(
        &self,
        key: &ClusterInstKey,
        state: TrackedState,
        err: String,
    ) -> Result<()> {
        self.modify(key, |v| {
            v.set_tracked_state(state);
            v.push_error(err);
        })
        .await
    }
}

#[async_trait]
impl AppInstCache for KeyedCache<AppInst> {
    async fn get(&self, key: &AppInstKey) -> Option<AppInst> {
        self.get_value(key).await
    }

    async fn get_all_keys(&self) -> Vec<AppInstKey> {
        self.keys().await
    }

    async fn set_state(&self, key: &AppInstKey, state: TrackedState) -> Result<()> {
        self.modify(key, |v| v.set_tracked_state(state)).await
    }

    async fn set_error(&self, key: &AppInstKey, state: TrackedState, err: String) -> Result<()> {
        self.modify(key, |v| {
            v.set_tracked_state(state);
            v.push_error(err);
        })
        .await
    }
}

/// Trust policies keyed by name.
#[derive(Default)]
pub struct InMemoryTrustPolicyCache {
    items: RwLock<BTreeMap<String, TrustPolicy>>,
}

impl InMemoryTrustPolicyCache {
    pub async fn update(&self, policy: TrustPolicy) {
        self.items.write().await.insert(policy.name.clone(), policy);
    }
}

#[async_trait]
impl TrustPolicyCache for InMemoryTrustPolicyCache {
    async fn get(&self, name: &str) -> Option<TrustPolicy> {
        self.items.read().await.get(name).cloned()
    }

    async fn get_all_keys(&self) -> Vec<String> {
        self.items.read().await.keys().cloned().collect()
    }
}

/// The caches the engine reads from.
#[derive(Clone)]
pub struct Caches {
    pub cluster_insts: Arc<dyn ClusterInstCache>,
    pub app_insts: Arc<dyn AppInstCache>,
    pub trust_policies: Arc<dyn TrustPolicyCache>,
}

impl Caches {
    /// Fresh in-memory caches, also returned concretely so the owner can
    /// populate them.
    pub fn in_memory() -> (
        Self,
        Arc<KeyedCache<ClusterInst>>,
        Arc<KeyedCache<AppInst>>,
        Arc<InMemoryTrustPolicyCache>,
    ) {
        let clusters = Arc::new(KeyedCache::<ClusterInst>::new());
        let apps = Arc::new(KeyedCache::<AppInst>::new());
        let policies = Arc::new(InMemoryTrustPolicyCache::default());
        (
            Self {
                cluster_insts: clusters.clone(),
                app_insts: apps.clone(),
                trust_policies: policies.clone(),
            },
            clusters,
            apps,
            policies,
        )
    }
}
