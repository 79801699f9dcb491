//! Cache stores backing the informer.

use async_trait::async_trait;
use dashmap::DashMap;
use opkit_core::{BoxError, DynamicResource};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by [`Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object carries no name, so no key can be derived
    #[error("object has no name")]
    UnnamedObject,

    /// This store cannot enumerate its contents
    #[error("store does not support enumeration")]
    EnumerationUnsupported,

    /// The backing service failed
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),

    /// A stored payload could not be (de)serialized
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The cache contract consumed by the informer.
///
/// Implementations are internally synchronized and fire-and-forget: callers
/// do not observe write ordering beyond what each method returns. `list` and
/// `list_keys` may be unsupported ([`StoreError::EnumerationUnsupported`]),
/// in which case the store must not be paired with consumers that enumerate
/// (such as the cache resync ticker).
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `obj` under its `<namespace>/<name>` key
    async fn add(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError>;

    /// Overwrite the entry for `obj`
    async fn update(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError>;

    /// Remove the entry for `obj`
    async fn delete(&self, obj: &DynamicResource) -> Result<(), StoreError>;

    /// Fetch the entry matching `obj`'s key
    async fn get(&self, obj: &DynamicResource) -> Result<Option<Arc<DynamicResource>>, StoreError> {
        self.get_by_key(&obj.cache_key()).await
    }

    /// Fetch the entry under `key`
    async fn get_by_key(&self, key: &str) -> Result<Option<Arc<DynamicResource>>, StoreError>;

    /// Snapshot of every cached object
    async fn list(&self) -> Result<Vec<Arc<DynamicResource>>, StoreError>;

    /// Snapshot of every cache key
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Atomically replace the whole cache with `objects`, recording the
    /// resource version the snapshot was taken at
    async fn replace(
        &self,
        objects: Vec<Arc<DynamicResource>>,
        resource_version: &str,
    ) -> Result<(), StoreError>;

    /// Touch every entry; a no-op for stores with no refresh semantics
    async fn resync(&self) -> Result<(), StoreError>;
}

fn key_of(obj: &DynamicResource) -> Result<String, StoreError> {
    if obj.name().is_empty() {
        return Err(StoreError::UnnamedObject);
    }
    Ok(obj.cache_key())
}

/// Thread-safe in-memory store keyed by `<namespace>/<name>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Arc<DynamicResource>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError> {
        self.entries.insert(key_of(&obj)?, obj);
        Ok(())
    }

    async fn update(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError> {
        self.entries.insert(key_of(&obj)?, obj);
        Ok(())
    }

    async fn delete(&self, obj: &DynamicResource) -> Result<(), StoreError> {
        self.entries.remove(&key_of(obj)?);
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Arc<DynamicResource>>, StoreError> {
        Ok(self.entries.get(key).map(|entry| Arc::clone(entry.value())))
    }

    async fn list(&self) -> Result<Vec<Arc<DynamicResource>>, StoreError> {
        Ok(self.entries.iter().map(|entry| Arc::clone(entry.value())).collect())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn replace(
        &self,
        objects: Vec<Arc<DynamicResource>>,
        _resource_version: &str,
    ) -> Result<(), StoreError> {
        let mut incoming = std::collections::HashMap::with_capacity(objects.len());
        for obj in objects {
            incoming.insert(key_of(&obj)?, obj);
        }
        // Not a single atomic swap, but stale keys never survive it.
        self.entries.retain(|key, _| incoming.contains_key(key));
        for (key, obj) in incoming {
            self.entries.insert(key, obj);
        }
        Ok(())
    }

    async fn resync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Byte-level access to an external key/value service such as memcached.
///
/// The store layers object semantics on top; implementations only move
/// opaque payloads.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    /// Fetch the payload under `key`, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError>;

    /// Write `value` under `key`
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BoxError>;

    /// Drop `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<(), BoxError>;
}

/// Store persisting objects as JSON in an external key/value service.
///
/// Keys take the form `<plural>/<namespace>/<name>`. Key/value services
/// cannot enumerate natively, so enumeration is only available when key
/// tracking is enabled, which mirrors the key set in memory.
pub struct KeyValueStore<C> {
    client: C,
    plural: String,
    tracked_keys: Option<RwLock<HashSet<String>>>,
}

impl<C: KeyValueClient> KeyValueStore<C> {
    /// Create a store for objects of the kind named by `plural`
    #[must_use]
    pub fn new(client: C, plural: &str) -> Self {
        Self {
            client,
            plural: plural.to_string(),
            tracked_keys: None,
        }
    }

    /// Mirror the key set in memory so `list`/`list_keys` work
    #[must_use]
    pub fn track_keys(mut self) -> Self {
        self.tracked_keys = Some(RwLock::new(HashSet::new()));
        self
    }

    fn backend_key(&self, cache_key: &str) -> String {
        // Cluster-scoped keys have no namespace segment; keep the slot.
        if cache_key.contains('/') {
            format!("{}/{cache_key}", self.plural)
        } else {
            format!("{}//{cache_key}", self.plural)
        }
    }

    async fn write(&self, obj: &Arc<DynamicResource>) -> Result<(), StoreError> {
        let cache_key = key_of(obj)?;
        let payload = serde_json::to_vec(obj.as_ref())?;
        self.client
            .set(&self.backend_key(&cache_key), payload)
            .await
            .map_err(StoreError::Backend)?;
        if let Some(tracked) = &self.tracked_keys {
            tracked.write().insert(cache_key);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: KeyValueClient> Store for KeyValueStore<C> {
    async fn add(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError> {
        self.write(&obj).await
    }

    async fn update(&self, obj: Arc<DynamicResource>) -> Result<(), StoreError> {
        self.write(&obj).await
    }

    async fn delete(&self, obj: &DynamicResource) -> Result<(), StoreError> {
        let cache_key = key_of(obj)?;
        self.client
            .delete(&self.backend_key(&cache_key))
            .await
            .map_err(StoreError::Backend)?;
        if let Some(tracked) = &self.tracked_keys {
            tracked.write().remove(&cache_key);
        }
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Arc<DynamicResource>>, StoreError> {
        let payload = self
            .client
            .get(&self.backend_key(key))
            .await
            .map_err(StoreError::Backend)?;
        match payload {
            Some(bytes) => Ok(Some(Arc::new(serde_json::from_slice(&bytes)?))),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Arc<DynamicResource>>, StoreError> {
        let keys = self.list_keys().await?;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(obj) = self.get_by_key(&key).await? {
                objects.push(obj);
            }
        }
        Ok(objects)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        match &self.tracked_keys {
            Some(tracked) => Ok(tracked.read().iter().cloned().collect()),
            None => Err(StoreError::EnumerationUnsupported),
        }
    }

    async fn replace(
        &self,
        objects: Vec<Arc<DynamicResource>>,
        _resource_version: &str,
    ) -> Result<(), StoreError> {
        let mut fresh = HashSet::with_capacity(objects.len());
        for obj in &objects {
            fresh.insert(key_of(obj)?);
        }
        // Evict keys that are tracked but absent from the new snapshot.
        if let Some(tracked) = &self.tracked_keys {
            let stale: Vec<String> = tracked.read().difference(&fresh).cloned().collect();
            for key in stale {
                self.client
                    .delete(&self.backend_key(&key))
                    .await
                    .map_err(StoreError::Backend)?;
                tracked.write().remove(&key);
            }
        }
        for obj in &objects {
            self.write(obj).await?;
        }
        Ok(())
    }

    async fn resync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opkit_core::GroupVersionKind;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn obj(ns: &str, name: &str, rv: &str) -> Arc<DynamicResource> {
        let mut obj =
            DynamicResource::new(name, &GroupVersionKind::gvk("example.io", "v1", "Widget"))
                .within(ns);
        obj.metadata.resource_version = Some(rv.to_string());
        Arc::new(obj)
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let o1 = obj("ns", "a", "1");
        store.add(Arc::clone(&o1)).await.unwrap();
        assert_eq!(
            store.get(&o1).await.unwrap().unwrap().resource_version(),
            Some("1")
        );

        let o2 = obj("ns", "a", "2");
        store.update(Arc::clone(&o2)).await.unwrap();
        assert_eq!(
            store.get_by_key("ns/a").await.unwrap().unwrap().resource_version(),
            Some("2")
        );

        store.delete(&o2).await.unwrap();
        assert!(store.get_by_key("ns/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_replace_evicts_stale_entries() {
        let store = MemoryStore::new();
        store.add(obj("ns", "a", "1")).await.unwrap();
        store.add(obj("ns", "b", "1")).await.unwrap();

        store
            .replace(vec![obj("ns", "b", "2"), obj("ns", "c", "2")], "2")
            .await
            .unwrap();

        let mut keys = store.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns/b", "ns/c"]);
        assert!(store.get_by_key("ns/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_rejects_unnamed_objects() {
        let store = MemoryStore::new();
        let nameless = Arc::new(DynamicResource {
            types: opkit_core::TypeMeta {
                api_version: "v1".into(),
                kind: "Widget".into(),
            },
            ..DynamicResource::default()
        });
        assert!(matches!(
            store.add(nameless).await,
            Err(StoreError::UnnamedObject)
        ));
    }

    #[derive(Default)]
    struct FakeKv {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl KeyValueClient for Arc<FakeKv> {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
            Ok(self.data.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BoxError> {
            self.data.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), BoxError> {
            self.data.lock().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn key_value_store_uses_plural_scoped_keys() {
        let kv = Arc::new(FakeKv::default());
        let store = KeyValueStore::new(Arc::clone(&kv), "widgets").track_keys();

        store.add(obj("ns", "a", "1")).await.unwrap();
        assert!(kv.data.lock().contains_key("widgets/ns/a"));

        let fetched = store.get_by_key("ns/a").await.unwrap().unwrap();
        assert_eq!(fetched.name(), "a");
        assert_eq!(fetched.resource_version(), Some("1"));

        store.delete(&obj("ns", "a", "1")).await.unwrap();
        assert!(store.get_by_key("ns/a").await.unwrap().is_none());
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_value_store_without_tracking_cannot_enumerate() {
        let kv = Arc::new(FakeKv::default());
        let store = KeyValueStore::new(kv, "widgets");
        store.add(obj("ns", "a", "1")).await.unwrap();
        assert!(matches!(
            store.list_keys().await,
            Err(StoreError::EnumerationUnsupported)
        ));
    }

    #[tokio::test]
    async fn key_value_store_replace_evicts_stale_keys() {
        let kv = Arc::new(FakeKv::default());
        let store = KeyValueStore::new(Arc::clone(&kv), "widgets").track_keys();
        store.add(obj("ns", "a", "1")).await.unwrap();
        store
            .replace(vec![obj("ns", "b", "2")], "2")
            .await
            .unwrap();
        assert!(!kv.data.lock().contains_key("widgets/ns/a"));
        assert!(kv.data.lock().contains_key("widgets/ns/b"));
        assert_eq!(store.list_keys().await.unwrap(), vec!["ns/b"]);
    }
}
