use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use crate::error::SmallError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, SmallError>;
pub type SmallResult = Result<(), SmallError>;

/// A `HashMap` behind a `RwLock`, so callers can share it with `&self`
/// access. Used by the buffer pool, where multiple transactions load
/// pages concurrently.
pub struct ConcurrentHashMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Return the value for `key`, running `init` to create it if the
    /// key is absent. The write lock is held across `init` so two
    /// callers cannot both load the same page.
    pub fn get_or_insert<F>(&self, key: &K, init: F) -> Result<V, SmallError>
    where
        F: FnOnce(&K) -> Result<V, SmallError>,
    {
        let mut inner = self.inner.write().unwrap();
        if let Some(v) = inner.get(key) {
            return Ok(v.clone());
        }

        let v = init(key)?;
        inner.insert(key.clone(), v.clone());
        return Ok(v);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.write().unwrap().insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    pub fn get_inner_wl(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.inner.write().unwrap()
    }
}
