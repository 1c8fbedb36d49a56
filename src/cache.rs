#![allow(clippy::multiple_bound_locations)]
//! Bounded caches shared by the storage engine, the chain store and the
//! remote storage adapter
//!
//! Reads use `peek`, so an LRU-backed cache evicts the oldest inserted entry
//! rather than the least recently read one.
use crate::storage::AccountState;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub use std::hash::Hash;

/// A trait for generic cache operations.
/// It uses `std::borrow::Borrow` to allow getting/removing elements without cloning the key.
pub trait CacheInner<K, V> {
    /// Retrieve a value without touching recency.
    fn get_non_mut<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq;

    fn put(&mut self, key: K, value: V);

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove<Q: ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq;
}

impl<K, V> CacheInner<K, V> for LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn get_non_mut<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.peek(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.put(key, value);
    }

    fn clear(&mut self) {
        self.clear();
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn remove<Q: ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.pop(key)
    }
}

// Unbounded map for caches that are cleared wholesale instead of evicting.
impl<K, V> CacheInner<K, V> for HashMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn get_non_mut<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.get(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.insert(key, value);
    }

    fn clear(&mut self) {
        self.clear();
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn remove<Q: ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.remove(key)
    }
}

/// Generic, thread-safe cache wrapper. The lock is never held across an
/// await point, so async callers can use it directly.
pub struct ThreadSafeCache<K, V, T: CacheInner<K, V>> {
    cache: Arc<RwLock<T>>,
    _phantom_k: PhantomData<K>,
    _phantom_v: PhantomData<V>,
}

impl<K, V, T: CacheInner<K, V>> ThreadSafeCache<K, V, T>
where
    K: Hash + Eq + Clone,
    V: Clone,
    T: Default,
{
    pub fn new_default() -> Self {
        Self {
            cache: Arc::new(RwLock::new(T::default())),
            _phantom_k: PhantomData,
            _phantom_v: PhantomData,
        }
    }
}

impl<K, V> ThreadSafeCache<K, V, LruCache<K, V>>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a bounded cache. A capacity of 0 is treated as 1.
    pub fn new_lru(capacity: usize) -> Self {
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity_nz))),
            _phantom_k: PhantomData,
            _phantom_v: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.read().cap().get()
    }
}

impl<K, V, T: CacheInner<K, V>> ThreadSafeCache<K, V, T>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn get<Q: ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.cache.read().get_non_mut(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.cache.write().put(key, value);
    }

    pub fn remove<Q: ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq,
    {
        self.cache.write().remove(key)
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl<K, V, T: CacheInner<K, V>> Clone for ThreadSafeCache<K, V, T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            _phantom_k: PhantomData,
            _phantom_v: PhantomData,
        }
    }
}

/// Storage engine record cache keyed by `(collection, key)`.
pub type RecordCache = ThreadSafeCache<(String, String), String, LruCache<(String, String), String>>;

impl RecordCache {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self::new_lru(capacity)
    }

    /// Drops every cached record of one collection.
    pub fn invalidate_collection(&self, collection: &str) {
        let mut cache = self.cache.write();
        let stale: Vec<(String, String)> = cache
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.len(), self.capacity())
    }
}

/// Remote read responses keyed by `operation:hash`.
pub type ResponseCache = ThreadSafeCache<String, serde_json::Value, LruCache<String, serde_json::Value>>;

impl ResponseCache {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new(capacity: usize) -> Self {
        Self::new_lru(capacity)
    }
}

/// Account states derived by the chain store. Cleared on maintenance.
pub type AccountStateCache = ThreadSafeCache<String, AccountState, HashMap<String, AccountState>>;

impl AccountStateCache {
    pub fn new() -> Self {
        Self::new_default()
    }

    pub fn invalidate(&self, address: &str) -> Option<AccountState> {
        self.remove(address)
    }

    pub fn invalidate_all(&self) {
        self.clear();
    }
}

impl Default for AccountStateCache {
    fn default() -> Self {
        Self::new()
    }
}
