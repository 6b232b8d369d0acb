//! Catalog Caches
//!
//! Keyed in-memory stores shared between the catalog refresh routine
//! (writer) and every GetCatalog call (reader). Entries never expire; they
//! are overwritten by the next refresh.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

use super::types::ServiceDefinition;

/// Sentinel key under which the listing cache stores the service list
pub const LISTINGS_KEY: &str = "__LISTINGS__";

/// One entry of the service listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNeedsUpdate {
    /// Service name (catalog cache key)
    pub name: String,
    /// Whether the cached definition still has to be written to the data store
    pub update: bool,
}

impl ServiceNeedsUpdate {
    pub fn new(name: impl Into<String>, update: bool) -> Self {
        Self {
            name: name.into(),
            update,
        }
    }
}

/// Thread-safe key/value cache with no eviction
#[derive(Debug)]
pub struct Cache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the value stored under `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        // A poisoned lock still holds a consistent map: writes are single inserts.
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Store `value` under `key`, replacing any previous entry
    pub fn set(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, value);
    }

    /// Modify the entry under `key` in place, starting from the default
    /// value when absent. Runs under the write lock.
    pub fn update<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        f(entries.entry(key).or_default())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Service name -> published definition
pub type CatalogCache = Cache<String, ServiceDefinition>;

/// `LISTINGS_KEY` -> ordered service listing
pub type ListingCache = Cache<String, Vec<ServiceNeedsUpdate>>;

impl ListingCache {
    /// The current listing, empty when nothing has been published yet
    pub fn listings(&self) -> Vec<ServiceNeedsUpdate> {
        self.get(LISTINGS_KEY).unwrap_or_default()
    }

    pub fn set_listings(&self, listings: Vec<ServiceNeedsUpdate>) {
        self.set(LISTINGS_KEY.to_string(), listings);
    }

    /// Add `name` to the listing, or re-flag it, as needing persistence
    pub fn upsert(&self, name: &str) {
        self.update(LISTINGS_KEY.to_string(), |listings| {
            match listings.iter_mut().find(|entry| entry.name == name) {
                Some(entry) => entry.update = true,
                None => listings.push(ServiceNeedsUpdate::new(name, true)),
            }
        });
    }

    /// Clear the update flag of `name`; returns whether it was set
    pub fn take_update(&self, name: &str) -> bool {
        self.update(LISTINGS_KEY.to_string(), |listings| {
            match listings.iter_mut().find(|entry| entry.name == name) {
                Some(entry) if entry.update => {
                    entry.update = false;
                    true
                }
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_missing_key() {
        let cache: Cache<String, u32> = Cache::new();
        assert_eq!(cache.get("nope"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_overwrites() {
        let cache: Cache<String, u32> = Cache::new();
        cache.set("a".to_string(), 1);
        cache.set("a".to_string(), 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_listing_cache_defaults_to_empty() {
        let listing = ListingCache::new();
        assert!(listing.listings().is_empty());

        listing.set_listings(vec![ServiceNeedsUpdate::new("s3", false)]);
        assert_eq!(listing.listings(), vec![ServiceNeedsUpdate::new("s3", false)]);
    }

    #[test]
    fn test_upsert_and_take_update() {
        let listing = ListingCache::new();
        listing.upsert("s3");
        listing.upsert("sqs");
        listing.upsert("s3");
        assert_eq!(
            listing.listings(),
            vec![
                ServiceNeedsUpdate::new("s3", true),
                ServiceNeedsUpdate::new("sqs", true)
            ]
        );

        assert!(listing.take_update("s3"));
        assert!(!listing.take_update("s3"));
        assert!(!listing.take_update("missing"));
        assert_eq!(listing.listings()[0], ServiceNeedsUpdate::new("s3", false));
        assert_eq!(listing.listings().len(), 2);
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        let listing = Arc::new(ListingCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let listing = Arc::clone(&listing);
                std::thread::spawn(move || {
                    for j in 0..20 {
                        listing.upsert(&format!("svc-{}-{}", i, j));
                        listing.take_update(&format!("svc-{}-{}", (i + 1) % 8, j));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(listing.listings().len(), 160);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let cache: Arc<Cache<String, usize>> = Arc::new(Cache::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.set(format!("key-{}", i), j);
                        let _ = cache.get(&format!("key-{}", (i + 1) % 8));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 8);
        for i in 0..8 {
            assert_eq!(cache.get(&format!("key-{}", i)), Some(99));
        }
    }
}
