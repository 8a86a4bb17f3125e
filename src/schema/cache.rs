//! LRU + TTL cache in front of schema lookups.
//!
//! ## Invariants
//!
//! - An entry older than the TTL is never returned; it is dropped on access.
//! - Capacity eviction is strict LRU (the `lru` crate's order), whether or not
//!   the evicted entry has expired.
//! - A backfill fetched before an invalidation is discarded, so a concurrent
//!   redefinition never leaves a stale definition cached.
//!
//! The cache sits behind a `parking_lot::Mutex` because promotion on a hit
//! mutates the recency list.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

use super::definition::{EntityType, RelationType};
use super::registry::{SchemaLookup, SchemaRegistry};

/// Configuration for the schema cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Maximum number of entries per cache.
    pub capacity: usize,
    /// Time-to-live of an entry in milliseconds.
    pub ttl_ms: u64,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_024,
            ttl_ms: 300_000,
        }
    }
}

impl SchemaCacheConfig {
    /// TTL as a `Duration`.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to the registry.
    pub misses: u64,
    /// Misses caused by an expired entry.
    pub expirations: u64,
    /// Current number of entries in the cache.
    pub len: usize,
    /// Maximum capacity of the cache.
    pub cap: usize,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Bounded LRU cache whose entries expire after a fixed TTL.
pub struct TtlLruCache<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    /// Bumped under the entry lock by every invalidation.
    generation: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> TtlLruCache<K, V> {
    /// Create a cache. A zero capacity is raised to 1.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(size)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Invalidation counter; pass it to [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert unless an invalidation happened since `generation` was read.
    /// Returns whether the value was cached.
    pub fn insert_if_current(&self, key: K, value: V, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Look up a live entry, promoting it to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or refresh an entry; evicts the least recently used on overflow.
    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop an entry.
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.pop(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// Whether an entry (live or expired) is resident, without promoting it.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains(key)
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            len: entries.len(),
            cap: entries.cap().get(),
        }
    }
}

/// Schema registry fronted by entity and relation type caches.
///
/// Misses and expiries fall through to the registry and backfill the cache;
/// redefinitions invalidate the cached entry.
pub struct CachedSchemaRegistry {
    registry: Arc<SchemaRegistry>,
    entity_types: TtlLruCache<String, Arc<EntityType>>,
    relation_types: TtlLruCache<String, Arc<RelationType>>,
}

impl CachedSchemaRegistry {
    /// Wrap a registry.
    pub fn new(registry: Arc<SchemaRegistry>, config: &SchemaCacheConfig) -> Self {
        Self {
            registry,
            entity_types: TtlLruCache::new(config.capacity, config.ttl()),
            relation_types: TtlLruCache::new(config.capacity, config.ttl()),
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Register an entity type and warm the cache.
    pub fn create_entity_type(&self, def: EntityType) -> Result<Arc<EntityType>> {
        let def = self.registry.create_entity_type(def)?;
        self.entity_types.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// Redefine an entity type and invalidate its cached copy.
    pub fn redefine_entity_type(&self, def: EntityType, expected_version: u32) -> Result<Arc<EntityType>> {
        let name = def.name.clone();
        let result = self.registry.redefine_entity_type(def, expected_version);
        self.entity_types.invalidate(&name);
        result
    }

    /// Cached entity type lookup.
    pub fn get_entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        let key = name.to_string();
        if let Some(def) = self.entity_types.get(&key) {
            return Ok(def);
        }
        debug!(entity_type = name, "Schema cache miss");
        let generation = self.entity_types.generation();
        let def = self.registry.get_entity_type(name)?;
        self.entity_types.insert_if_current(key, Arc::clone(&def), generation);
        Ok(def)
    }

    /// Register a relation type and warm the cache.
    pub fn create_relation_type(&self, def: RelationType) -> Result<Arc<RelationType>> {
        let def = self.registry.create_relation_type(def)?;
        self.relation_types.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// Redefine a relation type and invalidate its cached copy.
    pub fn redefine_relation_type(&self, def: RelationType, expected_version: u32) -> Result<Arc<RelationType>> {
        let name = def.name.clone();
        let result = self.registry.redefine_relation_type(def, expected_version);
        self.relation_types.invalidate(&name);
        result
    }

    /// Cached relation type lookup.
    pub fn get_relation_type(&self, name: &str) -> Result<Arc<RelationType>> {
        let key = name.to_string();
        if let Some(def) = self.relation_types.get(&key) {
            return Ok(def);
        }
        debug!(relation_type = name, "Schema cache miss");
        let generation = self.relation_types.generation();
        let def = self.registry.get_relation_type(name)?;
        self.relation_types.insert_if_current(key, Arc::clone(&def), generation);
        Ok(def)
    }

    /// Entity type cache statistics.
    pub fn entity_cache_stats(&self) -> CacheStats {
        self.entity_types.stats()
    }

    /// Relation type cache statistics.
    pub fn relation_cache_stats(&self) -> CacheStats {
        self.relation_types.stats()
    }

    /// Drop every cached definition.
    pub fn clear(&self) {
        self.entity_types.clear();
        self.relation_types.clear();
    }
}

impl SchemaLookup for CachedSchemaRegistry {
    fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.get_entity_type(name)
    }

    fn relation_type(&self, name: &str) -> Result<Arc<RelationType>> {
        self.get_relation_type(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertySchema;

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_never_returned() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4, Duration::from_secs(10));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(!cache.contains(&"a"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_is_strict_lru_regardless_of_ttl() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(2, Duration::from_secs(10));
        cache.insert("old", 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.insert("new", 2);

        // Touch "old" so "new" becomes least recently used, even though "old"
        // is closer to expiry.
        assert_eq!(cache.get(&"old"), Some(1));
        cache.insert("third", 3);

        assert!(cache.contains(&"old"));
        assert!(!cache.contains(&"new"));
        assert!(cache.contains(&"third"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_racing_a_redefinition_is_dropped() {
        let registry = Arc::new(SchemaRegistry::new());
        registry.create_entity_type(EntityType::new("Person")).unwrap();
        let cached = CachedSchemaRegistry::new(Arc::clone(&registry), &SchemaCacheConfig::default());

        // A lookup misses and reads the old definition...
        let generation = cached.entity_types.generation();
        let stale = registry.get_entity_type("Person").unwrap();
        // ...while a redefinition commits and invalidates.
        cached
            .redefine_entity_type(EntityType::new("Person").with_description("v2"), 1)
            .unwrap();

        assert!(!cached
            .entity_types
            .insert_if_current("Person".to_string(), stale, generation));
        assert_eq!(cached.get_entity_type("Person").unwrap().version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_registry_backfills_and_invalidates() {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .create_entity_type(EntityType::new("Person").with_property("age", PropertySchema::integer()))
            .unwrap();

        let cached = CachedSchemaRegistry::new(Arc::clone(&registry), &SchemaCacheConfig::default());
        cached.get_entity_type("Person").unwrap();
        cached.get_entity_type("Person").unwrap();
        let stats = cached.entity_cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));

        cached
            .redefine_entity_type(EntityType::new("Person").with_property("age", PropertySchema::float()), 1)
            .unwrap();
        assert_eq!(cached.get_entity_type("Person").unwrap().version, 2);

        tokio::time::advance(SchemaCacheConfig::default().ttl()).await;
        cached.get_entity_type("Person").unwrap();
        assert_eq!(cached.entity_cache_stats().expirations, 1);
    }
}
