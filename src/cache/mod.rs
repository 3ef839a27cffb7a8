//! In-process mapping cache.
//!
//! Caches shard map rows by name and mapping rows per shard map, with a
//! point mapper for list maps and a range mapper for range maps. Entries
//! carry a time-to-live that backs off on revalidation; expiry flags an entry
//! stale instead of evicting it, so the caller decides when to go back to the
//! store.

mod entry;
mod point;
mod range;

pub use entry::CacheEntry;
pub use point::PointMapper;
pub use range::RangeMapper;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::key::{ShardKey, ShardRange};
use crate::types::{ShardMapId, ShardMapKind, StoreMapping, StoreShardMap};

/// How an insert treats an entry already cached for the same key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Replace the entry and reset its time-to-live to the base.
    OverwriteExisting,

    /// When the cached row is the same mapping, re-stamp it and grow its
    /// time-to-live; otherwise behave like [`CachePolicy::OverwriteExisting`].
    UpdateTimeToLive,
}

/// A cache hit: the mapping row plus whether its time-to-live has elapsed.
#[derive(Debug, Clone)]
pub struct CachedMapping {
    /// The cached mapping row, possibly stale.
    pub mapping: StoreMapping,

    /// Whether the entry's time-to-live has elapsed.
    pub is_expired: bool,
}

/// Lookup structure for the mappings of one shard map.
pub trait MappingMapper: Send + Sync + fmt::Debug {
    /// Insert or refresh a mapping row.
    fn add_or_update(
        &self,
        mapping: StoreMapping,
        policy: CachePolicy,
        base_ttl: Duration,
        max_ttl: Duration,
    );

    /// Drop every cached row covering the mapping's key space.
    fn remove(&self, mapping: &StoreMapping);

    /// Find the cached mapping covering a key.
    fn lookup(&self, key: &ShardKey) -> Option<CachedMapping>;

    /// Cached mappings intersecting `range`, ordered by lower bound; `None`
    /// means all.
    fn lookup_range(&self, range: Option<&ShardRange>) -> Vec<CachedMapping>;

    /// Drop all rows.
    fn clear(&self);

    /// Number of cached rows.
    fn len(&self) -> usize;
}

/// Cache over shard map rows and per-map mapping rows.
#[derive(Debug)]
pub struct CacheStore {
    base_ttl: Duration,
    max_ttl: Duration,
    shard_maps: RwLock<HashMap<String, StoreShardMap>>,
    mappers: DashMap<ShardMapId, Arc<dyn MappingMapper>>,
}

impl CacheStore {
    /// Create an empty cache with the given base and maximum time-to-live.
    pub fn new(base_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            base_ttl,
            max_ttl,
            shard_maps: RwLock::new(HashMap::new()),
            mappers: DashMap::new(),
        }
    }

    /// Cache a shard map row under its name.
    pub fn add_shard_map(&self, shard_map: StoreShardMap) {
        self.shard_maps
            .write()
            .insert(shard_map.name.clone(), shard_map);
    }

    /// Drop a shard map row and its mapper.
    pub fn remove_shard_map(&self, shard_map: &StoreShardMap) {
        self.shard_maps.write().remove(&shard_map.name);
        self.mappers.remove(&shard_map.id);
    }

    /// Cached shard map row by name.
    pub fn find_shard_map_by_name(&self, name: &str) -> Option<StoreShardMap> {
        self.shard_maps.read().get(name).cloned()
    }

    fn mapper_for(&self, shard_map_id: ShardMapId, kind: ShardMapKind) -> Arc<dyn MappingMapper> {
        Arc::clone(
            self.mappers
                .entry(shard_map_id)
                .or_insert_with(|| match kind {
                    ShardMapKind::List => Arc::new(PointMapper::new()) as Arc<dyn MappingMapper>,
                    ShardMapKind::Range => Arc::new(RangeMapper::new()) as Arc<dyn MappingMapper>,
                })
                .value(),
        )
    }

    /// Insert or refresh a mapping row in the mapper of its shard map.
    pub fn add_or_update_mapping(
        &self,
        mapping: StoreMapping,
        kind: ShardMapKind,
        policy: CachePolicy,
    ) {
        trace!(
            shard_map_id = %mapping.shard_map_id,
            mapping_id = %mapping.id,
            ?policy,
            "caching mapping"
        );
        self.mapper_for(mapping.shard_map_id, kind).add_or_update(
            mapping,
            policy,
            self.base_ttl,
            self.max_ttl,
        );
    }

    /// Drop cached rows covering the mapping's key space.
    pub fn remove_mapping(&self, mapping: &StoreMapping) {
        if let Some(mapper) = self.mappers.get(&mapping.shard_map_id) {
            mapper.remove(mapping);
        }
    }

    /// Find the cached mapping covering a key.
    pub fn lookup_mapping(&self, shard_map_id: ShardMapId, key: &ShardKey) -> Option<CachedMapping> {
        self.mappers
            .get(&shard_map_id)
            .and_then(|mapper| mapper.lookup(key))
    }

    /// Cached mappings of a map intersecting `range`, `None` meaning all.
    pub fn lookup_mappings_for_range(
        &self,
        shard_map_id: ShardMapId,
        range: Option<&ShardRange>,
    ) -> Vec<CachedMapping> {
        self.mappers
            .get(&shard_map_id)
            .map(|mapper| mapper.lookup_range(range))
            .unwrap_or_default()
    }

    /// Drop all cached mappings of one shard map.
    pub fn clear_map(&self, shard_map_id: ShardMapId) {
        if let Some(mapper) = self.mappers.get(&shard_map_id) {
            mapper.clear();
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.shard_maps.write().clear();
        self.mappers.clear();
    }

    /// Number of cached mapping rows across all maps. Test observability.
    pub fn mapping_count(&self) -> usize {
        self.mappers.iter().map(|m| m.len()).sum()
    }
}
