//! Mapper for list shard maps: exact-key lookup over a concurrent hash map.

use dashmap::DashMap;
use std::time::Duration;

use crate::key::{ShardKey, ShardRange};
use crate::types::StoreMapping;

use super::entry::CacheEntry;
use super::{CachePolicy, CachedMapping, MappingMapper};

/// Point mapper keyed by the mapping's key value.
///
/// A point mapping covers `[key, key.next)`, so the exact key is the lower
/// bound and lookup is a single hash probe.
#[derive(Debug, Default)]
pub struct PointMapper {
    entries: DashMap<ShardKey, CacheEntry>,
}

impl PointMapper {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl MappingMapper for PointMapper {
    fn add_or_update(
        &self,
        mapping: StoreMapping,
        policy: CachePolicy,
        base_ttl: Duration,
        max_ttl: Duration,
    ) {
        let key = mapping.min_key.clone();
        if policy == CachePolicy::UpdateTimeToLive {
            // The ref guard must drop before the insert below touches the
            // same shard.
            if let Some(mut existing) = self.entries.get_mut(&key) {
                if existing.mapping().id == mapping.id {
                    existing.refresh(mapping, base_ttl, max_ttl);
                    return;
                }
            }
        }
        self.entries.insert(key, CacheEntry::new(mapping, base_ttl));
    }

    fn remove(&self, mapping: &StoreMapping) {
        self.entries.remove(&mapping.min_key);
    }

    fn lookup(&self, key: &ShardKey) -> Option<CachedMapping> {
        self.entries.get(key).map(|entry| CachedMapping {
            mapping: entry.mapping().clone(),
            is_expired: entry.is_expired(),
        })
    }

    fn lookup_range(&self, range: Option<&ShardRange>) -> Vec<CachedMapping> {
        let mut hits: Vec<CachedMapping> = self
            .entries
            .iter()
            .filter(|entry| range.map(|r| r.contains(entry.key())).unwrap_or(true))
            .map(|entry| CachedMapping {
                mapping: entry.value().mapping().clone(),
                is_expired: entry.value().is_expired(),
            })
            .collect();
        hits.sort_by(|a, b| a.mapping.min_key.cmp(&b.mapping.min_key));
        hits
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
