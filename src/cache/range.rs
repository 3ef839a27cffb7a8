//! Mapper for range shard maps: ordered lookup over non-overlapping ranges.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::key::{ShardKey, ShardRange};
use crate::types::StoreMapping;

use super::entry::CacheEntry;
use super::{CachePolicy, CachedMapping, MappingMapper};

/// Range mapper over an ordered map keyed by the covered range.
///
/// Ranges sort by lower then upper bound. A point lookup probes with the
/// degenerate range `[k, k)`, which sorts before every real range starting at
/// `k`, so both the ceiling (a range starting exactly at `k`) and the floor
/// (a range starting below `k` that may still cover it) must be checked.
#[derive(Debug, Default)]
pub struct RangeMapper {
    entries: RwLock<BTreeMap<ShardRange, CacheEntry>>,
}

impl RangeMapper {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn range_of(mapping: &StoreMapping) -> Option<ShardRange> {
        ShardRange::new(mapping.min_key.clone(), mapping.max_key.clone()).ok()
    }

    /// Ranges currently cached that overlap `[min, max)`.
    fn overlapping(
        entries: &BTreeMap<ShardRange, CacheEntry>,
        min: &ShardKey,
        max: &ShardKey,
    ) -> Vec<ShardRange> {
        // The probe [max, max) sorts before every range starting at max, so
        // the scan stops at ranges that are merely adjacent on the right.
        let upper_probe = ShardRange::point_probe(max.clone());
        entries
            .range(..upper_probe)
            .filter(|(range, _)| range.high() > min)
            .map(|(range, _)| range.clone())
            .collect()
    }
}

impl MappingMapper for RangeMapper {
    fn add_or_update(
        &self,
        mapping: StoreMapping,
        policy: CachePolicy,
        base_ttl: Duration,
        max_ttl: Duration,
    ) {
        let range = match Self::range_of(&mapping) {
            Some(range) => range,
            None => return,
        };
        let mut entries = self.entries.write();

        if policy == CachePolicy::UpdateTimeToLive {
            if let Some(existing) = entries.get_mut(&range) {
                if existing.mapping().id == mapping.id {
                    existing.refresh(mapping, base_ttl, max_ttl);
                    return;
                }
            }
        }

        // Cached rows overlapping the new one are stale by definition.
        for doomed in Self::overlapping(&entries, &mapping.min_key, &mapping.max_key) {
            entries.remove(&doomed);
        }
        entries.insert(range, CacheEntry::new(mapping, base_ttl));
    }

    fn remove(&self, mapping: &StoreMapping) {
        let mut entries = self.entries.write();
        for doomed in Self::overlapping(&entries, &mapping.min_key, &mapping.max_key) {
            entries.remove(&doomed);
        }
    }

    fn lookup(&self, key: &ShardKey) -> Option<CachedMapping> {
        let probe = ShardRange::point_probe(key.clone());
        let entries = self.entries.read();

        let hit = |entry: &CacheEntry| CachedMapping {
            mapping: entry.mapping().clone(),
            is_expired: entry.is_expired(),
        };

        // Ceiling: a range starting exactly at the key.
        if let Some((range, entry)) = entries.range(probe.clone()..).next() {
            if range.low() == key {
                return Some(hit(entry));
            }
        }
        // Floor: the nearest range starting below the key.
        if let Some((range, entry)) = entries.range(..probe).next_back() {
            if range.contains(key) {
                return Some(hit(entry));
            }
        }
        None
    }

    fn lookup_range(&self, range: Option<&ShardRange>) -> Vec<CachedMapping> {
        let entries = self.entries.read();
        let hit = |entry: &CacheEntry| CachedMapping {
            mapping: entry.mapping().clone(),
            is_expired: entry.is_expired(),
        };
        match range {
            None => entries.values().map(hit).collect(),
            Some(r) => {
                let upper_probe = ShardRange::point_probe(r.high().clone());
                entries
                    .range(..upper_probe)
                    .filter(|(cached, _)| cached.high() > r.low())
                    .map(|(_, entry)| hit(entry))
                    .collect()
            }
        }
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ShardLocation, StoreShard};
    use uuid::Uuid;

    fn range_mapping(low: i64, high: Option<i64>) -> StoreMapping {
        let map_id = Uuid::new_v4();
        let shard = StoreShard::new(map_id, ShardLocation::new("srv1", "db1"));
        let max = match high {
            Some(v) => ShardKey::new_int64(v),
            None => ShardKey::max(crate::key::ShardKeyType::Int64),
        };
        StoreMapping::new(map_id, shard, ShardKey::new_int64(low), max)
    }

    fn add(mapper: &RangeMapper, mapping: &StoreMapping) {
        mapper.add_or_update(
            mapping.clone(),
            CachePolicy::OverwriteExisting,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
    }

    #[test]
    fn test_lookup_hits_both_probe_sides() {
        let mapper = RangeMapper::new();
        let mapping = range_mapping(10, Some(20));
        add(&mapper, &mapping);

        // Exact lower bound resolves via the ceiling probe.
        let hit = mapper.lookup(&ShardKey::new_int64(10)).unwrap();
        assert_eq!(hit.mapping.id, mapping.id);

        // Interior key resolves via the floor probe.
        let hit = mapper.lookup(&ShardKey::new_int64(15)).unwrap();
        assert_eq!(hit.mapping.id, mapping.id);

        // Exclusive upper bound misses.
        assert!(mapper.lookup(&ShardKey::new_int64(20)).is_none());
        assert!(mapper.lookup(&ShardKey::new_int64(9)).is_none());
    }

    #[test]
    fn test_unbounded_range_covers_everything_above() {
        let mapper = RangeMapper::new();
        let mapping = range_mapping(100, None);
        add(&mapper, &mapping);

        let hit = mapper.lookup(&ShardKey::new_int64(i64::MAX)).unwrap();
        assert_eq!(hit.mapping.id, mapping.id);
        assert!(mapper.lookup(&ShardKey::new_int64(99)).is_none());
    }

    #[test]
    fn test_overwrite_evicts_overlapping_rows() {
        let mapper = RangeMapper::new();
        add(&mapper, &range_mapping(0, Some(10)));
        add(&mapper, &range_mapping(10, Some(20)));
        assert_eq!(mapper.len(), 2);

        // A new row spanning both replaces them.
        let wide = range_mapping(5, Some(15));
        add(&mapper, &wide);
        assert_eq!(mapper.len(), 1);
        let hit = mapper.lookup(&ShardKey::new_int64(12)).unwrap();
        assert_eq!(hit.mapping.id, wide.id);
    }

    #[test]
    fn test_adjacent_rows_survive_overwrite() {
        let mapper = RangeMapper::new();
        let left = range_mapping(0, Some(10));
        let right = range_mapping(20, Some(30));
        add(&mapper, &left);
        add(&mapper, &right);

        // [10, 20) touches both boundaries without overlapping either.
        add(&mapper, &range_mapping(10, Some(20)));
        assert_eq!(mapper.len(), 3);
    }

    #[test]
    fn test_remove_evicts_every_intersecting_row() {
        let mapper = RangeMapper::new();
        for (low, high) in [(0, 10), (10, 20), (20, 30)] {
            add(&mapper, &range_mapping(low, Some(high)));
        }

        // A removal spanning [5, 25) intersects all three cached rows.
        let stale = range_mapping(5, Some(25));
        mapper.remove(&stale);
        assert_eq!(mapper.len(), 0);

        let replacement = range_mapping(5, Some(25));
        add(&mapper, &replacement);
        let hit = mapper.lookup(&ShardKey::new_int64(15)).unwrap();
        assert_eq!(hit.mapping.id, replacement.id);
    }

    #[test]
    fn test_lookup_range_returns_ordered_intersections() {
        let mapper = RangeMapper::new();
        for (low, high) in [(0, 10), (10, 20), (30, 40)] {
            add(&mapper, &range_mapping(low, Some(high)));
        }

        let probe = ShardRange::new(ShardKey::new_int64(5), ShardKey::new_int64(35)).unwrap();
        let hits = mapper.lookup_range(Some(&probe));
        assert_eq!(hits.len(), 3);
        assert!(hits[0].mapping.min_key < hits[1].mapping.min_key);

        let narrow = ShardRange::new(ShardKey::new_int64(20), ShardKey::new_int64(30)).unwrap();
        assert!(mapper.lookup_range(Some(&narrow)).is_empty());

        assert_eq!(mapper.lookup_range(None).len(), 3);
    }

    #[test]
    fn test_remove_clears_covering_rows() {
        let mapper = RangeMapper::new();
        let mapping = range_mapping(0, Some(10));
        add(&mapper, &mapping);

        mapper.remove(&mapping);
        assert!(mapper.lookup(&ShardKey::new_int64(5)).is_none());
        assert_eq!(mapper.len(), 0);
    }
}
