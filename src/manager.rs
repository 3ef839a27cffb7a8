//! The shard map manager facade.
//!
//! Entry point tying the pieces together: the global store directory of
//! shard maps, the Do/Undo executor for mutations, the mapping cache for
//! lookups, and per-map named locks that serialize mutations of one map
//! without blocking the others.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::cache::{CachePolicy, CacheStore};
use crate::config::ShardMapManagerConfig;
use crate::error::{Result, ShardManagementError};
use crate::key::{ShardKey, ShardKeyType, ShardRange};
use crate::operation::{OperationExecutor, StoreOperation};
use crate::retry::RetryPolicy;
use crate::store::{StoreConnectionFactory, StoreRequest, StoreResultCode, StoreResults};
use crate::sync::NamedLockRegistry;
use crate::types::{
    LockOwnerId, MappingStatus, ShardLocation, ShardMapId, ShardMapKind, ShardStatus,
    StoreMapping, StoreShard, StoreShardMap,
};

/// Where a mapping lookup is allowed to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOptions {
    /// Only the store; the cache is bypassed and refreshed with the result.
    LookupInStore,

    /// Only the cache; a miss is an error, a stale hit is returned as is.
    LookupInCache,

    /// The cache first; a miss or a stale hit falls through to the store and
    /// refreshes the cache.
    LookupInCacheThenStore,
}

/// Manages shard maps, shards and mappings across a global store and
/// per-shard local stores.
#[derive(Debug)]
pub struct ShardMapManager {
    factory: Arc<dyn StoreConnectionFactory>,
    cache: Arc<CacheStore>,
    executor: OperationExecutor,
    retry: RetryPolicy,
    locks: NamedLockRegistry<ShardMapId>,
}

impl ShardMapManager {
    /// Create a manager over the given store connection factory.
    pub fn new(factory: Arc<dyn StoreConnectionFactory>, config: ShardMapManagerConfig) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache.base_ttl, config.cache.max_ttl));
        let executor = OperationExecutor::new(
            Arc::clone(&factory),
            config.retry.build_policy(),
            Arc::clone(&cache),
        );
        Self {
            factory,
            cache,
            executor,
            retry: config.retry.build_policy(),
            locks: NamedLockRegistry::new(),
        }
    }

    // Shard map directory -------------------------------------------------

    /// Create a shard map with the given name, kind and key type.
    #[instrument(skip(self))]
    pub async fn create_shard_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> Result<StoreShardMap> {
        let shard_map = StoreShardMap::new(name, kind, key_type);
        let results = self
            .global_request(StoreRequest::AddShardMap {
                shard_map: shard_map.clone(),
            })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, name));
        }
        self.cache.add_shard_map(shard_map.clone());
        info!(name, %kind, "created shard map");
        Ok(shard_map)
    }

    /// Look up a shard map by name, trying the cache first.
    pub async fn get_shard_map(&self, name: &str) -> Result<StoreShardMap> {
        if let Some(shard_map) = self.cache.find_shard_map_by_name(name) {
            return Ok(shard_map);
        }
        let results = self
            .global_request(StoreRequest::FindShardMapByName { name: name.into() })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, name));
        }
        let shard_map = results
            .shard_maps
            .into_iter()
            .next()
            .ok_or(ShardManagementError::UnexpectedStoreError {
                code: StoreResultCode::Failure,
            })?;
        self.cache.add_shard_map(shard_map.clone());
        Ok(shard_map)
    }

    /// Enumerate all shard maps in the global store.
    pub async fn get_shard_maps(&self) -> Result<Vec<StoreShardMap>> {
        let results = self.global_request(StoreRequest::GetAllShardMaps).await?;
        Ok(results.shard_maps)
    }

    /// Remove an empty shard map.
    #[instrument(skip(self, shard_map), fields(name = %shard_map.name))]
    pub async fn delete_shard_map(&self, shard_map: &StoreShardMap) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let results = self
            .global_request(StoreRequest::RemoveShardMap {
                shard_map: shard_map.clone(),
            })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, &shard_map.name));
        }
        self.cache.remove_shard_map(shard_map);
        info!(name = %shard_map.name, "deleted shard map");
        Ok(())
    }

    // Shards ---------------------------------------------------------------

    /// Register a shard at `location` in the map.
    #[instrument(skip(self, shard_map), fields(name = %shard_map.name))]
    pub async fn add_shard(
        &self,
        shard_map: &StoreShardMap,
        location: ShardLocation,
    ) -> Result<StoreShard> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let shard = StoreShard::new(shard_map.id, location);
        self.executor
            .execute(&StoreOperation::add_shard(shard_map.clone(), shard.clone()))
            .await?;
        Ok(shard)
    }

    /// Remove a shard that has no mappings. The shard row version guards
    /// against concurrent modification.
    pub async fn remove_shard(&self, shard_map: &StoreShardMap, shard: StoreShard) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        self.executor
            .execute(&StoreOperation::remove_shard(shard_map.clone(), shard))
            .await?;
        Ok(())
    }

    /// Change a shard's availability status, bumping its version.
    pub async fn update_shard_status(
        &self,
        shard_map: &StoreShardMap,
        shard: StoreShard,
        status: ShardStatus,
    ) -> Result<StoreShard> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let mut updated = shard.next_version();
        updated.status = status;
        self.executor
            .execute(&StoreOperation::update_shard(
                shard_map.clone(),
                shard,
                updated.clone(),
            ))
            .await?;
        Ok(updated)
    }

    /// Enumerate the shards of a map.
    pub async fn get_shards(&self, shard_map: &StoreShardMap) -> Result<Vec<StoreShard>> {
        let results = self
            .global_request(StoreRequest::GetShardsForMap {
                shard_map: shard_map.clone(),
            })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, &shard_map.name));
        }
        Ok(results.shards)
    }

    // Mappings -------------------------------------------------------------

    /// Map a single key value to a shard (list maps only). The mapping
    /// covers `[key, key.next)`.
    #[instrument(skip(self, shard_map, shard), fields(name = %shard_map.name, %key))]
    pub async fn create_point_mapping(
        &self,
        shard_map: &StoreShardMap,
        key: ShardKey,
        shard: StoreShard,
    ) -> Result<StoreMapping> {
        Self::check_kind(shard_map, ShardMapKind::List)?;
        Self::check_key_type(shard_map, &key)?;
        let max_key = key.next_key()?;
        self.add_mapping(shard_map, shard, key, max_key).await
    }

    /// Map a key range to a shard (range maps only).
    #[instrument(skip(self, shard_map, shard), fields(name = %shard_map.name, %range))]
    pub async fn create_range_mapping(
        &self,
        shard_map: &StoreShardMap,
        range: ShardRange,
        shard: StoreShard,
    ) -> Result<StoreMapping> {
        Self::check_kind(shard_map, ShardMapKind::Range)?;
        Self::check_key_type(shard_map, range.low())?;
        let (low, high) = range.into_keys();
        self.add_mapping(shard_map, shard, low, high).await
    }

    async fn add_mapping(
        &self,
        shard_map: &StoreShardMap,
        shard: StoreShard,
        min_key: ShardKey,
        max_key: ShardKey,
    ) -> Result<StoreMapping> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let mapping = StoreMapping::new(shard_map.id, shard, min_key, max_key);
        self.executor
            .execute(&StoreOperation::add_mapping(
                shard_map.clone(),
                mapping.clone(),
            ))
            .await?;
        Ok(mapping)
    }

    /// Remove a mapping. The mapping must be offline; `lock_owner` must match
    /// when the mapping is locked.
    pub async fn remove_mapping(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        self.executor
            .execute(&StoreOperation::remove_mapping(
                shard_map.clone(),
                mapping,
                lock_owner,
            ))
            .await?;
        Ok(())
    }

    /// Take a mapping offline, fencing it against lookups by policy.
    pub async fn mark_mapping_offline(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Result<StoreMapping> {
        self.update_mapping_status(shard_map, mapping, MappingStatus::Offline, lock_owner)
            .await
    }

    /// Bring a mapping back online.
    pub async fn mark_mapping_online(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Result<StoreMapping> {
        self.update_mapping_status(shard_map, mapping, MappingStatus::Online, lock_owner)
            .await
    }

    async fn update_mapping_status(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        status: MappingStatus,
        lock_owner: LockOwnerId,
    ) -> Result<StoreMapping> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let mut updated = mapping.clone();
        updated.status = status;
        self.executor
            .execute(&StoreOperation::update_mapping(
                shard_map.clone(),
                mapping,
                updated.clone(),
                lock_owner,
            ))
            .await?;
        Ok(updated)
    }

    /// Move an offline mapping's key space to a different shard.
    #[instrument(skip_all, fields(name = %shard_map.name, mapping_id = %mapping.id))]
    pub async fn move_mapping(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        target_shard: StoreShard,
        lock_owner: LockOwnerId,
    ) -> Result<StoreMapping> {
        let _guard = self.locks.acquire(shard_map.id).await;
        let mut moved = mapping.clone();
        moved.shard = target_shard;
        self.executor
            .execute(&StoreOperation::update_mapping(
                shard_map.clone(),
                mapping,
                moved.clone(),
                lock_owner,
            ))
            .await?;
        Ok(moved)
    }

    /// Split a range mapping in two at `split_key`, which must fall strictly
    /// inside the mapping's range. Both halves stay on the same shard and
    /// keep the mapping's status.
    #[instrument(skip_all, fields(name = %shard_map.name, mapping_id = %mapping.id, %split_key))]
    pub async fn split_mapping(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        split_key: ShardKey,
        lock_owner: LockOwnerId,
    ) -> Result<(StoreMapping, StoreMapping)> {
        Self::check_kind(shard_map, ShardMapKind::Range)?;
        Self::check_key_type(shard_map, &split_key)?;
        if !(split_key > mapping.min_key && split_key < mapping.max_key) {
            return Err(ShardManagementError::SplitKeyOutOfRange);
        }

        let _guard = self.locks.acquire(shard_map.id).await;
        let mut left = StoreMapping::new(
            shard_map.id,
            mapping.shard.clone(),
            mapping.min_key.clone(),
            split_key.clone(),
        );
        let mut right = StoreMapping::new(
            shard_map.id,
            mapping.shard.clone(),
            split_key,
            mapping.max_key.clone(),
        );
        left.status = mapping.status;
        right.status = mapping.status;
        left.lock_owner_id = mapping.lock_owner_id;
        right.lock_owner_id = mapping.lock_owner_id;

        self.executor
            .execute(&StoreOperation::split_mapping(
                shard_map.clone(),
                mapping,
                [left.clone(), right.clone()],
                lock_owner,
            ))
            .await?;
        Ok((left, right))
    }

    /// Merge two adjacent range mappings on the same shard into one.
    #[instrument(skip_all, fields(name = %shard_map.name))]
    pub async fn merge_mappings(
        &self,
        shard_map: &StoreShardMap,
        left: StoreMapping,
        right: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Result<StoreMapping> {
        Self::check_kind(shard_map, ShardMapKind::Range)?;
        if left.max_key != right.min_key {
            return Err(ShardManagementError::RangesNotAdjacent);
        }
        if left.shard.id != right.shard.id {
            return Err(ShardManagementError::MappingsNotOnSameShard);
        }

        let _guard = self.locks.acquire(shard_map.id).await;
        let mut merged = StoreMapping::new(
            shard_map.id,
            left.shard.clone(),
            left.min_key.clone(),
            right.max_key.clone(),
        );
        merged.status = left.status;

        self.executor
            .execute(&StoreOperation::merge_mappings(
                shard_map.clone(),
                [left, right],
                merged.clone(),
                lock_owner,
            ))
            .await?;
        Ok(merged)
    }

    // Mapping locks ---------------------------------------------------------

    /// Lock a mapping for `owner`. Only the same token (or force-unlock) may
    /// mutate or unlock it afterwards.
    pub async fn lock_mapping(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        owner: LockOwnerId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        self.executor
            .execute(&StoreOperation::lock_mapping(
                shard_map.clone(),
                mapping,
                owner,
            ))
            .await?;
        Ok(())
    }

    /// Release a mapping lock held by `owner`.
    pub async fn unlock_mapping(
        &self,
        shard_map: &StoreShardMap,
        mapping: StoreMapping,
        owner: LockOwnerId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        self.executor
            .execute(&StoreOperation::unlock_mapping(
                shard_map.clone(),
                mapping,
                owner,
            ))
            .await?;
        Ok(())
    }

    /// Release every lock held by `owner` across the map. With
    /// [`LockOwnerId::FORCE_UNLOCK`], release every lock of the map.
    pub async fn unlock_all_mappings(
        &self,
        shard_map: &StoreShardMap,
        owner: LockOwnerId,
    ) -> Result<()> {
        let _guard = self.locks.acquire(shard_map.id).await;
        self.executor
            .execute(&StoreOperation::unlock_all_mappings(shard_map.clone(), owner))
            .await?;
        Ok(())
    }

    // Lookups ---------------------------------------------------------------

    /// Resolve the mapping covering `key`.
    pub async fn lookup_mapping(
        &self,
        shard_map: &StoreShardMap,
        key: &ShardKey,
        options: LookupOptions,
    ) -> Result<StoreMapping> {
        Self::check_key_type(shard_map, key)?;

        let cached = match options {
            LookupOptions::LookupInStore => None,
            _ => self.cache.lookup_mapping(shard_map.id, key),
        };

        if let Some(hit) = &cached {
            if options == LookupOptions::LookupInCache || !hit.is_expired {
                return Ok(hit.mapping.clone());
            }
            debug!(name = %shard_map.name, "cached mapping expired, revalidating");
        } else if options == LookupOptions::LookupInCache {
            return Err(ShardManagementError::MappingNotFoundForKey {
                shard_map: shard_map.name.clone(),
            });
        }

        let results = self
            .global_request(StoreRequest::FindMappingForKey {
                shard_map: shard_map.clone(),
                key: key.clone(),
            })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, &shard_map.name));
        }
        let mapping = results
            .mappings
            .into_iter()
            .next()
            .ok_or(ShardManagementError::UnexpectedStoreError {
                code: StoreResultCode::Failure,
            })?;

        // Revalidation of an unchanged row grows its time-to-live; anything
        // else resets it.
        let policy = match &cached {
            Some(hit) if hit.mapping.id == mapping.id => CachePolicy::UpdateTimeToLive,
            _ => CachePolicy::OverwriteExisting,
        };
        self.cache
            .add_or_update_mapping(mapping.clone(), shard_map.kind, policy);
        Ok(mapping)
    }

    /// Enumerate mappings of a map, optionally restricted to a range and/or
    /// a shard, ordered by lower bound.
    pub async fn get_mappings(
        &self,
        shard_map: &StoreShardMap,
        range: Option<ShardRange>,
        shard: Option<StoreShard>,
    ) -> Result<Vec<StoreMapping>> {
        let results = self
            .global_request(StoreRequest::GetMappingsForRange {
                shard_map: shard_map.clone(),
                range,
                shard,
            })
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(Self::directory_error(results.code, &shard_map.name));
        }
        Ok(results.mappings)
    }

    // Recovery ---------------------------------------------------------------

    /// Find operations a previous process left unfinished and roll each one
    /// back. Returns the number of operations resumed.
    #[instrument(skip(self))]
    pub async fn resume_pending_operations(&self) -> Result<usize> {
        let results = self
            .global_request(StoreRequest::GetPendingOperations)
            .await?;
        let count = results.operations.len();
        for entry in results.operations {
            self.executor.resume(entry).await?;
        }
        if count > 0 {
            info!(count, "resumed pending operations");
        }
        Ok(count)
    }

    /// Drop every cached row. Lookups repopulate from the store.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // Helpers ----------------------------------------------------------------

    async fn global_request(&self, request: StoreRequest) -> Result<StoreResults> {
        let global = self.factory.global();
        self.retry
            .execute(|| {
                let global = Arc::clone(&global);
                let request = request.clone();
                async move { global.execute(&request).await }
            })
            .await
            .map_err(|source| ShardManagementError::StorageOperationFailure { source })
    }

    fn directory_error(code: StoreResultCode, name: &str) -> ShardManagementError {
        match code {
            StoreResultCode::ShardMapExists => ShardManagementError::ShardMapAlreadyExists {
                name: name.into(),
            },
            StoreResultCode::ShardMapDoesNotExist => ShardManagementError::ShardMapDoesNotExist {
                name: name.into(),
            },
            StoreResultCode::ShardMapHasShards => ShardManagementError::ShardMapHasShards {
                name: name.into(),
            },
            StoreResultCode::MappingNotFoundForKey => {
                ShardManagementError::MappingNotFoundForKey {
                    shard_map: name.into(),
                }
            }
            StoreResultCode::StoreVersionMismatch => ShardManagementError::StoreVersionMismatch,
            other => ShardManagementError::UnexpectedStoreError { code: other },
        }
    }

    fn check_kind(shard_map: &StoreShardMap, expected: ShardMapKind) -> Result<()> {
        if shard_map.kind != expected {
            return Err(ShardManagementError::ShardMapKindMismatch {
                name: shard_map.name.clone(),
                kind: shard_map.kind,
            });
        }
        Ok(())
    }

    fn check_key_type(shard_map: &StoreShardMap, key: &ShardKey) -> Result<()> {
        if key.key_type() != shard_map.key_type {
            return Err(ShardManagementError::KeyTypeMismatch {
                left: shard_map.key_type,
                right: key.key_type(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStoreFactory;
    use crate::store::{OperationPhase, StoreOperationState};

    fn manager() -> (ShardMapManager, Arc<InMemoryStoreFactory>) {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let manager = ShardMapManager::new(
            Arc::clone(&factory) as Arc<dyn StoreConnectionFactory>,
            ShardMapManagerConfig::default(),
        );
        (manager, factory)
    }

    #[tokio::test]
    async fn test_shard_map_lifecycle() {
        let (manager, _) = manager();

        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();

        let err = manager
            .create_shard_map("orders", ShardMapKind::List, ShardKeyType::Int32)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::ShardMapAlreadyExists { .. }
        ));

        let found = manager.get_shard_map("orders").await.unwrap();
        assert_eq!(found.id, map.id);

        manager.delete_shard_map(&map).await.unwrap();
        let err = manager.get_shard_map("orders").await.unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::ShardMapDoesNotExist { .. }
        ));
    }

    #[tokio::test]
    async fn test_shard_location_is_exclusive() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();

        let location = ShardLocation::new("srv1", "db1");
        manager.add_shard(&map, location.clone()).await.unwrap();

        let err = manager.add_shard(&map, location).await.unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::ShardLocationConflict { .. }
        ));
        assert_eq!(manager.get_shards(&map).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_point_mapping_on_list_map() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("tenants", ShardMapKind::List, ShardKeyType::Int32)
            .await
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();

        manager
            .create_point_mapping(&map, ShardKey::new_int32(7), shard.clone())
            .await
            .unwrap();

        let hit = manager
            .lookup_mapping(&map, &ShardKey::new_int32(7), LookupOptions::LookupInCacheThenStore)
            .await
            .unwrap();
        assert_eq!(hit.shard.id, shard.id);

        let err = manager
            .lookup_mapping(&map, &ShardKey::new_int32(8), LookupOptions::LookupInCacheThenStore)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::MappingNotFoundForKey { .. }
        ));

        // Range mappings are rejected on list maps.
        let range = ShardRange::new(ShardKey::new_int32(0), ShardKey::new_int32(10)).unwrap();
        let err = manager
            .create_range_mapping(&map, range, shard)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::ShardMapKindMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_key_type_is_enforced() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();

        let err = manager
            .lookup_mapping(&map, &ShardKey::new_int32(1), LookupOptions::LookupInCacheThenStore)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::KeyTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_move_mapping_between_shards() {
        let (manager, factory) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();
        let source = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();
        let target = manager
            .add_shard(&map, ShardLocation::new("srv2", "db2"))
            .await
            .unwrap();

        let range = ShardRange::new(ShardKey::new_int64(0), ShardKey::new_int64(100)).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range, source.clone())
            .await
            .unwrap();

        // An online mapping cannot move.
        let err = manager
            .move_mapping(&map, mapping.clone(), target.clone(), LockOwnerId::UNLOCKED)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::MappingIsNotOffline { .. }
        ));

        let offline = manager
            .mark_mapping_offline(&map, mapping, LockOwnerId::UNLOCKED)
            .await
            .unwrap();
        let moved = manager
            .move_mapping(&map, offline, target.clone(), LockOwnerId::UNLOCKED)
            .await
            .unwrap();
        manager
            .mark_mapping_online(&map, moved, LockOwnerId::UNLOCKED)
            .await
            .unwrap();

        let hit = manager
            .lookup_mapping(&map, &ShardKey::new_int64(50), LookupOptions::LookupInStore)
            .await
            .unwrap();
        assert_eq!(hit.shard.location, target.location);

        // The key space really moved between local stores.
        assert_eq!(factory.local_store(&source.location).mapping_count(), 0);
        assert_eq!(factory.local_store(&target.location).mapping_count(), 1);
    }

    #[tokio::test]
    async fn test_split_and_merge_round_trip() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();

        let range = ShardRange::new(ShardKey::new_int64(0), ShardKey::new_int64(100)).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range, shard)
            .await
            .unwrap();

        // Split point must fall strictly inside.
        let err = manager
            .split_mapping(&map, mapping.clone(), ShardKey::new_int64(0), LockOwnerId::UNLOCKED)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::SplitKeyOutOfRange));

        let (left, right) = manager
            .split_mapping(&map, mapping, ShardKey::new_int64(40), LockOwnerId::UNLOCKED)
            .await
            .unwrap();
        assert_eq!(left.max_key, right.min_key);

        let mappings = manager.get_mappings(&map, None, None).await.unwrap();
        assert_eq!(mappings.len(), 2);

        let merged = manager
            .merge_mappings(&map, left, right, LockOwnerId::UNLOCKED)
            .await
            .unwrap();
        assert_eq!(merged.min_key, ShardKey::new_int64(0));
        assert_eq!(merged.max_key, ShardKey::new_int64(100));
        assert_eq!(manager.get_mappings(&map, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_token_fences_mutations() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();
        let range = ShardRange::new(ShardKey::new_int64(0), ShardKey::new_int64(100)).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range, shard)
            .await
            .unwrap();

        let owner = LockOwnerId::new();
        manager
            .lock_mapping(&map, mapping.clone(), owner)
            .await
            .unwrap();

        // Someone else holds the lock now.
        let err = manager
            .lock_mapping(&map, mapping.clone(), LockOwnerId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::MappingIsAlreadyLocked { .. }
        ));

        let mut locked = mapping.clone();
        locked.lock_owner_id = owner;
        let err = manager
            .mark_mapping_offline(&map, locked.clone(), LockOwnerId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::MappingLockOwnerIdDoesNotMatch { .. }
        ));

        // The owner's token is admitted; so is a blanket unlock afterwards.
        manager
            .mark_mapping_offline(&map, locked.clone(), owner)
            .await
            .unwrap();
        manager.unlock_all_mappings(&map, owner).await.unwrap();
        let mut unlocked = locked;
        unlocked.status = MappingStatus::Offline;
        unlocked.lock_owner_id = LockOwnerId::UNLOCKED;
        manager
            .mark_mapping_online(&map, unlocked, LockOwnerId::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lookup_in_cache_only() {
        let (manager, _) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();
        let range = ShardRange::new(ShardKey::new_int64(0), ShardKey::new_int64(100)).unwrap();
        manager
            .create_range_mapping(&map, range, shard)
            .await
            .unwrap();

        // The committed mapping is cached, so a cache-only lookup hits.
        manager
            .lookup_mapping(&map, &ShardKey::new_int64(1), LookupOptions::LookupInCache)
            .await
            .unwrap();

        manager.clear_cache();
        let err = manager
            .lookup_mapping(&map, &ShardKey::new_int64(1), LookupOptions::LookupInCache)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::MappingNotFoundForKey { .. }
        ));

        // A store-backed lookup repopulates the cache.
        manager
            .lookup_mapping(&map, &ShardKey::new_int64(1), LookupOptions::LookupInCacheThenStore)
            .await
            .unwrap();
        manager
            .lookup_mapping(&map, &ShardKey::new_int64(1), LookupOptions::LookupInCache)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_pending_operations_rolls_back() {
        let (manager, factory) = manager();
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
            .await
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv1", "db1"))
            .await
            .unwrap();

        // Plant a half-done operation the way a crashed process would leave
        // one: intent row plus the source local phase.
        let mapping = StoreMapping::new(
            map.id,
            shard.clone(),
            ShardKey::new_int64(0),
            ShardKey::new_int64(100),
        );
        let op = StoreOperation::add_mapping(map.clone(), mapping);
        let global = factory.global();
        global
            .execute(&op.request(
                OperationPhase::GlobalPreLocal,
                StoreOperationState::UndoGlobalPostLocal,
            ))
            .await
            .unwrap();
        global
            .execute(&StoreRequest::AdvanceOperationState {
                operation_id: op.id,
                undo_start_state: StoreOperationState::UndoLocalSource,
            })
            .await
            .unwrap();
        factory
            .local(&shard.location)
            .execute(&op.request(OperationPhase::LocalSource, StoreOperationState::DoBegin))
            .await
            .unwrap();

        assert_eq!(manager.resume_pending_operations().await.unwrap(), 1);
        assert_eq!(factory.global_store().pending_operation_count(), 0);
        assert_eq!(factory.local_store(&shard.location).mapping_count(), 0);

        // Nothing left to resume.
        assert_eq!(manager.resume_pending_operations().await.unwrap(), 0);
    }
}
