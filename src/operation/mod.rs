//! Mutating operations against the two-level store, executed through the
//! Do/Undo protocol.
//!
//! A [`StoreOperation`] bundles an operation code with the rows it touches
//! and knows how to build the per-phase store requests and how to translate
//! store result codes into caller-visible errors. The
//! [`executor::OperationExecutor`] drives the phase sequence.

pub mod executor;

pub use executor::OperationExecutor;

use uuid::Uuid;

use crate::error::ShardManagementError;
use crate::store::{
    LogEntry, OperationPayload, OperationPhase, OperationRequest, StoreOperationCode,
    StoreOperationState, StoreRequest, StoreResultCode,
};
use crate::types::{LockOwnerId, OperationId, ShardLocation, StoreMapping, StoreShard, StoreShardMap};

/// One mutating operation: code plus the rows all of its phases operate on.
///
/// The payload is fixed at construction; every phase receives the same rows
/// and the store applies the subset relevant to it. That is what makes a
/// phase re-executable and an undo phase able to compensate work that may
/// never have happened.
#[derive(Debug, Clone)]
pub struct StoreOperation {
    /// Operation identity, shared by all phases.
    pub id: OperationId,

    /// What the operation does.
    pub code: StoreOperationCode,

    /// Rows the operation reads and writes.
    pub payload: OperationPayload,
}

impl StoreOperation {
    fn new(code: StoreOperationCode, payload: OperationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            payload,
        }
    }

    /// Add a shard to a shard map.
    pub fn add_shard(shard_map: StoreShardMap, shard: StoreShard) -> Self {
        Self::new(
            StoreOperationCode::AddShard,
            OperationPayload {
                shard_map: Some(shard_map),
                shard_new: Some(shard),
                ..Default::default()
            },
        )
    }

    /// Remove a shard from a shard map.
    pub fn remove_shard(shard_map: StoreShardMap, shard: StoreShard) -> Self {
        Self::new(
            StoreOperationCode::RemoveShard,
            OperationPayload {
                shard_map: Some(shard_map),
                shard_old: Some(shard),
                ..Default::default()
            },
        )
    }

    /// Replace a shard row, guarded by the old row's version.
    pub fn update_shard(shard_map: StoreShardMap, old: StoreShard, new: StoreShard) -> Self {
        Self::new(
            StoreOperationCode::UpdateShard,
            OperationPayload {
                shard_map: Some(shard_map),
                shard_old: Some(old),
                shard_new: Some(new),
                ..Default::default()
            },
        )
    }

    /// Add a point or range mapping.
    pub fn add_mapping(shard_map: StoreShardMap, mapping: StoreMapping) -> Self {
        Self::new(
            StoreOperationCode::AddMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_target: vec![mapping],
                ..Default::default()
            },
        )
    }

    /// Remove a mapping. `lock_owner` is the caller's token when the mapping
    /// is locked.
    pub fn remove_mapping(
        shard_map: StoreShardMap,
        mapping: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Self {
        Self::new(
            StoreOperationCode::RemoveMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![mapping],
                lock_owner: Some(lock_owner),
                ..Default::default()
            },
        )
    }

    /// Replace a mapping row in place or move it to another shard.
    pub fn update_mapping(
        shard_map: StoreShardMap,
        source: StoreMapping,
        target: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Self {
        Self::new(
            StoreOperationCode::UpdateMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![source],
                mappings_target: vec![target],
                lock_owner: Some(lock_owner),
                ..Default::default()
            },
        )
    }

    /// Split one range mapping into two at a key.
    pub fn split_mapping(
        shard_map: StoreShardMap,
        source: StoreMapping,
        targets: [StoreMapping; 2],
        lock_owner: LockOwnerId,
    ) -> Self {
        let [left, right] = targets;
        Self::new(
            StoreOperationCode::SplitMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![source],
                mappings_target: vec![left, right],
                lock_owner: Some(lock_owner),
                ..Default::default()
            },
        )
    }

    /// Merge two adjacent range mappings into one.
    pub fn merge_mappings(
        shard_map: StoreShardMap,
        sources: [StoreMapping; 2],
        target: StoreMapping,
        lock_owner: LockOwnerId,
    ) -> Self {
        let [left, right] = sources;
        Self::new(
            StoreOperationCode::MergeMappings,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![left, right],
                mappings_target: vec![target],
                lock_owner: Some(lock_owner),
                ..Default::default()
            },
        )
    }

    /// Lock a mapping for the given owner.
    pub fn lock_mapping(
        shard_map: StoreShardMap,
        mapping: StoreMapping,
        owner: LockOwnerId,
    ) -> Self {
        let mut locked = mapping.clone();
        locked.lock_owner_id = owner;
        Self::new(
            StoreOperationCode::LockMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![mapping],
                mappings_target: vec![locked],
                lock_owner: Some(owner),
                ..Default::default()
            },
        )
    }

    /// Release a mapping lock held by `owner` (or force-release).
    pub fn unlock_mapping(
        shard_map: StoreShardMap,
        mapping: StoreMapping,
        owner: LockOwnerId,
    ) -> Self {
        let mut unlocked = mapping.clone();
        unlocked.lock_owner_id = LockOwnerId::UNLOCKED;
        Self::new(
            StoreOperationCode::UnlockMapping,
            OperationPayload {
                shard_map: Some(shard_map),
                mappings_source: vec![mapping],
                mappings_target: vec![unlocked],
                lock_owner: Some(owner),
                ..Default::default()
            },
        )
    }

    /// Release every lock held by `owner` across the map.
    pub fn unlock_all_mappings(shard_map: StoreShardMap, owner: LockOwnerId) -> Self {
        Self::new(
            StoreOperationCode::UnlockAllMappings,
            OperationPayload {
                shard_map: Some(shard_map),
                lock_owner: Some(owner),
                ..Default::default()
            },
        )
    }

    /// Rehydrate an operation from a persisted log row, for recovery.
    pub fn from_log_entry(entry: LogEntry) -> Self {
        Self {
            id: entry.operation_id,
            code: entry.code,
            payload: entry.payload,
        }
    }

    /// Location of the local store the source phase runs against, `None` for
    /// operations that never touch local stores.
    pub fn source_location(&self) -> Option<&ShardLocation> {
        if !self.code.uses_local_stores() {
            return None;
        }
        self.payload
            .mappings_source
            .first()
            .map(|m| &m.shard.location)
            .or_else(|| self.payload.shard_old.as_ref().map(|s| &s.location))
            .or_else(|| {
                self.payload
                    .mappings_target
                    .first()
                    .map(|m| &m.shard.location)
            })
            .or_else(|| self.payload.shard_new.as_ref().map(|s| &s.location))
    }

    /// Location of the local store the target phase runs against: only set
    /// when the operation spans two shards.
    pub fn target_location(&self) -> Option<&ShardLocation> {
        if !self.code.uses_local_stores() {
            return None;
        }
        let target = self
            .payload
            .mappings_target
            .first()
            .map(|m| &m.shard.location)
            .or_else(|| self.payload.shard_new.as_ref().map(|s| &s.location))?;
        (self.source_location() != Some(target)).then_some(target)
    }

    /// Build the store request for one phase.
    pub fn request(
        &self,
        phase: OperationPhase,
        undo_start_state: StoreOperationState,
    ) -> StoreRequest {
        StoreRequest::Operation(OperationRequest {
            operation_id: self.id,
            code: self.code,
            phase,
            undo_start_state,
            payload: self.payload.clone(),
        })
    }

    /// Translate a non-success store result code into the caller-visible
    /// error, using the payload rows for context.
    pub fn error_for(&self, code: StoreResultCode) -> ShardManagementError {
        let map_name = self
            .payload
            .shard_map
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        let location = self
            .payload
            .shard_old
            .as_ref()
            .or(self.payload.shard_new.as_ref())
            .map(|s| s.location.clone())
            .or_else(|| {
                self.payload
                    .mappings_source
                    .first()
                    .or_else(|| self.payload.mappings_target.first())
                    .map(|m| m.shard.location.clone())
            })
            .unwrap_or_else(|| ShardLocation::new("unknown", "unknown"));
        let mapping_id = self
            .payload
            .mappings_source
            .first()
            .or_else(|| self.payload.mappings_target.first())
            .map(|m| m.id)
            .unwrap_or_else(Uuid::nil);

        match code {
            StoreResultCode::StoreVersionMismatch => ShardManagementError::StoreVersionMismatch,
            StoreResultCode::ShardMapExists => {
                ShardManagementError::ShardMapAlreadyExists { name: map_name }
            }
            StoreResultCode::ShardMapDoesNotExist => {
                ShardManagementError::ShardMapDoesNotExist { name: map_name }
            }
            StoreResultCode::ShardMapHasShards => {
                ShardManagementError::ShardMapHasShards { name: map_name }
            }
            StoreResultCode::ShardExists => ShardManagementError::ShardAlreadyExists { location },
            StoreResultCode::ShardDoesNotExist => {
                ShardManagementError::ShardDoesNotExist { location }
            }
            StoreResultCode::ShardVersionMismatch => {
                ShardManagementError::ShardVersionMismatch { location }
            }
            StoreResultCode::ShardHasMappings => {
                ShardManagementError::ShardHasMappings { location }
            }
            StoreResultCode::ShardLocationExists => {
                ShardManagementError::ShardLocationConflict { location }
            }
            StoreResultCode::ShardPendingOperation => {
                ShardManagementError::ShardPendingOperation { location }
            }
            StoreResultCode::MappingDoesNotExist => {
                ShardManagementError::MappingDoesNotExist { mapping_id }
            }
            StoreResultCode::MappingPointAlreadyMapped => {
                ShardManagementError::MappingPointAlreadyMapped {
                    shard_map: map_name,
                }
            }
            StoreResultCode::MappingRangeAlreadyMapped => {
                ShardManagementError::MappingRangeAlreadyMapped {
                    shard_map: map_name,
                }
            }
            StoreResultCode::MappingNotFoundForKey => {
                ShardManagementError::MappingNotFoundForKey {
                    shard_map: map_name,
                }
            }
            StoreResultCode::MappingIsNotOffline => {
                ShardManagementError::MappingIsNotOffline { mapping_id }
            }
            StoreResultCode::MappingLockOwnerIdDoesNotMatch => {
                ShardManagementError::MappingLockOwnerIdDoesNotMatch { mapping_id }
            }
            StoreResultCode::MappingIsAlreadyLocked => {
                ShardManagementError::MappingIsAlreadyLocked { mapping_id }
            }
            StoreResultCode::SchemaInfoNameConflict => {
                ShardManagementError::SchemaInfoNameConflict { name: map_name }
            }
            StoreResultCode::SchemaInfoNameDoesNotExist => {
                ShardManagementError::SchemaInfoNameDoesNotExist { name: map_name }
            }
            other => ShardManagementError::UnexpectedStoreError { code: other },
        }
    }
}
