//! Store contract: the wire vocabulary spoken against the global store (GSM)
//! and the per-shard local stores (LSM).
//!
//! The core never talks SQL; it issues one [`StoreRequest`] per round trip
//! through a [`StoreConnection`] and interprets the returned
//! [`StoreResultCode`]. An in-memory implementation lives in
//! [`memory`], usable both embedded and as the test substrate.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::key::{ShardKey, ShardRange};
use crate::types::{
    LockOwnerId, OperationId, ShardLocation, StoreMapping, StoreShard, StoreShardMap,
};

/// Result code of one store round trip.
///
/// Every phase handler recognizes the subset of codes its operation can
/// legitimately return; anything else maps to an unexpected-store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreResultCode {
    /// The request succeeded.
    Success,
    /// Generic failure.
    Failure,
    /// The store schema version does not match the library.
    StoreVersionMismatch,
    /// A shard map with the same name already exists.
    ShardMapExists,
    /// The referenced shard map does not exist.
    ShardMapDoesNotExist,
    /// The shard map still has shards.
    ShardMapHasShards,
    /// A shard with the same id already exists.
    ShardExists,
    /// The referenced shard does not exist.
    ShardDoesNotExist,
    /// The shard row version does not match (concurrent modification).
    ShardVersionMismatch,
    /// The shard still has mappings.
    ShardHasMappings,
    /// The location is claimed by another shard of the map.
    ShardLocationExists,
    /// Another operation is pending against the shard.
    ShardPendingOperation,
    /// The referenced mapping does not exist.
    MappingDoesNotExist,
    /// The point is already covered by a mapping.
    MappingPointAlreadyMapped,
    /// The range overlaps an existing mapping.
    MappingRangeAlreadyMapped,
    /// No mapping covers the key.
    MappingNotFoundForKey,
    /// The mutation requires an offline mapping.
    MappingIsNotOffline,
    /// The presented lock owner does not match.
    MappingLockOwnerIdDoesNotMatch,
    /// The mapping is already locked.
    MappingIsAlreadyLocked,
    /// A schema info entry with the name already exists.
    SchemaInfoNameConflict,
    /// No schema info entry with the name exists.
    SchemaInfoNameDoesNotExist,
}

impl fmt::Display for StoreResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Code of a mutating operation executed through the Do/Undo protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOperationCode {
    /// Add a shard to a shard map.
    AddShard,
    /// Remove a shard from a shard map.
    RemoveShard,
    /// Update a shard row (status, version).
    UpdateShard,
    /// Add a point or range mapping.
    AddMapping,
    /// Remove a mapping.
    RemoveMapping,
    /// Update a mapping in place (status, lock) or move it between shards.
    UpdateMapping,
    /// Split one range mapping into two at a key.
    SplitMapping,
    /// Merge two adjacent range mappings into one.
    MergeMappings,
    /// Acquire a mapping lock.
    LockMapping,
    /// Release a mapping lock.
    UnlockMapping,
    /// Release every lock held by an owner across the map.
    UnlockAllMappings,
}

impl fmt::Display for StoreOperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StoreOperationCode {
    /// Whether this code touches any local store at all. Lock bookkeeping
    /// lives only in the global store.
    pub fn uses_local_stores(&self) -> bool {
        !matches!(
            self,
            StoreOperationCode::LockMapping
                | StoreOperationCode::UnlockMapping
                | StoreOperationCode::UnlockAllMappings
        )
    }
}

/// Progress marker of an in-flight operation, persisted in the global
/// operations log so a crashed sequence can be resumed.
///
/// The persisted value is always the *undo start state*: the first undo phase
/// a recovering process must run. It is advanced before the corresponding
/// forward phase commits, so compensation may encounter a phase that never
/// applied and must treat that as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreOperationState {
    /// Nothing durable happened yet.
    DoBegin,
    /// The global intent row exists; undo removes it.
    UndoGlobalPostLocal,
    /// The source local store may have been touched.
    UndoLocalSource,
    /// The target local store may have been touched.
    UndoLocalTarget,
    /// All phases committed.
    DoEnd,
    /// Compensation finished.
    UndoEnd,
}

impl fmt::Display for StoreOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One phase of the Do/Undo sequence, named in the request so the store can
/// select the stored operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    /// Record intent in the global store, validate preconditions.
    GlobalPreLocal,
    /// Apply the change to the source shard's local store.
    LocalSource,
    /// Apply the change to the target shard's local store.
    LocalTarget,
    /// Finalize in the global store and drop the pending marker.
    GlobalPostLocal,
    /// Compensate the target local store.
    UndoLocalTarget,
    /// Compensate the source local store.
    UndoLocalSource,
    /// Revert the global intent and drop the log row.
    UndoGlobalPostLocal,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Entity payload of an operation: the rows the operation reads and writes.
///
/// `mappings_source` are pre-operation rows (removed or replaced),
/// `mappings_target` post-operation rows (inserted). Split carries one source
/// and two targets, merge two sources and one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    /// The shard map being mutated.
    pub shard_map: Option<StoreShardMap>,

    /// Pre-operation shard row, when a shard is mutated or removed.
    pub shard_old: Option<StoreShard>,

    /// Post-operation shard row, when a shard is added or mutated.
    pub shard_new: Option<StoreShard>,

    /// Pre-operation mapping rows.
    pub mappings_source: Vec<StoreMapping>,

    /// Post-operation mapping rows.
    pub mappings_target: Vec<StoreMapping>,

    /// Lock token presented by the caller, for lock-validated mutations.
    pub lock_owner: Option<LockOwnerId>,
}

/// One request against a store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreRequest {
    /// Create a shard map row (global store only).
    AddShardMap { shard_map: StoreShardMap },

    /// Remove a shard map row (global store only).
    RemoveShardMap { shard_map: StoreShardMap },

    /// Look up a shard map by name.
    FindShardMapByName { name: String },

    /// Enumerate all shard maps.
    GetAllShardMaps,

    /// Enumerate the shards of a map.
    GetShardsForMap { shard_map: StoreShardMap },

    /// Find the mapping covering a key.
    FindMappingForKey {
        shard_map: StoreShardMap,
        key: ShardKey,
    },

    /// Enumerate mappings, optionally restricted to a range and/or a shard.
    GetMappingsForRange {
        shard_map: StoreShardMap,
        range: Option<ShardRange>,
        shard: Option<StoreShard>,
    },

    /// Enumerate unfinished operation log rows.
    GetPendingOperations,

    /// Advance the persisted undo start state of a log row.
    AdvanceOperationState {
        operation_id: OperationId,
        undo_start_state: StoreOperationState,
    },

    /// Execute one Do/Undo phase of a mutating operation.
    Operation(OperationRequest),
}

/// The phase-execution variant of [`StoreRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Operation identity, shared by all phases of one sequence.
    pub operation_id: OperationId,

    /// What the operation does.
    pub code: StoreOperationCode,

    /// Which phase to run.
    pub phase: OperationPhase,

    /// Undo start state to persist alongside the intent row.
    pub undo_start_state: StoreOperationState,

    /// Rows the phase operates on.
    pub payload: OperationPayload,
}

/// Result of one store round trip: a code plus whichever row sets the request
/// produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreResults {
    /// Outcome code.
    pub code: StoreResultCode,

    /// Shard map rows, for directory requests.
    pub shard_maps: Vec<StoreShardMap>,

    /// Shard rows.
    pub shards: Vec<StoreShard>,

    /// Mapping rows.
    pub mappings: Vec<StoreMapping>,

    /// Operation log rows, for recovery requests.
    pub operations: Vec<LogEntry>,
}

impl Default for StoreResultCode {
    fn default() -> Self {
        StoreResultCode::Success
    }
}

impl StoreResults {
    /// A bare result carrying only a code.
    pub fn of(code: StoreResultCode) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }
}

/// Operation log row persisted in the global store for the lifetime of one
/// Do/Undo sequence. A later process finds the row and resumes undo from the
/// recorded state instead of guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Operation identity.
    pub operation_id: OperationId,

    /// What the operation does.
    pub code: StoreOperationCode,

    /// First undo phase a recovering process must run.
    pub undo_start_state: StoreOperationState,

    /// Rows the operation touches, enough to compensate every phase.
    pub payload: OperationPayload,
}

impl LogEntry {
    /// Serialize for persistence in a log row.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a persisted log row.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// One round trip against the global store or a local store.
///
/// Each call executes inside its own transactional scope on the store side;
/// cross-store consistency is the Do/Undo protocol's job, not the
/// connection's.
#[async_trait]
pub trait StoreConnection: Send + Sync + fmt::Debug {
    /// Execute one request and return its results.
    ///
    /// `Err` means the round trip itself failed (connectivity); logical
    /// rejections come back as `Ok` with a non-success code.
    async fn execute(&self, request: &StoreRequest) -> Result<StoreResults, StoreError>;
}

/// Resolves connections to the global store and to per-shard local stores.
pub trait StoreConnectionFactory: Send + Sync + fmt::Debug {
    /// Connection to the global store.
    fn global(&self) -> Arc<dyn StoreConnection>;

    /// Connection to the local store of the shard at `location`.
    fn local(&self, location: &ShardLocation) -> Arc<dyn StoreConnection>;
}
