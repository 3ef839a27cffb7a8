//! Error types for the shard map manager.
//!
//! Errors are classified along two axes: a broad [`ErrorCategory`] naming the
//! surface that raised the error, and the concrete [`ShardManagementError`]
//! variant (the error code). Transport-level failures against a store live in
//! [`StoreError`]; only those participate in transient-fault retry.

use thiserror::Error;

use crate::key::ShardKeyType;
use crate::store::StoreResultCode;
use crate::types::{MappingId, OperationId, ShardLocation};

/// Result type alias for shard map management operations.
pub type Result<T> = std::result::Result<T, ShardManagementError>;

/// Broad classification of an error by the surface that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Shard map manager level (directory of shard maps).
    ShardMapManager,
    /// Shard map level (shards and mappings of one map).
    ShardMap,
    /// List shard map specific.
    ListShardMap,
    /// Range shard map specific.
    RangeShardMap,
    /// Input validation.
    Validation,
    /// Crash recovery of in-flight operations.
    Recovery,
    /// Schema info collection.
    SchemaInfoCollection,
    /// Everything else.
    General,
}

/// Transport-level failure talking to the global or a local store.
///
/// These are the failures the retry policy inspects; everything connectivity
/// shaped is considered transient, logical rejections are not.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("connection failed to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// The store call timed out.
    #[error("store call timed out against {target}")]
    Timeout { target: String },

    /// I/O error during the store round trip.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Request or result payload could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// The store rejected the request outright (malformed, unsupported).
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether this failure is connectivity-level and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed { .. } | StoreError::Timeout { .. } | StoreError::Io(_)
        )
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Caller-visible error raised by shard map management operations.
#[derive(Error, Debug)]
pub enum ShardManagementError {
    /// A shard map with the given name already exists in the global store.
    #[error("shard map already exists: {name}")]
    ShardMapAlreadyExists { name: String },

    /// No shard map with the given name exists.
    #[error("shard map does not exist: {name}")]
    ShardMapDoesNotExist { name: String },

    /// The shard map still contains shards and cannot be removed.
    #[error("shard map has shards and cannot be removed: {name}")]
    ShardMapHasShards { name: String },

    /// A shard for this location already exists in the map.
    #[error("shard already exists at {location}")]
    ShardAlreadyExists { location: ShardLocation },

    /// The referenced shard does not exist.
    #[error("shard does not exist at {location}")]
    ShardDoesNotExist { location: ShardLocation },

    /// The shard row changed underneath the caller (concurrent modification).
    #[error("shard version mismatch at {location}")]
    ShardVersionMismatch { location: ShardLocation },

    /// The shard still has mappings and cannot be removed.
    #[error("shard has mappings and cannot be removed: {location}")]
    ShardHasMappings { location: ShardLocation },

    /// The location is already claimed by a different shard of the map.
    #[error("shard location conflict at {location}")]
    ShardLocationConflict { location: ShardLocation },

    /// Another operation is already in flight against this shard.
    #[error("a pending operation exists for shard at {location}")]
    ShardPendingOperation { location: ShardLocation },

    /// The referenced mapping does not exist.
    #[error("mapping does not exist: {mapping_id}")]
    MappingDoesNotExist { mapping_id: MappingId },

    /// The point is already covered by an existing mapping.
    #[error("point is already mapped in shard map {shard_map}")]
    MappingPointAlreadyMapped { shard_map: String },

    /// The range overlaps an existing mapping.
    #[error("range is already mapped in shard map {shard_map}")]
    MappingRangeAlreadyMapped { shard_map: String },

    /// No mapping covers the given key.
    #[error("no mapping found for key in shard map {shard_map}")]
    MappingNotFoundForKey { shard_map: String },

    /// The mutation requires the mapping to be offline first.
    #[error("mapping is not offline: {mapping_id}")]
    MappingIsNotOffline { mapping_id: MappingId },

    /// The presented lock token does not match the mapping's lock owner.
    #[error("mapping lock owner id does not match for mapping {mapping_id}")]
    MappingLockOwnerIdDoesNotMatch { mapping_id: MappingId },

    /// The mapping is already locked by another owner.
    #[error("mapping is already locked: {mapping_id}")]
    MappingIsAlreadyLocked { mapping_id: MappingId },

    /// Keys of two different types were compared.
    #[error("shard key type mismatch: {left} vs {right}")]
    KeyTypeMismatch {
        left: ShardKeyType,
        right: ShardKeyType,
    },

    /// The +inf sentinel key has no successor.
    #[error("the maximum shard key cannot be incremented")]
    MaxKeyCannotBeIncremented,

    /// The +inf sentinel key has no concrete raw value.
    #[error("the maximum shard key has no raw value")]
    MaxKeyHasNoRawValue,

    /// A raw key encoding did not match the declared key type.
    #[error("invalid raw key encoding for {key_type}: {reason}")]
    InvalidKeyEncoding { key_type: ShardKeyType, reason: String },

    /// Range construction with `low >= high`.
    #[error("invalid shard range: low must be strictly less than high")]
    InvalidRange,

    /// A point operation was issued against a range map or vice versa.
    #[error("operation not valid for {kind} shard map {name}")]
    ShardMapKindMismatch {
        name: String,
        kind: crate::types::ShardMapKind,
    },

    /// Merge of mappings that live on different shards.
    #[error("mappings to merge are not on the same shard")]
    MappingsNotOnSameShard,

    /// Merge of two ranges that are not adjacent.
    #[error("ranges are not adjacent and cannot be merged")]
    RangesNotAdjacent,

    /// The split point falls outside the mapping being split.
    #[error("split key is outside the mapping's range")]
    SplitKeyOutOfRange,

    /// The store schema version does not match what this library expects.
    #[error("store version mismatch")]
    StoreVersionMismatch,

    /// A schema info entry with the given name already exists.
    #[error("schema info name conflict: {name}")]
    SchemaInfoNameConflict { name: String },

    /// No schema info entry with the given name exists.
    #[error("schema info name does not exist: {name}")]
    SchemaInfoNameDoesNotExist { name: String },

    /// Transient store failures exhausted the retry policy.
    #[error("storage operation failure")]
    StorageOperationFailure {
        #[source]
        source: StoreError,
    },

    /// An undo sequence could not complete; the operation log row was left in
    /// place for out-of-band recovery.
    #[error("operation {operation_id} could not be rolled back and was left pending: {reason}")]
    OrphanedOperation {
        operation_id: OperationId,
        reason: String,
    },

    /// The store returned a result code the phase handler does not recognize.
    #[error("unexpected store error: {code}")]
    UnexpectedStoreError { code: StoreResultCode },
}

impl ShardManagementError {
    /// The broad category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use ShardManagementError::*;
        match self {
            ShardMapAlreadyExists { .. }
            | ShardMapDoesNotExist { .. }
            | ShardMapHasShards { .. }
            | StoreVersionMismatch => ErrorCategory::ShardMapManager,

            ShardAlreadyExists { .. }
            | ShardDoesNotExist { .. }
            | ShardVersionMismatch { .. }
            | ShardHasMappings { .. }
            | ShardLocationConflict { .. }
            | ShardPendingOperation { .. }
            | MappingDoesNotExist { .. }
            | MappingNotFoundForKey { .. }
            | MappingIsNotOffline { .. }
            | MappingLockOwnerIdDoesNotMatch { .. }
            | MappingIsAlreadyLocked { .. } => ErrorCategory::ShardMap,

            MappingPointAlreadyMapped { .. } => ErrorCategory::ListShardMap,

            MappingRangeAlreadyMapped { .. } => ErrorCategory::RangeShardMap,

            KeyTypeMismatch { .. }
            | MaxKeyCannotBeIncremented
            | MaxKeyHasNoRawValue
            | InvalidKeyEncoding { .. }
            | InvalidRange
            | ShardMapKindMismatch { .. }
            | MappingsNotOnSameShard
            | RangesNotAdjacent
            | SplitKeyOutOfRange => ErrorCategory::Validation,

            OrphanedOperation { .. } => ErrorCategory::Recovery,

            SchemaInfoNameConflict { .. } | SchemaInfoNameDoesNotExist { .. } => {
                ErrorCategory::SchemaInfoCollection
            }

            StorageOperationFailure { .. } | UnexpectedStoreError { .. } => ErrorCategory::General,
        }
    }
}
