//! Core types shared across the shard map manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::key::ShardKey;

/// Unique identifier of a shard map.
pub type ShardMapId = Uuid;

/// Unique identifier of a shard.
pub type ShardId = Uuid;

/// Unique identifier of a mapping.
pub type MappingId = Uuid;

/// Unique identifier of an in-flight store operation.
pub type OperationId = Uuid;

/// Kind of a shard map: points (list) or half-open intervals (range).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardMapKind {
    /// Each mapping associates a single key value with a shard.
    List,

    /// Each mapping associates a `[low, high)` key range with a shard.
    Range,
}

impl fmt::Display for ShardMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMapKind::List => write!(f, "list"),
            ShardMapKind::Range => write!(f, "range"),
        }
    }
}

/// Availability status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Shard is online and can serve traffic.
    Online,

    /// Shard is offline for maintenance or migration.
    Offline,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Online => write!(f, "online"),
            ShardStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Availability status of a mapping.
///
/// A mapping must be taken offline before its key space can be moved to a
/// different shard or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    /// Mapping is online; lookups route to its shard.
    Online,

    /// Mapping is offline; mutations that move or remove it are permitted.
    Offline,
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingStatus::Online => write!(f, "online"),
            MappingStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Network location of a physical shard database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardLocation {
    /// Server (host) name.
    pub server: String,

    /// Database name on that server.
    pub database: String,
}

impl ShardLocation {
    /// Create a new shard location.
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.database)
    }
}

/// Identity of a mapping lock holder.
///
/// Two values are reserved: [`LockOwnerId::UNLOCKED`] marks a mapping that is
/// not locked, and [`LockOwnerId::FORCE_UNLOCK`] matches any lock and is used
/// for administrative override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwnerId(pub Uuid);

impl LockOwnerId {
    /// Reserved value for "not locked".
    pub const UNLOCKED: LockOwnerId = LockOwnerId(Uuid::nil());

    /// Reserved value that matches any lock owner.
    pub const FORCE_UNLOCK: LockOwnerId = LockOwnerId(Uuid::max());

    /// Create a fresh, unique lock owner id.
    pub fn new() -> Self {
        LockOwnerId(Uuid::new_v4())
    }

    /// Whether this value is the reserved "not locked" id.
    pub fn is_unlocked(&self) -> bool {
        *self == Self::UNLOCKED
    }

    /// Whether a presented token is allowed to mutate a mapping locked by
    /// `self`. The force-unlock token matches every lock.
    pub fn admits(&self, presented: LockOwnerId) -> bool {
        self.is_unlocked() || presented == *self || presented == Self::FORCE_UNLOCK
    }
}

impl Default for LockOwnerId {
    fn default() -> Self {
        Self::UNLOCKED
    }
}

impl fmt::Display for LockOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNLOCKED {
            write!(f, "unlocked")
        } else if *self == Self::FORCE_UNLOCK {
            write!(f, "force-unlock")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Canonical shard map row as stored in the global store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShardMap {
    /// Unique shard map identifier.
    pub id: ShardMapId,

    /// Shard map name, unique within the global store.
    pub name: String,

    /// List or range semantics.
    pub kind: ShardMapKind,

    /// Key type all mappings of this map use.
    pub key_type: crate::key::ShardKeyType,
}

impl StoreShardMap {
    /// Create a new shard map row with a fresh id.
    pub fn new(
        name: impl Into<String>,
        kind: ShardMapKind,
        key_type: crate::key::ShardKeyType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            key_type,
        }
    }
}

/// Shard row: one per physical database per shard map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShard {
    /// Unique shard identifier.
    pub id: ShardId,

    /// Version, incremented on every shard mutation. Used to detect
    /// concurrent modification.
    pub version: u64,

    /// Owning shard map.
    pub shard_map_id: ShardMapId,

    /// Physical location of the shard database.
    pub location: ShardLocation,

    /// Availability status.
    pub status: ShardStatus,
}

impl StoreShard {
    /// Create a new online shard row with a fresh id and version 1.
    pub fn new(shard_map_id: ShardMapId, location: ShardLocation) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            shard_map_id,
            location,
            status: ShardStatus::Online,
        }
    }

    /// Copy of this shard with the version bumped, for optimistic updates.
    pub fn next_version(&self) -> Self {
        let mut shard = self.clone();
        shard.version += 1;
        shard
    }
}

/// Mapping row: associates a key (point) or key range with a shard.
///
/// The covered key space is always the half-open interval
/// `[min_key, max_key)`; a point mapping of a list map covers
/// `[key, key.next)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMapping {
    /// Unique mapping identifier.
    pub id: MappingId,

    /// Owning shard map.
    pub shard_map_id: ShardMapId,

    /// Shard the key space routes to.
    pub shard: StoreShard,

    /// Inclusive lower bound of the covered key space.
    pub min_key: ShardKey,

    /// Exclusive upper bound of the covered key space.
    pub max_key: ShardKey,

    /// Availability status.
    pub status: MappingStatus,

    /// Current lock holder, [`LockOwnerId::UNLOCKED`] when free.
    pub lock_owner_id: LockOwnerId,
}

impl StoreMapping {
    /// Create a new online, unlocked mapping over `[min_key, max_key)`.
    pub fn new(
        shard_map_id: ShardMapId,
        shard: StoreShard,
        min_key: ShardKey,
        max_key: ShardKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard_map_id,
            shard,
            min_key,
            max_key,
            status: MappingStatus::Online,
            lock_owner_id: LockOwnerId::UNLOCKED,
        }
    }

    /// Whether this mapping's key space contains `key`.
    pub fn contains(&self, key: &ShardKey) -> bool {
        key >= &self.min_key && key < &self.max_key
    }

    /// Whether this mapping's key space intersects `[min, max)`.
    pub fn intersects(&self, min: &ShardKey, max: &ShardKey) -> bool {
        &self.min_key < max && min < &self.max_key
    }

    /// Whether this mapping is currently locked.
    pub fn is_locked(&self) -> bool {
        !self.lock_owner_id.is_unlocked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;

    #[test]
    fn test_lock_owner_reserved_values() {
        let owner = LockOwnerId::new();

        assert!(!owner.is_unlocked());
        assert!(LockOwnerId::UNLOCKED.is_unlocked());
        assert_ne!(owner, LockOwnerId::FORCE_UNLOCK);

        // A lock admits its own token and the force-unlock token, nothing else.
        assert!(owner.admits(owner));
        assert!(owner.admits(LockOwnerId::FORCE_UNLOCK));
        assert!(!owner.admits(LockOwnerId::new()));
        assert!(!owner.admits(LockOwnerId::UNLOCKED));

        // An unlocked mapping admits any token.
        assert!(LockOwnerId::UNLOCKED.admits(LockOwnerId::new()));
    }

    #[test]
    fn test_shard_version_bump() {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int64);
        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));

        assert_eq!(shard.version, 1);
        let next = shard.next_version();
        assert_eq!(next.version, 2);
        assert_eq!(next.id, shard.id);
    }

    #[test]
    fn test_mapping_containment() {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int64);
        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        let mapping = StoreMapping::new(
            map.id,
            shard,
            ShardKey::new_int64(0),
            ShardKey::new_int64(100),
        );

        assert!(mapping.contains(&ShardKey::new_int64(0)));
        assert!(mapping.contains(&ShardKey::new_int64(99)));
        assert!(!mapping.contains(&ShardKey::new_int64(100)));
        assert!(mapping.intersects(&ShardKey::new_int64(50), &ShardKey::new_int64(150)));
        assert!(!mapping.intersects(&ShardKey::new_int64(100), &ShardKey::new_int64(150)));
    }
}
