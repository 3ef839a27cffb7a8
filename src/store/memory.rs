//! In-memory store implementation.
//!
//! One [`InMemoryStore`] instance plays the role of either the global store
//! or one shard's local store; [`InMemoryStoreFactory`] wires a global plus
//! on-demand locals together. The implementation honors the full
//! [`StoreResultCode`](super::StoreResultCode) contract, so it serves both as
//! an embedded store and as the substrate for protocol tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::types::{
    LockOwnerId, MappingId, MappingStatus, OperationId, ShardId, ShardLocation, ShardMapId,
    StoreMapping, StoreShard, StoreShardMap,
};

use super::{
    LogEntry, OperationPayload, OperationPhase, OperationRequest, StoreConnection,
    StoreConnectionFactory, StoreOperationCode, StoreRequest, StoreResultCode, StoreResults,
};

/// Whether a store instance is the global store or a shard-local one.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreRole {
    Global,
    Local(ShardLocation),
}

#[derive(Debug, Default)]
struct Tables {
    shard_maps: HashMap<ShardMapId, StoreShardMap>,
    shards: HashMap<ShardId, StoreShard>,
    mappings: HashMap<MappingId, StoreMapping>,
    operations: HashMap<OperationId, LogEntry>,
}

impl Tables {
    fn shards_of(&self, shard_map_id: ShardMapId) -> impl Iterator<Item = &StoreShard> {
        self.shards
            .values()
            .filter(move |s| s.shard_map_id == shard_map_id)
    }

    fn mappings_of(&self, shard_map_id: ShardMapId) -> impl Iterator<Item = &StoreMapping> {
        self.mappings
            .values()
            .filter(move |m| m.shard_map_id == shard_map_id)
    }

    /// Whether an unfinished operation already touches the rows of `incoming`.
    fn has_pending_conflict(&self, operation_id: OperationId, incoming: &OperationPayload) -> bool {
        self.operations
            .values()
            .filter(|entry| entry.operation_id != operation_id)
            .any(|entry| payloads_conflict(&entry.payload, incoming))
    }
}

fn payload_locations(payload: &OperationPayload) -> impl Iterator<Item = &ShardLocation> {
    payload
        .shard_old
        .iter()
        .chain(payload.shard_new.iter())
        .map(|s| &s.location)
        .chain(
            payload
                .mappings_source
                .iter()
                .chain(payload.mappings_target.iter())
                .map(|m| &m.shard.location),
        )
}

fn payload_mappings(payload: &OperationPayload) -> impl Iterator<Item = &StoreMapping> {
    payload
        .mappings_source
        .iter()
        .chain(payload.mappings_target.iter())
}

fn payloads_conflict(existing: &OperationPayload, incoming: &OperationPayload) -> bool {
    // Shard-level conflict: two operations against the same location.
    let shard_ops_collide = |a: &OperationPayload, b: &OperationPayload| {
        (a.shard_old.is_some() || a.shard_new.is_some())
            && payload_locations(a).any(|loc| payload_locations(b).any(|other| other == loc))
    };
    if shard_ops_collide(existing, incoming) || shard_ops_collide(incoming, existing) {
        return true;
    }

    // Mapping-level conflict: shared mapping id or overlapping key space
    // within the same shard map.
    payload_mappings(existing).any(|a| {
        payload_mappings(incoming).any(|b| {
            a.id == b.id
                || (a.shard_map_id == b.shard_map_id && a.intersects(&b.min_key, &b.max_key))
        })
    })
}

/// In-memory store holding shard map, shard, mapping and operation log rows.
#[derive(Debug)]
pub struct InMemoryStore {
    role: StoreRole,
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create a global store instance.
    pub fn new_global() -> Self {
        Self {
            role: StoreRole::Global,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Create a local store instance for the shard at `location`.
    pub fn new_local(location: ShardLocation) -> Self {
        Self {
            role: StoreRole::Local(location),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of mapping rows currently stored. Test observability.
    pub fn mapping_count(&self) -> usize {
        self.tables.read().mappings.len()
    }

    /// Number of unfinished operation log rows. Test observability.
    pub fn pending_operation_count(&self) -> usize {
        self.tables.read().operations.len()
    }

    /// Whether a row in this store belongs here: the global store holds
    /// everything, a local store only rows of its own shard.
    fn owns_location(&self, location: &ShardLocation) -> bool {
        match &self.role {
            StoreRole::Global => true,
            StoreRole::Local(own) => own == location,
        }
    }

    fn find_shard_map(&self, name: &str) -> Option<StoreShardMap> {
        self.tables
            .read()
            .shard_maps
            .values()
            .find(|m| m.name == name)
            .cloned()
    }

    fn handle(&self, request: &StoreRequest) -> StoreResults {
        match request {
            StoreRequest::AddShardMap { shard_map } => self.add_shard_map(shard_map),
            StoreRequest::RemoveShardMap { shard_map } => self.remove_shard_map(shard_map),
            StoreRequest::FindShardMapByName { name } => match self.find_shard_map(name) {
                Some(map) => StoreResults {
                    shard_maps: vec![map],
                    ..Default::default()
                },
                None => StoreResults::of(StoreResultCode::ShardMapDoesNotExist),
            },
            StoreRequest::GetAllShardMaps => StoreResults {
                shard_maps: self.tables.read().shard_maps.values().cloned().collect(),
                ..Default::default()
            },
            StoreRequest::GetShardsForMap { shard_map } => {
                let tables = self.tables.read();
                if !tables.shard_maps.contains_key(&shard_map.id) {
                    return StoreResults::of(StoreResultCode::ShardMapDoesNotExist);
                }
                StoreResults {
                    shards: tables.shards_of(shard_map.id).cloned().collect(),
                    ..Default::default()
                }
            }
            StoreRequest::FindMappingForKey { shard_map, key } => {
                let tables = self.tables.read();
                let results = match tables.mappings_of(shard_map.id).find(|m| m.contains(key)) {
                    Some(mapping) => StoreResults {
                        mappings: vec![mapping.clone()],
                        ..Default::default()
                    },
                    None => StoreResults::of(StoreResultCode::MappingNotFoundForKey),
                };
                results
            }
            StoreRequest::GetMappingsForRange {
                shard_map,
                range,
                shard,
            } => {
                let tables = self.tables.read();
                if !tables.shard_maps.contains_key(&shard_map.id) {
                    return StoreResults::of(StoreResultCode::ShardMapDoesNotExist);
                }
                let mut mappings: Vec<StoreMapping> = tables
                    .mappings_of(shard_map.id)
                    .filter(|m| {
                        range
                            .as_ref()
                            .map(|r| m.intersects(r.low(), r.high()))
                            .unwrap_or(true)
                    })
                    .filter(|m| shard.as_ref().map(|s| m.shard.id == s.id).unwrap_or(true))
                    .cloned()
                    .collect();
                mappings.sort_by(|a, b| a.min_key.cmp(&b.min_key));
                StoreResults {
                    mappings,
                    ..Default::default()
                }
            }
            StoreRequest::GetPendingOperations => StoreResults {
                operations: self.tables.read().operations.values().cloned().collect(),
                ..Default::default()
            },
            StoreRequest::AdvanceOperationState {
                operation_id,
                undo_start_state,
            } => {
                let mut tables = self.tables.write();
                if let Some(entry) = tables.operations.get_mut(operation_id) {
                    entry.undo_start_state = *undo_start_state;
                }
                StoreResults::of(StoreResultCode::Success)
            }
            StoreRequest::Operation(op) => self.handle_operation(op),
        }
    }

    fn add_shard_map(&self, shard_map: &StoreShardMap) -> StoreResults {
        let mut tables = self.tables.write();
        if tables.shard_maps.values().any(|m| m.name == shard_map.name) {
            return StoreResults::of(StoreResultCode::ShardMapExists);
        }
        tables.shard_maps.insert(shard_map.id, shard_map.clone());
        StoreResults {
            shard_maps: vec![shard_map.clone()],
            ..Default::default()
        }
    }

    fn remove_shard_map(&self, shard_map: &StoreShardMap) -> StoreResults {
        let mut tables = self.tables.write();
        if !tables.shard_maps.contains_key(&shard_map.id) {
            return StoreResults::of(StoreResultCode::ShardMapDoesNotExist);
        }
        if tables.shards_of(shard_map.id).next().is_some() {
            return StoreResults::of(StoreResultCode::ShardMapHasShards);
        }
        tables.shard_maps.remove(&shard_map.id);
        StoreResults::of(StoreResultCode::Success)
    }

    fn handle_operation(&self, op: &OperationRequest) -> StoreResults {
        match op.phase {
            OperationPhase::GlobalPreLocal => self.global_pre_local(op),
            OperationPhase::GlobalPostLocal => self.global_post_local(op),
            OperationPhase::UndoGlobalPostLocal => self.undo_global_post_local(op),
            OperationPhase::LocalSource | OperationPhase::LocalTarget => self.local_apply(op),
            OperationPhase::UndoLocalSource | OperationPhase::UndoLocalTarget => {
                self.local_revert(op)
            }
        }
    }

    /// Validate the operation's preconditions and persist the intent row.
    ///
    /// No shard map, shard or mapping row changes here: the log row is the
    /// only durable effect, so undo of this phase is dropping the row again.
    fn global_pre_local(&self, op: &OperationRequest) -> StoreResults {
        let mut tables = self.tables.write();
        let payload = &op.payload;
        let presented = payload.lock_owner.unwrap_or(LockOwnerId::UNLOCKED);

        if let Some(map) = &payload.shard_map {
            if !tables.shard_maps.contains_key(&map.id) {
                return StoreResults::of(StoreResultCode::ShardMapDoesNotExist);
            }
        }

        if tables.has_pending_conflict(op.operation_id, payload) {
            return StoreResults::of(StoreResultCode::ShardPendingOperation);
        }

        let code = match op.code {
            StoreOperationCode::AddShard => {
                let shard = payload.shard_new.as_ref();
                match shard {
                    Some(shard) => {
                        if tables.shards.contains_key(&shard.id) {
                            StoreResultCode::ShardExists
                        } else if tables
                            .shards_of(shard.shard_map_id)
                            .any(|s| s.location == shard.location)
                        {
                            StoreResultCode::ShardLocationExists
                        } else {
                            StoreResultCode::Success
                        }
                    }
                    None => StoreResultCode::Failure,
                }
            }
            StoreOperationCode::RemoveShard => match payload.shard_old.as_ref() {
                Some(shard) => match tables.shards.get(&shard.id) {
                    None => StoreResultCode::ShardDoesNotExist,
                    Some(current) if current.version != shard.version => {
                        StoreResultCode::ShardVersionMismatch
                    }
                    Some(current) => {
                        if tables
                            .mappings_of(shard.shard_map_id)
                            .any(|m| m.shard.id == current.id)
                        {
                            StoreResultCode::ShardHasMappings
                        } else {
                            StoreResultCode::Success
                        }
                    }
                },
                None => StoreResultCode::Failure,
            },
            StoreOperationCode::UpdateShard => match payload.shard_old.as_ref() {
                Some(shard) => match tables.shards.get(&shard.id) {
                    None => StoreResultCode::ShardDoesNotExist,
                    Some(current) if current.version != shard.version => {
                        StoreResultCode::ShardVersionMismatch
                    }
                    Some(_) => StoreResultCode::Success,
                },
                None => StoreResultCode::Failure,
            },
            StoreOperationCode::AddMapping => {
                let map = payload.shard_map.as_ref();
                let overlap = payload.mappings_target.iter().any(|new| {
                    tables
                        .mappings_of(new.shard_map_id)
                        .any(|m| m.intersects(&new.min_key, &new.max_key))
                });
                if overlap {
                    match map.map(|m| m.kind) {
                        Some(crate::types::ShardMapKind::List) => {
                            StoreResultCode::MappingPointAlreadyMapped
                        }
                        _ => StoreResultCode::MappingRangeAlreadyMapped,
                    }
                } else {
                    StoreResultCode::Success
                }
            }
            StoreOperationCode::RemoveMapping => {
                Self::validate_mapping_mutation(&tables, payload, presented, true)
            }
            StoreOperationCode::UpdateMapping => {
                let moves_shard = match (
                    payload.mappings_source.first(),
                    payload.mappings_target.first(),
                ) {
                    (Some(old), Some(new)) => old.shard.id != new.shard.id,
                    _ => false,
                };
                Self::validate_mapping_mutation(&tables, payload, presented, moves_shard)
            }
            StoreOperationCode::SplitMapping | StoreOperationCode::MergeMappings => {
                Self::validate_mapping_mutation(&tables, payload, presented, false)
            }
            StoreOperationCode::LockMapping => match payload.mappings_source.first() {
                Some(mapping) => match tables.mappings.get(&mapping.id) {
                    None => StoreResultCode::MappingDoesNotExist,
                    Some(current)
                        if current.is_locked() && presented != LockOwnerId::FORCE_UNLOCK =>
                    {
                        StoreResultCode::MappingIsAlreadyLocked
                    }
                    Some(_) => StoreResultCode::Success,
                },
                None => StoreResultCode::Failure,
            },
            StoreOperationCode::UnlockMapping => match payload.mappings_source.first() {
                Some(mapping) => match tables.mappings.get(&mapping.id) {
                    None => StoreResultCode::MappingDoesNotExist,
                    Some(current) if !current.lock_owner_id.admits(presented) => {
                        StoreResultCode::MappingLockOwnerIdDoesNotMatch
                    }
                    Some(_) => StoreResultCode::Success,
                },
                None => StoreResultCode::Failure,
            },
            StoreOperationCode::UnlockAllMappings => StoreResultCode::Success,
        };

        if code != StoreResultCode::Success {
            return StoreResults::of(code);
        }

        tables.operations.insert(
            op.operation_id,
            LogEntry {
                operation_id: op.operation_id,
                code: op.code,
                undo_start_state: op.undo_start_state,
                payload: payload.clone(),
            },
        );

        StoreResults::of(StoreResultCode::Success)
    }

    /// Shared checks for mutations of existing mappings: existence, lock
    /// ownership, and the offline requirement for shard-changing/removing
    /// mutations (waived by the force-unlock token).
    fn validate_mapping_mutation(
        tables: &Tables,
        payload: &OperationPayload,
        presented: LockOwnerId,
        requires_offline: bool,
    ) -> StoreResultCode {
        for mapping in &payload.mappings_source {
            let current = match tables.mappings.get(&mapping.id) {
                Some(current) => current,
                None => return StoreResultCode::MappingDoesNotExist,
            };
            if !current.lock_owner_id.admits(presented) {
                return StoreResultCode::MappingLockOwnerIdDoesNotMatch;
            }
            if requires_offline
                && current.status == MappingStatus::Online
                && presented != LockOwnerId::FORCE_UNLOCK
            {
                return StoreResultCode::MappingIsNotOffline;
            }
        }
        StoreResultCode::Success
    }

    /// Apply the final row changes and drop the intent row.
    ///
    /// A missing intent row means a previous attempt already finalized; the
    /// phase is idempotent and reports success.
    fn global_post_local(&self, op: &OperationRequest) -> StoreResults {
        let mut tables = self.tables.write();
        if tables.operations.remove(&op.operation_id).is_none() {
            return StoreResults::of(StoreResultCode::Success);
        }

        let payload = &op.payload;
        match op.code {
            StoreOperationCode::AddShard => {
                if let Some(shard) = &payload.shard_new {
                    tables.shards.insert(shard.id, shard.clone());
                }
            }
            StoreOperationCode::RemoveShard => {
                if let Some(shard) = &payload.shard_old {
                    tables.shards.remove(&shard.id);
                }
            }
            StoreOperationCode::UpdateShard => {
                if let Some(shard) = &payload.shard_new {
                    tables.shards.insert(shard.id, shard.clone());
                }
            }
            StoreOperationCode::UnlockAllMappings => {
                let presented = payload.lock_owner.unwrap_or(LockOwnerId::UNLOCKED);
                let map_id = payload.shard_map.as_ref().map(|m| m.id);
                for mapping in tables.mappings.values_mut() {
                    let in_map = map_id.map(|id| mapping.shard_map_id == id).unwrap_or(true);
                    let owned = presented == LockOwnerId::FORCE_UNLOCK
                        || mapping.lock_owner_id == presented;
                    if in_map && mapping.is_locked() && owned {
                        mapping.lock_owner_id = LockOwnerId::UNLOCKED;
                    }
                }
            }
            _ => {
                for mapping in &payload.mappings_source {
                    tables.mappings.remove(&mapping.id);
                }
                for mapping in &payload.mappings_target {
                    tables.mappings.insert(mapping.id, mapping.clone());
                }
            }
        }

        StoreResults::of(StoreResultCode::Success)
    }

    /// Revert the global intent: drop the log row. Idempotent.
    fn undo_global_post_local(&self, op: &OperationRequest) -> StoreResults {
        self.tables.write().operations.remove(&op.operation_id);
        StoreResults::of(StoreResultCode::Success)
    }

    /// Apply the operation's rows to this local store. Only rows whose shard
    /// location belongs to this store are touched, so the same payload serves
    /// the source and target phases.
    fn local_apply(&self, op: &OperationRequest) -> StoreResults {
        let mut tables = self.tables.write();
        let payload = &op.payload;

        if let Some(map) = &payload.shard_map {
            tables.shard_maps.entry(map.id).or_insert_with(|| map.clone());
        }

        if let Some(shard) = &payload.shard_old {
            if self.owns_location(&shard.location) && payload.shard_new.is_none() {
                tables.shards.remove(&shard.id);
            }
        }
        if let Some(shard) = &payload.shard_new {
            if self.owns_location(&shard.location) {
                tables.shards.insert(shard.id, shard.clone());
            }
        }

        for mapping in &payload.mappings_source {
            if self.owns_location(&mapping.shard.location) {
                tables.mappings.remove(&mapping.id);
            }
        }
        for mapping in &payload.mappings_target {
            if self.owns_location(&mapping.shard.location) {
                tables.mappings.insert(mapping.id, mapping.clone());
                tables
                    .shards
                    .entry(mapping.shard.id)
                    .or_insert_with(|| mapping.shard.clone());
            }
        }

        StoreResults::of(StoreResultCode::Success)
    }

    /// Restore this local store to its pre-operation rows. A phase that never
    /// applied leaves nothing to revert; the compensation still succeeds.
    fn local_revert(&self, op: &OperationRequest) -> StoreResults {
        let mut tables = self.tables.write();
        let payload = &op.payload;

        for mapping in &payload.mappings_target {
            if self.owns_location(&mapping.shard.location) {
                tables.mappings.remove(&mapping.id);
            }
        }
        for mapping in &payload.mappings_source {
            if self.owns_location(&mapping.shard.location) {
                tables.mappings.insert(mapping.id, mapping.clone());
            }
        }

        if let Some(shard) = &payload.shard_new {
            if self.owns_location(&shard.location) {
                tables.shards.remove(&shard.id);
            }
        }
        if let Some(shard) = &payload.shard_old {
            if self.owns_location(&shard.location) {
                tables.shards.insert(shard.id, shard.clone());
            }
        }

        StoreResults::of(StoreResultCode::Success)
    }
}

#[async_trait]
impl StoreConnection for InMemoryStore {
    async fn execute(&self, request: &StoreRequest) -> Result<StoreResults, StoreError> {
        Ok(self.handle(request))
    }
}

/// Store connection factory backed by in-memory stores: one global instance
/// plus one local instance per shard location, created on demand.
#[derive(Debug)]
pub struct InMemoryStoreFactory {
    global: Arc<InMemoryStore>,
    locals: RwLock<HashMap<ShardLocation, Arc<InMemoryStore>>>,
}

impl InMemoryStoreFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self {
            global: Arc::new(InMemoryStore::new_global()),
            locals: RwLock::new(HashMap::new()),
        }
    }

    /// Direct handle to the global store. Test observability.
    pub fn global_store(&self) -> Arc<InMemoryStore> {
        Arc::clone(&self.global)
    }

    /// Direct handle to the local store at `location`. Test observability.
    pub fn local_store(&self, location: &ShardLocation) -> Arc<InMemoryStore> {
        let mut locals = self.locals.write();
        Arc::clone(
            locals
                .entry(location.clone())
                .or_insert_with(|| Arc::new(InMemoryStore::new_local(location.clone()))),
        )
    }
}

impl Default for InMemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConnectionFactory for InMemoryStoreFactory {
    fn global(&self) -> Arc<dyn StoreConnection> {
        Arc::clone(&self.global) as Arc<dyn StoreConnection>
    }

    fn local(&self, location: &ShardLocation) -> Arc<dyn StoreConnection> {
        self.local_store(location) as Arc<dyn StoreConnection>
    }
}
