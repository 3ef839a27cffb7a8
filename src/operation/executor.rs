//! Drives the phase sequence of a [`StoreOperation`].
//!
//! Forward order is global intent, source local store, target local store,
//! global finalize. Before each local phase commits, the persisted undo start
//! state in the global log row is advanced, so a process that dies mid-flight
//! leaves behind exactly the information needed to compensate. Undo mirrors
//! the forward phases in reverse and tolerates phases that never applied.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{CachePolicy, CacheStore};
use crate::error::{Result, ShardManagementError, StoreError};
use crate::retry::RetryPolicy;
use crate::store::{
    LogEntry, OperationPhase, StoreConnection, StoreConnectionFactory, StoreOperationCode,
    StoreOperationState, StoreRequest, StoreResultCode, StoreResults,
};
use crate::types::ShardLocation;

use super::StoreOperation;

fn storage_failure(source: StoreError) -> ShardManagementError {
    ShardManagementError::StorageOperationFailure { source }
}

/// Executes operations phase by phase, with per-phase retry, compensation on
/// failure, and cache maintenance on success.
#[derive(Debug)]
pub struct OperationExecutor {
    factory: Arc<dyn StoreConnectionFactory>,
    retry: RetryPolicy,
    cache: Arc<CacheStore>,
}

impl OperationExecutor {
    pub fn new(
        factory: Arc<dyn StoreConnectionFactory>,
        retry: RetryPolicy,
        cache: Arc<CacheStore>,
    ) -> Self {
        Self {
            factory,
            retry,
            cache,
        }
    }

    /// Execute the full forward sequence.
    ///
    /// A failed forward phase triggers the mirrored undo sequence; the
    /// forward error is returned when compensation succeeds, and
    /// [`ShardManagementError::OrphanedOperation`] when it does not (the log
    /// row stays behind for [`OperationExecutor::resume`]).
    pub async fn execute(&self, operation: &StoreOperation) -> Result<StoreResults> {
        let global = self.factory.global();
        debug!(
            operation_id = %operation.id,
            code = %operation.code,
            "executing operation"
        );

        let results = self
            .run_phase(
                &global,
                operation,
                OperationPhase::GlobalPreLocal,
                StoreOperationState::UndoGlobalPostLocal,
            )
            .await
            .map_err(storage_failure)?;
        if results.code != StoreResultCode::Success {
            // Nothing durable happened; no compensation needed.
            return Err(operation.error_for(results.code));
        }

        let mut undo_from = StoreOperationState::UndoGlobalPostLocal;
        match self.run_remaining_forward(operation, &global, &mut undo_from).await {
            Ok(results) => {
                self.apply_cache(operation);
                info!(
                    operation_id = %operation.id,
                    code = %operation.code,
                    "operation committed"
                );
                Ok(results)
            }
            Err(err) => {
                warn!(
                    operation_id = %operation.id,
                    code = %operation.code,
                    error = %err,
                    "operation failed, compensating"
                );
                self.undo_from(operation, undo_from).await?;
                Err(err)
            }
        }
    }

    /// Resume a crashed operation found in the global log: run the undo
    /// sequence from the persisted state.
    pub async fn resume(&self, entry: LogEntry) -> Result<()> {
        let undo_from = entry.undo_start_state;
        let operation = StoreOperation::from_log_entry(entry);
        info!(
            operation_id = %operation.id,
            code = %operation.code,
            undo_from = %undo_from,
            "resuming pending operation"
        );
        self.undo_from(&operation, undo_from).await
    }

    async fn run_remaining_forward(
        &self,
        operation: &StoreOperation,
        global: &Arc<dyn StoreConnection>,
        undo_from: &mut StoreOperationState,
    ) -> Result<StoreResults> {
        if let Some(source) = operation.source_location() {
            // The undo marker must be durable before the phase can commit.
            self.advance_state(global, operation, StoreOperationState::UndoLocalSource)
                .await?;
            *undo_from = StoreOperationState::UndoLocalSource;
            self.run_local_phase(operation, source, OperationPhase::LocalSource)
                .await?;
        }

        if let Some(target) = operation.target_location() {
            self.advance_state(global, operation, StoreOperationState::UndoLocalTarget)
                .await?;
            *undo_from = StoreOperationState::UndoLocalTarget;
            self.run_local_phase(operation, target, OperationPhase::LocalTarget)
                .await?;
        }

        let results = self
            .run_phase(
                global,
                operation,
                OperationPhase::GlobalPostLocal,
                StoreOperationState::DoEnd,
            )
            .await
            .map_err(storage_failure)?;
        if results.code != StoreResultCode::Success {
            return Err(operation.error_for(results.code));
        }
        Ok(results)
    }

    async fn run_local_phase(
        &self,
        operation: &StoreOperation,
        location: &ShardLocation,
        phase: OperationPhase,
    ) -> Result<()> {
        let local = self.factory.local(location);
        let results = self
            .run_phase(&local, operation, phase, StoreOperationState::DoBegin)
            .await
            .map_err(storage_failure)?;
        if results.code != StoreResultCode::Success {
            return Err(operation.error_for(results.code));
        }
        Ok(())
    }

    /// Run the undo phases that still apply given the recorded state, in
    /// reverse forward order. Any failure here leaves the log row in place
    /// and surfaces as an orphaned operation.
    async fn undo_from(
        &self,
        operation: &StoreOperation,
        undo_from: StoreOperationState,
    ) -> Result<()> {
        let orphaned = |reason: String| {
            error!(
                operation_id = %operation.id,
                code = %operation.code,
                reason = %reason,
                "compensation failed, operation left pending"
            );
            ShardManagementError::OrphanedOperation {
                operation_id: operation.id,
                reason,
            }
        };

        if undo_from >= StoreOperationState::UndoLocalTarget {
            if let Some(target) = operation.target_location() {
                self.undo_local_phase(operation, target, OperationPhase::UndoLocalTarget)
                    .await
                    .map_err(|e| orphaned(e.to_string()))?;
            }
        }
        if undo_from >= StoreOperationState::UndoLocalSource {
            if let Some(source) = operation.source_location() {
                self.undo_local_phase(operation, source, OperationPhase::UndoLocalSource)
                    .await
                    .map_err(|e| orphaned(e.to_string()))?;
            }
        }

        let global = self.factory.global();
        let results = self
            .run_phase(
                &global,
                operation,
                OperationPhase::UndoGlobalPostLocal,
                StoreOperationState::UndoEnd,
            )
            .await
            .map_err(|e| orphaned(e.to_string()))?;
        if results.code != StoreResultCode::Success {
            return Err(orphaned(format!("global undo returned {}", results.code)));
        }

        // Cached rows touched by the aborted operation are suspect.
        for mapping in operation
            .payload
            .mappings_source
            .iter()
            .chain(operation.payload.mappings_target.iter())
        {
            self.cache.remove_mapping(mapping);
        }

        info!(operation_id = %operation.id, "operation rolled back");
        Ok(())
    }

    async fn undo_local_phase(
        &self,
        operation: &StoreOperation,
        location: &ShardLocation,
        phase: OperationPhase,
    ) -> std::result::Result<(), StoreError> {
        let local = self.factory.local(location);
        let results = self
            .run_phase(&local, operation, phase, StoreOperationState::DoBegin)
            .await?;
        if results.code != StoreResultCode::Success {
            return Err(StoreError::Rejected(format!(
                "{phase} returned {}",
                results.code
            )));
        }
        Ok(())
    }

    async fn advance_state(
        &self,
        global: &Arc<dyn StoreConnection>,
        operation: &StoreOperation,
        state: StoreOperationState,
    ) -> Result<()> {
        let request = StoreRequest::AdvanceOperationState {
            operation_id: operation.id,
            undo_start_state: state,
        };
        self.retry
            .execute(|| {
                let global = Arc::clone(global);
                let request = request.clone();
                async move { global.execute(&request).await }
            })
            .await
            .map_err(storage_failure)?;
        Ok(())
    }

    async fn run_phase(
        &self,
        connection: &Arc<dyn StoreConnection>,
        operation: &StoreOperation,
        phase: OperationPhase,
        undo_start_state: StoreOperationState,
    ) -> std::result::Result<StoreResults, StoreError> {
        let request = operation.request(phase, undo_start_state);
        debug!(operation_id = %operation.id, %phase, "running phase");
        self.retry
            .execute(|| {
                let connection = Arc::clone(connection);
                let request = request.clone();
                async move { connection.execute(&request).await }
            })
            .await
    }

    /// Fold a committed operation into the mapping cache: source rows leave,
    /// target rows enter.
    fn apply_cache(&self, operation: &StoreOperation) {
        let kind = match operation.payload.shard_map.as_ref() {
            Some(map) => map.kind,
            None => return,
        };

        if operation.code == StoreOperationCode::UnlockAllMappings {
            // The affected row set is unknown to the payload.
            if let Some(map) = operation.payload.shard_map.as_ref() {
                self.cache.clear_map(map.id);
            }
            return;
        }

        for mapping in &operation.payload.mappings_source {
            self.cache.remove_mapping(mapping);
        }
        for mapping in &operation.payload.mappings_target {
            self.cache
                .add_or_update_mapping(mapping.clone(), kind, CachePolicy::OverwriteExisting);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::key::{ShardKey, ShardKeyType};
    use crate::retry::FixedInterval;
    use crate::store::memory::InMemoryStoreFactory;
    use crate::types::{LockOwnerId, ShardMapKind, StoreMapping, StoreShard, StoreShardMap};

    /// Wraps a factory and injects failures into chosen phases.
    #[derive(Debug)]
    struct FaultyFactory {
        inner: Arc<InMemoryStoreFactory>,
        fail_phase: OperationPhase,
        failures: Arc<AtomicU32>,
        transient: bool,
    }

    #[derive(Debug)]
    struct FaultyConnection {
        inner: Arc<dyn StoreConnection>,
        fail_phase: OperationPhase,
        failures: Arc<AtomicU32>,
        transient: bool,
    }

    #[async_trait]
    impl StoreConnection for FaultyConnection {
        async fn execute(
            &self,
            request: &StoreRequest,
        ) -> std::result::Result<StoreResults, StoreError> {
            if let StoreRequest::Operation(op) = request {
                if op.phase == self.fail_phase {
                    let remaining = self.failures.load(Ordering::SeqCst);
                    if remaining > 0 {
                        self.failures.fetch_sub(1, Ordering::SeqCst);
                        return Err(if self.transient {
                            StoreError::Timeout {
                                target: "faulty".into(),
                            }
                        } else {
                            StoreError::Rejected("injected".into())
                        });
                    }
                }
            }
            self.inner.execute(request).await
        }
    }

    impl StoreConnectionFactory for FaultyFactory {
        fn global(&self) -> Arc<dyn StoreConnection> {
            Arc::new(FaultyConnection {
                inner: self.inner.global(),
                fail_phase: self.fail_phase,
                failures: Arc::clone(&self.failures),
                transient: self.transient,
            })
        }

        fn local(&self, location: &ShardLocation) -> Arc<dyn StoreConnection> {
            Arc::new(FaultyConnection {
                inner: self.inner.local(location),
                fail_phase: self.fail_phase,
                failures: Arc::clone(&self.failures),
                transient: self.transient,
            })
        }
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::new(Box::new(FixedInterval {
            max_retries: 3,
            interval: Duration::from_millis(1),
        }))
    }

    fn cache() -> Arc<CacheStore> {
        Arc::new(CacheStore::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
        ))
    }

    async fn seeded_factory() -> (Arc<InMemoryStoreFactory>, StoreShardMap) {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int64);
        factory
            .global()
            .execute(&StoreRequest::AddShardMap {
                shard_map: map.clone(),
            })
            .await
            .unwrap();
        (factory, map)
    }

    fn executor(factory: Arc<dyn StoreConnectionFactory>, cache: Arc<CacheStore>) -> OperationExecutor {
        OperationExecutor::new(factory, retry_policy(), cache)
    }

    #[tokio::test]
    async fn test_add_shard_commits_globally_and_locally() {
        let (factory, map) = seeded_factory().await;
        let exec = executor(Arc::clone(&factory) as _, cache());

        let location = ShardLocation::new("srv1", "db1");
        let shard = StoreShard::new(map.id, location.clone());
        exec.execute(&StoreOperation::add_shard(map.clone(), shard.clone()))
            .await
            .unwrap();

        let res = factory
            .global()
            .execute(&StoreRequest::GetShardsForMap { shard_map: map })
            .await
            .unwrap();
        assert_eq!(res.shards.len(), 1);
        assert_eq!(factory.global_store().pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_committed_mapping_lands_in_cache() {
        let (factory, map) = seeded_factory().await;
        let cache = cache();
        let exec = executor(Arc::clone(&factory) as _, Arc::clone(&cache));

        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        exec.execute(&StoreOperation::add_shard(map.clone(), shard.clone()))
            .await
            .unwrap();

        let mapping = StoreMapping::new(
            map.id,
            shard,
            ShardKey::new_int64(0),
            ShardKey::new_int64(100),
        );
        exec.execute(&StoreOperation::add_mapping(map.clone(), mapping.clone()))
            .await
            .unwrap();

        let hit = cache
            .lookup_mapping(map.id, &ShardKey::new_int64(50))
            .unwrap();
        assert_eq!(hit.mapping.id, mapping.id);
        assert!(!hit.is_expired);
    }

    #[tokio::test]
    async fn test_transient_local_failure_is_retried() {
        let (inner, map) = seeded_factory().await;
        let factory = Arc::new(FaultyFactory {
            inner: Arc::clone(&inner),
            fail_phase: OperationPhase::LocalSource,
            failures: Arc::new(AtomicU32::new(2)),
            transient: true,
        });
        let exec = executor(factory as _, cache());

        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        exec.execute(&StoreOperation::add_shard(map, shard))
            .await
            .unwrap();
        assert_eq!(inner.global_store().pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_move_is_rolled_back() {
        let (inner, map) = seeded_factory().await;
        let cache = cache();
        let exec = executor(Arc::clone(&inner) as _, Arc::clone(&cache));

        // Two shards with a mapping on the first.
        let source_shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        let target_shard = StoreShard::new(map.id, ShardLocation::new("srv2", "db2"));
        exec.execute(&StoreOperation::add_shard(map.clone(), source_shard.clone()))
            .await
            .unwrap();
        exec.execute(&StoreOperation::add_shard(map.clone(), target_shard.clone()))
            .await
            .unwrap();

        let mut mapping = StoreMapping::new(
            map.id,
            source_shard,
            ShardKey::new_int64(0),
            ShardKey::new_int64(100),
        );
        exec.execute(&StoreOperation::add_mapping(map.clone(), mapping.clone()))
            .await
            .unwrap();
        mapping.status = crate::types::MappingStatus::Offline;
        let current = mapping.clone();
        exec.execute(&StoreOperation::update_mapping(
            map.clone(),
            {
                let mut online = current.clone();
                online.status = crate::types::MappingStatus::Online;
                online
            },
            current.clone(),
            LockOwnerId::UNLOCKED,
        ))
        .await
        .unwrap();

        // Move fails permanently at the target local phase.
        let faulty = Arc::new(FaultyFactory {
            inner: Arc::clone(&inner),
            fail_phase: OperationPhase::LocalTarget,
            failures: Arc::new(AtomicU32::new(100)),
            transient: false,
        });
        let exec = executor(faulty as _, Arc::clone(&cache));

        let mut moved = current.clone();
        moved.shard = target_shard;
        let err = exec
            .execute(&StoreOperation::update_mapping(
                map.clone(),
                current.clone(),
                moved,
                LockOwnerId::UNLOCKED,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::StorageOperationFailure { .. }
        ));

        // Rolled back: no pending log row, mapping still routes to srv1.
        assert_eq!(inner.global_store().pending_operation_count(), 0);
        let res = inner
            .global()
            .execute(&StoreRequest::FindMappingForKey {
                shard_map: map,
                key: ShardKey::new_int64(50),
            })
            .await
            .unwrap();
        assert_eq!(res.mappings[0].shard.location.server, "srv1");
        // The source local store got its row back.
        assert_eq!(
            inner
                .local_store(&ShardLocation::new("srv1", "db1"))
                .mapping_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_undo_surfaces_orphaned_operation() {
        let (inner, map) = seeded_factory().await;
        let exec = executor(Arc::clone(&inner) as _, cache());

        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        exec.execute(&StoreOperation::add_shard(map.clone(), shard.clone()))
            .await
            .unwrap();

        // Forward fails at LocalSource and the compensation for it fails too.
        let failures = Arc::new(AtomicU32::new(100));
        let forward_faulty = Arc::new(FaultyFactory {
            inner: Arc::clone(&inner),
            fail_phase: OperationPhase::LocalSource,
            failures: Arc::clone(&failures),
            transient: false,
        });
        // Chain two injectors: forward failure, then undo failure.
        #[derive(Debug)]
        struct Both {
            forward: Arc<FaultyFactory>,
            undo_phase: OperationPhase,
        }
        impl StoreConnectionFactory for Both {
            fn global(&self) -> Arc<dyn StoreConnection> {
                self.forward.global()
            }
            fn local(&self, location: &ShardLocation) -> Arc<dyn StoreConnection> {
                Arc::new(FaultyConnection {
                    inner: self.forward.local(location),
                    fail_phase: self.undo_phase,
                    failures: Arc::new(AtomicU32::new(100)),
                    transient: false,
                })
            }
        }
        let exec = executor(
            Arc::new(Both {
                forward: forward_faulty,
                undo_phase: OperationPhase::UndoLocalSource,
            }) as _,
            cache(),
        );

        let mapping = StoreMapping::new(
            map.id,
            shard,
            ShardKey::new_int64(0),
            ShardKey::new_int64(100),
        );
        let err = exec
            .execute(&StoreOperation::add_mapping(map, mapping))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardManagementError::OrphanedOperation { .. }
        ));
        // The log row was left behind for recovery.
        assert_eq!(inner.global_store().pending_operation_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_compensates_and_clears_log() {
        let (factory, map) = seeded_factory().await;
        let exec = executor(Arc::clone(&factory) as _, cache());

        let shard = StoreShard::new(map.id, ShardLocation::new("srv1", "db1"));
        exec.execute(&StoreOperation::add_shard(map.clone(), shard.clone()))
            .await
            .unwrap();

        // Simulate a crash: intent written, source local phase applied, then
        // nothing.
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
        assert_eq!(factory.local_store(&shard.location).mapping_count(), 1);

        // A fresh process discovers and resumes the pending operation.
        let pending = global
            .execute(&StoreRequest::GetPendingOperations)
            .await
            .unwrap()
            .operations;
        assert_eq!(pending.len(), 1);
        let entry = pending.into_iter().next().unwrap();
        exec.resume(entry.clone()).await.unwrap();

        assert_eq!(factory.global_store().pending_operation_count(), 0);
        assert_eq!(factory.local_store(&shard.location).mapping_count(), 0);

        // Running the same undo again is a no-op success.
        exec.resume(entry).await.unwrap();
        assert_eq!(factory.global_store().pending_operation_count(), 0);
    }
}
