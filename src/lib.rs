//! Shard map management for horizontally partitioned data.
//!
//! This crate tracks which key values or key ranges live on which physical
//! shard and keeps that metadata consistent across two store tiers:
//! - A **global store** holding the authoritative directory of shard maps,
//!   shards and mappings
//! - **Per-shard local stores** holding each shard's own slice, so a shard
//!   can validate routed requests without a global round trip
//! - An **in-process cache** answering hot-path lookups without any store
//!   round trip
//!
//! # Features
//!
//! - List (point) and range shard maps over typed, byte-ordered shard keys
//! - Crash-safe mutations via a Do/Undo phase protocol with a persisted
//!   operations log
//! - Mapping lookups served from a TTL cache with capped back-off refresh
//! - Lock tokens fencing mappings during multi-step workflows
//! - Resumable recovery of operations a dead process left behind
//!
//! # Example
//!
//! ```rust,no_run
//! use shardmap::{
//!     LookupOptions, ShardKey, ShardKeyType, ShardLocation, ShardMapKind,
//!     ShardMapManager, ShardMapManagerConfig, ShardRange,
//! };
//! use shardmap::store::memory::InMemoryStoreFactory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = Arc::new(InMemoryStoreFactory::new());
//!     let manager = ShardMapManager::new(factory, ShardMapManagerConfig::default());
//!
//!     // A range map over 64-bit keys with one shard.
//!     let map = manager
//!         .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int64)
//!         .await?;
//!     let shard = manager
//!         .add_shard(&map, ShardLocation::new("srv1", "orders_db"))
//!         .await?;
//!
//!     // Route [0, 1000) to that shard.
//!     let range = ShardRange::new(ShardKey::new_int64(0), ShardKey::new_int64(1000))?;
//!     manager.create_range_mapping(&map, range, shard).await?;
//!
//!     // Hot-path lookup: cache first, store on miss or expiry.
//!     let mapping = manager
//!         .lookup_mapping(&map, &ShardKey::new_int64(42), LookupOptions::LookupInCacheThenStore)
//!         .await?;
//!     println!("key 42 routes to {}", mapping.shard.location);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │           ShardMapManager API               │
//! │  • create_shard_map / add_shard             │
//! │  • create_*_mapping / move / split / merge  │
//! │  • lookup_mapping(key) -> StoreMapping      │
//! └─────────────────────────────────────────────┘
//!           │               │
//!           ▼               ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ Mapping      │   │  Operation   │
//! │ Cache (TTL)  │   │  Executor    │
//! └──────────────┘   └──────┬───────┘
//!                           │ Do/Undo phases
//!              ┌────────────┼────────────┐
//!              ▼            ▼            ▼
//!        ┌─────────┐  ┌─────────┐  ┌─────────┐
//!        │ Global  │  │ Local   │  │ Local   │
//!        │ Store   │  │ Store A │  │ Store B │
//!        └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Mutations**: each operation writes a durable intent row in the global
//!   store, applies local-store changes, then finalizes globally; a failure
//!   at any phase triggers a mirrored, idempotent undo sequence
//! - **Lookups**: locally consistent from the cache; expired entries fall
//!   back to the global store and refresh
//! - **Recovery**: operations left behind by a dead process are discovered
//!   in the global log and rolled back from their persisted undo state

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod operation;
pub mod retry;
pub mod store;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use config::{CacheConfig, RetryBehavior, RetryConfig, ShardMapManagerConfig};
pub use error::{ErrorCategory, Result, ShardManagementError, StoreError};
pub use key::{ShardKey, ShardKeyType, ShardRange};
pub use manager::{LookupOptions, ShardMapManager};
pub use types::{
    LockOwnerId, MappingStatus, ShardLocation, ShardMapKind, ShardStatus, StoreMapping,
    StoreShard, StoreShardMap,
};

// Re-export the store contract for custom store backends
pub use store::{StoreConnection, StoreConnectionFactory};
