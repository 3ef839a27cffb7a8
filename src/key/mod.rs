//! Typed, totally ordered shard keys and half-open key ranges.
//!
//! Both the store rows and the mapping cache depend on this ordering model:
//! keys compare over their canonical byte encoding, and ranges are half-open
//! `[low, high)` intervals with a distinguished +inf upper bound.

mod shard_key;
mod shard_range;

pub use shard_key::{ShardKey, ShardKeyType};
pub use shard_range::ShardRange;
