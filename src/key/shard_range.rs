//! Half-open key ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, ShardManagementError};
use crate::key::ShardKey;

/// A half-open key interval `[low, high)`.
///
/// Construction enforces `low < high`; `high` may be the Max sentinel,
/// meaning unbounded above. Ranges order by `low`, then `high`, which is the
/// order the range cache iterates them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    /// Create a range `[low, high)`.
    ///
    /// Fails with `KeyTypeMismatch` when the bounds have different types and
    /// with `InvalidRange` when `low >= high`.
    pub fn new(low: ShardKey, high: ShardKey) -> Result<Self> {
        if low.try_compare(&high)? != Ordering::Less {
            return Err(ShardManagementError::InvalidRange);
        }
        Ok(Self { low, high })
    }

    /// Degenerate `[key, key)` probe used for ordered-map searches.
    ///
    /// Not a valid range: it contains nothing and exists only to position a
    /// key within a sorted sequence of ranges.
    pub(crate) fn point_probe(key: ShardKey) -> Self {
        Self {
            low: key.clone(),
            high: key,
        }
    }

    /// Inclusive lower bound.
    pub fn low(&self) -> &ShardKey {
        &self.low
    }

    /// Exclusive upper bound.
    pub fn high(&self) -> &ShardKey {
        &self.high
    }

    /// Consume the range into its `(low, high)` bounds.
    pub fn into_keys(self) -> (ShardKey, ShardKey) {
        (self.low, self.high)
    }

    /// Whether `low <= key < high`.
    pub fn contains(&self, key: &ShardKey) -> bool {
        key.key_type() == self.low.key_type() && key >= &self.low && key < &self.high
    }

    /// Standard half-open interval overlap test.
    pub fn intersects(&self, other: &ShardRange) -> bool {
        self.low < other.high && other.low < self.high
    }

    /// Whether this range ends exactly where `other` begins.
    ///
    /// Adjacency is the precondition for merging two ranges.
    pub fn is_adjacent_to(&self, other: &ShardRange) -> bool {
        self.high == other.low
    }

    /// Merge two adjacent ranges `[x, y)` and `[y, z)` into `[x, z)`.
    pub fn merge(&self, other: &ShardRange) -> Result<ShardRange> {
        if !self.is_adjacent_to(other) {
            return Err(ShardManagementError::RangesNotAdjacent);
        }
        ShardRange::new(self.low.clone(), other.high.clone())
    }
}

impl Ord for ShardRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.low
            .cmp(&other.low)
            .then_with(|| self.high.cmp(&other.high))
    }
}

impl PartialOrd for ShardRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;

    fn range(low: i64, high: i64) -> ShardRange {
        ShardRange::new(ShardKey::new_int64(low), ShardKey::new_int64(high)).unwrap()
    }

    #[test]
    fn test_construction_rejects_inverted_bounds() {
        assert!(matches!(
            ShardRange::new(ShardKey::new_int64(10), ShardKey::new_int64(10)),
            Err(ShardManagementError::InvalidRange)
        ));
        assert!(matches!(
            ShardRange::new(ShardKey::new_int64(10), ShardKey::new_int64(5)),
            Err(ShardManagementError::InvalidRange)
        ));
        assert!(matches!(
            ShardRange::new(ShardKey::new_int64(0), ShardKey::new_string("z")),
            Err(ShardManagementError::KeyTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_containment_half_open() {
        let r = range(0, 10);
        assert!(r.contains(&ShardKey::new_int64(0)));
        assert!(r.contains(&ShardKey::new_int64(9)));
        assert!(!r.contains(&ShardKey::new_int64(10)));
        assert!(!r.contains(&ShardKey::new_int64(-1)));
        assert!(!r.contains(&ShardKey::new_string("5")));
    }

    #[test]
    fn test_unbounded_above() {
        let r = ShardRange::new(
            ShardKey::new_int64(100),
            ShardKey::max(ShardKeyType::Int64),
        )
        .unwrap();
        assert!(r.contains(&ShardKey::new_int64(i64::MAX)));
        assert!(!r.contains(&ShardKey::new_int64(99)));
    }

    #[test]
    fn test_intersection() {
        assert!(range(0, 10).intersects(&range(5, 15)));
        assert!(range(5, 15).intersects(&range(0, 10)));
        assert!(range(0, 10).intersects(&range(0, 10)));
        // Adjacent ranges do not overlap.
        assert!(!range(0, 10).intersects(&range(10, 20)));
        assert!(!range(10, 20).intersects(&range(0, 10)));
    }

    #[test]
    fn test_adjacency_and_merge() {
        let a = range(0, 10);
        let b = range(10, 20);
        assert!(a.is_adjacent_to(&b));
        assert!(!b.is_adjacent_to(&a));

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged, range(0, 20));

        // Non-adjacent merge fails.
        assert!(matches!(
            range(0, 10).merge(&range(11, 20)),
            Err(ShardManagementError::RangesNotAdjacent)
        ));
    }

    #[test]
    fn test_ordering_by_low_then_high() {
        let mut ranges = vec![range(10, 20), range(0, 10), range(0, 5)];
        ranges.sort();
        assert_eq!(ranges, vec![range(0, 5), range(0, 10), range(10, 20)]);
    }
}
