//! Key and value trait bundles (spec.md §3, REDESIGN FLAGS "recursive
//! template instantiation").
//!
//! The original generates a dozen II/IO/OI/OO/... parameterizations of the
//! same C templates by preprocessor macro. This crate collapses that family
//! into one generic `Bucket<K, V>` / `BTree<K, V>` pair parameterized by
//! these two trait bundles, the way the spec's redesign note recommends.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Total order, copy, and (de)serialize for a tree/bucket key.
///
/// `Ord` stands in for the original's comparator slot. A comparator is
/// allowed to be arbitrary user code in the source design (it can run
/// object `__cmp__` methods); this crate's binary searches treat a panic
/// inside `Ord::cmp` as a logic error in the key type itself, since Rust
/// has no equivalent of a raising C comparator callback — comparator
/// failures that originate from I/O or user callbacks are surfaced via
/// `Error::Comparator` at the one seam where they can occur, key
/// normalization in [`KeyOps::checked_cmp`].
pub trait KeyOps: Ord + Clone + Debug + Serialize + DeserializeOwned + 'static {
    /// A comparison hook that can fail, for key types whose ordering
    /// depends on a collaborator (e.g. objects resolved through a jar).
    /// The default just delegates to `Ord`, which cannot fail.
    fn checked_cmp(&self, other: &Self) -> Result<std::cmp::Ordering, crate::error::Error> {
        Ok(self.cmp(other))
    }
}

impl<T: Ord + Clone + Debug + Serialize + DeserializeOwned + 'static> KeyOps for T {}

/// Copy, equality (needed by three-way merge's "both sides made the same
/// edit" branch) and (de)serialize for a bucket value.
pub trait ValueOps: Clone + PartialEq + Debug + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + 'static> ValueOps for T {}

/// Extension for value types that support the weighted set-algebra
/// variants (spec.md §4.5, `weightedUnion` / `weightedIntersection`).
pub trait Weighted: ValueOps {
    fn weighted(value: &Self, weight: f64) -> Self;
    fn weighted_add(a: &Self, wa: f64, b: &Self, wb: f64) -> Self;
}

impl Weighted for f64 {
    fn weighted(value: &Self, weight: f64) -> Self {
        value * weight
    }
    fn weighted_add(a: &Self, wa: f64, b: &Self, wb: f64) -> Self {
        a * wa + b * wb
    }
}

impl Weighted for i64 {
    fn weighted(value: &Self, weight: f64) -> Self {
        (*value as f64 * weight).round() as i64
    }
    fn weighted_add(a: &Self, wa: f64, b: &Self, wb: f64) -> Self {
        (*a as f64 * wa + *b as f64 * wb).round() as i64
    }
}

/// Value type for value-less Set/TreeSet buckets (spec.md §4.2 "Set-bucket
/// specializations"). A `Bucket<K, NoValue>` never allocates a values
/// array; see [`crate::bucket::Bucket::is_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NoValue;
