//! Polymorphic set algebra (spec.md §4.5 "SetIteration" / `set_operation`).
//!
//! The original's `SetOpTemplate.c` dispatches at runtime over whichever
//! of Bucket/Set/BTree/TreeSet it was handed, and raises a `TypeError` at
//! runtime if asked to combine a valueless Set with a valued Bucket in a
//! weighted operation (spec.md §4.5 "TypeError on asymmetric value/set
//! combinations"). This crate moves that check to compile time instead:
//! [`weighted_union`]/[`weighted_intersection`] are generic over `V:
//! Weighted`, so a caller simply cannot pass a key-only sequence to them —
//! there is no `Weighted for ()`. Plain (unweighted) `union`/
//! `intersection`/`difference` only ever look at keys, matching the
//! original's `Set`/`TreeSet`-only plain set algebra; mapping types
//! participate through [`SetIteration::keys_of`].
//!
//! `None` standing in for the empty set, and `difference(a, None) == a`,
//! are both spec.md §4.5 requirements; both fall out for free here by
//! defaulting an absent right-hand operand to an empty slice before the
//! merge sweep runs.

use crate::bucket::Bucket;
use crate::key::{KeyOps, ValueOps, Weighted};
use std::cmp::Ordering;

/// A materialized, ascending-sorted view over one operand of a set
/// operation (spec.md §4.5 "SetIteration"). Buckets and BTrees already
/// hand out their entries in sorted order, so building one is just a
/// matter of which projection (keys or (key, value) pairs) the caller
/// needs.
pub struct SetIteration<K> {
    pub keys: Vec<K>,
}

impl<K: KeyOps> SetIteration<K> {
    pub fn keys_of<V: ValueOps>(bucket: &Bucket<K, V>) -> Self {
        SetIteration {
            keys: bucket.keys_snapshot(),
        }
    }
}

fn merge_union<K: Ord + Clone>(a: &[K], b: &[K]) -> Vec<K> {
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::with_capacity(a.len() + b.len());
    while ai < a.len() && bi < b.len() {
        match a[ai].cmp(&b[bi]) {
            Ordering::Less => {
                out.push(a[ai].clone());
                ai += 1;
            }
            Ordering::Greater => {
                out.push(b[bi].clone());
                bi += 1;
            }
            Ordering::Equal => {
                out.push(a[ai].clone());
                ai += 1;
                bi += 1;
            }
        }
    }
    out.extend_from_slice(&a[ai..]);
    out.extend_from_slice(&b[bi..]);
    out
}

fn merge_intersection<K: Ord + Clone>(a: &[K], b: &[K]) -> Vec<K> {
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::new();
    while ai < a.len() && bi < b.len() {
        match a[ai].cmp(&b[bi]) {
            Ordering::Less => ai += 1,
            Ordering::Greater => bi += 1,
            Ordering::Equal => {
                out.push(a[ai].clone());
                ai += 1;
                bi += 1;
            }
        }
    }
    out
}

fn merge_difference<K: Ord + Clone>(a: &[K], b: &[K]) -> Vec<K> {
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::with_capacity(a.len());
    while ai < a.len() && bi < b.len() {
        match a[ai].cmp(&b[bi]) {
            Ordering::Less => {
                out.push(a[ai].clone());
                ai += 1;
            }
            Ordering::Greater => bi += 1,
            Ordering::Equal => {
                ai += 1;
                bi += 1;
            }
        }
    }
    out.extend_from_slice(&a[ai..]);
    out
}

/// Keys present in either operand (spec.md §4.5 "union"). `b = None` is
/// treated as the empty set.
pub fn union<K: KeyOps>(a: &[K], b: Option<&[K]>) -> Vec<K> {
    merge_union(a, b.unwrap_or(&[]))
}

/// Keys present in both operands.
pub fn intersection<K: KeyOps>(a: &[K], b: Option<&[K]>) -> Vec<K> {
    merge_intersection(a, b.unwrap_or(&[]))
}

/// Keys present in `a` but not `b`. `difference(a, None) == a`, the
/// "right-side identity" spec.md §4.5 calls out explicitly.
pub fn difference<K: KeyOps>(a: &[K], b: Option<&[K]>) -> Vec<K> {
    merge_difference(a, b.unwrap_or(&[]))
}

/// Same as [`difference`] but keeps `a`'s values for the surviving keys,
/// for `Bucket - Set`/`Bucket - Bucket` callers that want a mapping back
/// (the right operand is a membership test only, its values if any are
/// ignored).
pub fn difference_with_values<K: KeyOps, V: ValueOps>(
    a: &[(K, V)],
    b: Option<&[K]>,
) -> Vec<(K, V)> {
    let b = b.unwrap_or(&[]);
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::with_capacity(a.len());
    while ai < a.len() && bi < b.len() {
        match a[ai].0.cmp(&b[bi]) {
            Ordering::Less => {
                out.push(a[ai].clone());
                ai += 1;
            }
            Ordering::Greater => bi += 1,
            Ordering::Equal => {
                ai += 1;
                bi += 1;
            }
        }
    }
    out.extend_from_slice(&a[ai..]);
    out
}

/// Weighted union (spec.md §4.5 "weightedUnion"): a key present in only
/// one operand is scaled by that operand's weight; a key present in both
/// is combined via [`Weighted::weighted_add`]. `b = None` behaves as the
/// empty set, so every surviving key from `a` is scaled by `wa` alone.
pub fn weighted_union<K: KeyOps, V: Weighted>(
    a: &[(K, V)],
    wa: f64,
    b: Option<&[(K, V)]>,
    wb: f64,
) -> Vec<(K, V)> {
    let empty: &[(K, V)] = &[];
    let b = b.unwrap_or(empty);
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::with_capacity(a.len() + b.len());
    while ai < a.len() && bi < b.len() {
        match a[ai].0.cmp(&b[bi].0) {
            Ordering::Less => {
                out.push((a[ai].0.clone(), V::weighted(&a[ai].1, wa)));
                ai += 1;
            }
            Ordering::Greater => {
                out.push((b[bi].0.clone(), V::weighted(&b[bi].1, wb)));
                bi += 1;
            }
            Ordering::Equal => {
                out.push((
                    a[ai].0.clone(),
                    V::weighted_add(&a[ai].1, wa, &b[bi].1, wb),
                ));
                ai += 1;
                bi += 1;
            }
        }
    }
    while ai < a.len() {
        out.push((a[ai].0.clone(), V::weighted(&a[ai].1, wa)));
        ai += 1;
    }
    while bi < b.len() {
        out.push((b[bi].0.clone(), V::weighted(&b[bi].1, wb)));
        bi += 1;
    }
    out
}

/// Weighted intersection (spec.md §4.5 "weightedIntersection"): only
/// keys present in both operands survive, combined via
/// [`Weighted::weighted_add`].
pub fn weighted_intersection<K: KeyOps, V: Weighted>(
    a: &[(K, V)],
    wa: f64,
    b: Option<&[(K, V)]>,
    wb: f64,
) -> Vec<(K, V)> {
    let empty: &[(K, V)] = &[];
    let b = b.unwrap_or(empty);
    let mut ai = 0;
    let mut bi = 0;
    let mut out = Vec::new();
    while ai < a.len() && bi < b.len() {
        match a[ai].0.cmp(&b[bi].0) {
            Ordering::Less => ai += 1,
            Ordering::Greater => bi += 1,
            Ordering::Equal => {
                out.push((
                    a[ai].0.clone(),
                    V::weighted_add(&a[ai].1, wa, &b[bi].1, wb),
                ));
                ai += 1;
                bi += 1;
            }
        }
    }
    out
}
