//! Three-way conflict merge (spec.md §4.5 "bucket_merge", §7 "Conflict").
//!
//! Ported from the original's `bucket_merge` (`MergeTemplate.c`): a
//! simultaneous walk across three sorted cursors over `old` (the state both
//! sides started from), `committed` (already on disk) and `new` (the
//! transaction trying to land). At each step the three current keys are
//! compared pairwise; depending on which keys coincide, either a value
//! passes straight through, both sides' identical edit passes through once,
//! or the walk reports `Error::Conflict` with one of nine reason codes
//! naming exactly which comparison failed. The codes and their trigger
//! conditions are preserved from the original numbering rather than
//! invented here, since callers (and spec.md §9) treat them as a stable
//! external contract.
//!
//! [`set_merge`] runs the identical walk with value comparisons replaced by
//! "always equal" (there is nothing to compare for a value-less key). That
//! collapses reasons 1-3 (which only fire on a genuine value mismatch) to
//! unreachable for a Set/TreeSet merge, but the purely key-position reasons
//! 4-9 ("dueling insert", "dueling delete", ...) are still real outcomes of
//! a set merge — two sides can still disagree about which keys exist even
//! though neither has a "value" to disagree about. `set_merge` is therefore
//! fallible, not infallible.

use crate::bucket::Bucket;
use crate::error::Error;
use crate::key::{KeyOps, ValueOps};
use std::cmp::Ordering;

/// Reasons `bucket_merge`/`set_merge` can refuse to auto-resolve (spec.md
/// §4.5, §9 "Preserve these codes"). Numbered to match the original's
/// `merge_error(p1, p2, p3, reason)` call sites in `bucket_merge`.
pub mod reason {
    use crate::error::ConflictReason;

    /// Same key present in all three; committed and new both changed its
    /// value, to different values.
    pub const MODIFY_MODIFY: ConflictReason = 1;
    /// Committed changed the key's value; new deleted it.
    pub const MODIFY_DELETE: ConflictReason = 2;
    /// Committed deleted the key; new changed its value.
    pub const DELETE_MODIFY: ConflictReason = 3;
    /// Mid-walk: committed and new both landed on the same next key (both
    /// inserted it, or both skipped old's deleted key to the same place).
    pub const DUELING_INSERT: ConflictReason = 4;
    /// Mid-walk: committed and new both advanced past old's key to two
    /// different later keys (both deleted old's key, disagreeing on what
    /// comes next).
    pub const DUELING_DELETE: ConflictReason = 5;
    /// Tail (old exhausted): committed and new both insert the same key.
    pub const DUELING_INSERT_TAIL: ConflictReason = 6;
    /// Tail (new exhausted): old and committed disagree — committed neither
    /// matches old's key nor inserts ahead of it.
    pub const DUELING_DELETE_NEW_EXHAUSTED: ConflictReason = 7;
    /// Tail (committed exhausted): symmetric to the above for new.
    pub const DUELING_DELETE_COMMITTED_EXHAUSTED: ConflictReason = 8;
    /// Both committed and new are exhausted but old still has a key left
    /// over: both sides deleted it (or disagree on its fate), unresolved.
    pub const LONE_OLD_REMAINING: ConflictReason = 9;
}

use reason::*;

/// One side's sorted (key, value) cursor during the merge walk. `values`
/// is empty for a Set bucket; `value()` then reports `None` for every
/// position, which is what makes the value-equality checks below always
/// pass for a value-less merge.
struct Cursor<'a, K, V> {
    keys: &'a [K],
    values: &'a [V],
    idx: usize,
}

impl<'a, K: KeyOps, V: ValueOps> Cursor<'a, K, V> {
    fn new(keys: &'a [K], values: &'a [V]) -> Self {
        Cursor { keys, values, idx: 0 }
    }

    fn has(&self) -> bool {
        self.idx < self.keys.len()
    }

    /// Mirrors the original's `i->position`: the current index, or -1 once
    /// exhausted. Reported verbatim in `Error::Conflict`.
    fn position(&self) -> i64 {
        if self.has() {
            self.idx as i64
        } else {
            -1
        }
    }

    fn key(&self) -> &K {
        &self.keys[self.idx]
    }

    fn value(&self) -> Option<&V> {
        self.values.get(self.idx)
    }

    fn advance(&mut self) {
        self.idx += 1;
    }
}

fn values_equal<V: ValueOps>(a: Option<&V>, b: Option<&V>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

/// The triple-cursor walk shared by [`bucket_merge`] and [`set_merge`].
/// `mapping` selects whether value equality is actually consulted (`true`)
/// or short-circuited to "always equal" (`false`, for a Set merge) and
/// whether output entries carry a value.
fn merge_core<K: KeyOps, V: ValueOps>(
    old_keys: &[K],
    old_values: &[V],
    committed_keys: &[K],
    committed_values: &[V],
    new_keys: &[K],
    new_values: &[V],
    mapping: bool,
) -> Result<Vec<(K, Option<V>)>, Error> {
    let mut i1 = Cursor::new(old_keys, old_values);
    let mut i2 = Cursor::new(committed_keys, committed_values);
    let mut i3 = Cursor::new(new_keys, new_values);
    let mut out: Vec<(K, Option<V>)> = Vec::new();

    let same_value = |a: Option<&V>, b: Option<&V>| !mapping || values_equal(a, b);

    while i1.has() && i2.has() && i3.has() {
        let cmp12 = i1.key().cmp(i2.key());
        let cmp13 = i1.key().cmp(i3.key());
        if cmp12 == Ordering::Equal {
            if cmp13 == Ordering::Equal {
                if same_value(i1.value(), i2.value()) {
                    out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
                } else if same_value(i1.value(), i3.value()) {
                    out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
                } else {
                    return Err(Error::conflict(i1.position(), i2.position(), i3.position(), MODIFY_MODIFY));
                }
                i1.advance();
                i2.advance();
                i3.advance();
            } else if cmp13 == Ordering::Greater {
                out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
                i3.advance();
            } else if same_value(i1.value(), i2.value()) {
                i1.advance();
                i2.advance();
            } else {
                return Err(Error::conflict(i1.position(), i2.position(), i3.position(), MODIFY_DELETE));
            }
        } else if cmp13 == Ordering::Equal {
            if cmp12 == Ordering::Greater {
                out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
                i2.advance();
            } else if same_value(i1.value(), i3.value()) {
                i1.advance();
                i3.advance();
            } else {
                return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DELETE_MODIFY));
            }
        } else {
            let cmp23 = i2.key().cmp(i3.key());
            if cmp23 == Ordering::Equal {
                return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DUELING_INSERT));
            }
            if cmp12 == Ordering::Greater {
                if cmp23 == Ordering::Greater {
                    out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
                    i3.advance();
                } else {
                    out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
                    i2.advance();
                }
            } else if cmp13 == Ordering::Greater {
                out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
                i3.advance();
            } else {
                return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DUELING_DELETE));
            }
        }
    }

    while i2.has() && i3.has() {
        let cmp23 = i2.key().cmp(i3.key());
        if cmp23 == Ordering::Equal {
            return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DUELING_INSERT_TAIL));
        }
        if cmp23 == Ordering::Greater {
            out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
            i3.advance();
        } else {
            out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
            i2.advance();
        }
    }

    while i1.has() && i2.has() {
        let cmp12 = i1.key().cmp(i2.key());
        if cmp12 == Ordering::Greater {
            out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
            i2.advance();
        } else if cmp12 == Ordering::Equal && same_value(i1.value(), i2.value()) {
            i1.advance();
            i2.advance();
        } else {
            return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DUELING_DELETE_NEW_EXHAUSTED));
        }
    }

    while i1.has() && i3.has() {
        let cmp13 = i1.key().cmp(i3.key());
        if cmp13 == Ordering::Greater {
            out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
            i3.advance();
        } else if cmp13 == Ordering::Equal && same_value(i1.value(), i3.value()) {
            i1.advance();
            i3.advance();
        } else {
            return Err(Error::conflict(i1.position(), i2.position(), i3.position(), DUELING_DELETE_COMMITTED_EXHAUSTED));
        }
    }

    if i1.has() {
        return Err(Error::conflict(i1.position(), i2.position(), i3.position(), LONE_OLD_REMAINING));
    }

    while i2.has() {
        out.push((i2.key().clone(), if mapping { i2.value().cloned() } else { None }));
        i2.advance();
    }
    while i3.has() {
        out.push((i3.key().clone(), if mapping { i3.value().cloned() } else { None }));
        i3.advance();
    }

    Ok(out)
}

fn require_mapping<K: KeyOps, V: ValueOps>(
    old: &Bucket<K, V>,
    committed: &Bucket<K, V>,
    new: &Bucket<K, V>,
) -> Result<(), Error> {
    if old.is_set() || committed.is_set() || new.is_set() {
        Err(Error::TypeError("bucket_merge requires mapping buckets, not sets".into()))
    } else {
        Ok(())
    }
}

fn require_set<K: KeyOps, V: ValueOps>(
    old: &Bucket<K, V>,
    committed: &Bucket<K, V>,
    new: &Bucket<K, V>,
) -> Result<(), Error> {
    if !old.is_set() || !committed.is_set() || !new.is_set() {
        Err(Error::TypeError("set_merge requires set buckets, not mappings".into()))
    } else {
        Ok(())
    }
}

/// Three-way merge of mapping buckets. Returns the merged `(key, value)`
/// pairs in ascending order, or the first unresolved conflict found.
pub fn bucket_merge<K: KeyOps, V: ValueOps>(
    old: &mut Bucket<K, V>,
    committed: &mut Bucket<K, V>,
    new: &mut Bucket<K, V>,
) -> Result<Vec<(K, V)>, Error> {
    require_mapping(old, committed, new)?;
    old.ensure_active()?;
    committed.ensure_active()?;
    new.ensure_active()?;

    let out = merge_core(
        &old.keys_snapshot(),
        &old.values_snapshot(),
        &committed.keys_snapshot(),
        &committed.values_snapshot(),
        &new.keys_snapshot(),
        &new.values_snapshot(),
        true,
    )?;
    Ok(out.into_iter().map(|(k, v)| (k, v.expect("mapping merge always carries a value"))).collect())
}

/// Three-way merge of value-less Set/TreeSet buckets (see module doc for
/// why reasons 1-3 can never fire here, while 4-9 still can).
pub fn set_merge<K: KeyOps, V: ValueOps>(
    old: &Bucket<K, V>,
    committed: &Bucket<K, V>,
    new: &Bucket<K, V>,
) -> Result<Vec<K>, Error> {
    require_set(old, committed, new)?;
    let out = merge_core(
        &old.keys_snapshot(),
        &[],
        &committed.keys_snapshot(),
        &[],
        &new.keys_snapshot(),
        &[],
        false,
    )?;
    Ok(out.into_iter().map(|(k, _)| k).collect())
}

/// Build a fresh mapping bucket from merged entries, for a caller that
/// wants a ready-to-install `Bucket` rather than a raw `Vec` (spec.md
/// §4.5 "resolveConflict"). Checks the three `next` links agree before
/// merging — `bucket_merge` itself inherits `old`'s `next` unconditionally,
/// the same way the original does, so a disagreement has to be caught
/// here instead.
pub fn resolve_conflict<K: KeyOps, V: ValueOps>(
    old: &mut Bucket<K, V>,
    committed: &mut Bucket<K, V>,
    new: &mut Bucket<K, V>,
) -> Result<Bucket<K, V>, Error> {
    old.ensure_active()?;
    committed.ensure_active()?;
    new.ensure_active()?;
    let next_oids = (
        old.next().map(|b| b.borrow().oid()),
        committed.next().map(|b| b.borrow().oid()),
        new.next().map(|b| b.borrow().oid()),
    );
    if !(next_oids.0 == next_oids.1 && next_oids.1 == next_oids.2) {
        return Err(Error::RuntimeError("bucket next pointers disagree; cannot resolve".into()));
    }

    let merged = bucket_merge(old, committed, new)?;
    let mut out = Bucket::new_mapping();
    for (k, v) in merged {
        out.set(k, Some(v), false)?;
    }
    out.set_next(old.next());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(i64, i64)]) -> Bucket<i64, i64> {
        let mut b = Bucket::new_mapping();
        for &(k, v) in pairs {
            b.set(k, Some(v), false).unwrap();
        }
        b
    }

    fn expect_reason(
        mut old: Bucket<i64, i64>,
        mut committed: Bucket<i64, i64>,
        mut new: Bucket<i64, i64>,
        reason: crate::error::ConflictReason,
    ) {
        let err = bucket_merge(&mut old, &mut committed, &mut new).unwrap_err();
        match err {
            Error::Conflict { reason: got, .. } => assert_eq!(got, reason),
            _ => panic!("expected a conflict"),
        }
    }

    #[test]
    fn only_one_side_changed_wins_cleanly() {
        let mut old = mapping(&[(1, 10), (2, 20)]);
        let mut committed = mapping(&[(1, 10), (2, 20)]);
        let mut new = mapping(&[(1, 10), (2, 99), (3, 30)]);
        let merged = bucket_merge(&mut old, &mut committed, &mut new).unwrap();
        assert_eq!(merged, vec![(1, 10), (2, 99), (3, 30)]);
    }

    #[test]
    fn identical_edit_on_both_sides_is_not_a_conflict() {
        let mut old = mapping(&[(1, 10)]);
        let mut committed = mapping(&[(1, 99)]);
        let mut new = mapping(&[(1, 99)]);
        let merged = bucket_merge(&mut old, &mut committed, &mut new).unwrap();
        assert_eq!(merged, vec![(1, 99)]);
    }

    #[test]
    fn modify_modify_conflict_reports_reason_1() {
        expect_reason(mapping(&[(1, 10)]), mapping(&[(1, 11)]), mapping(&[(1, 12)]), MODIFY_MODIFY);
    }

    #[test]
    fn modify_delete_conflict_reports_reason_2() {
        // committed changes key 2's value but keeps key 5; new deletes key
        // 2 outright, landing its cursor on key 5 while 2 and 1 are still
        // mid-walk — the main loop's cmp13 < 0 branch.
        expect_reason(
            mapping(&[(2, 10), (5, 50)]),
            mapping(&[(2, 99), (5, 50)]),
            mapping(&[(5, 50)]),
            MODIFY_DELETE,
        );
    }

    #[test]
    fn delete_modify_conflict_reports_reason_3() {
        expect_reason(
            mapping(&[(2, 10), (5, 50)]),
            mapping(&[(5, 50)]),
            mapping(&[(2, 12), (5, 50)]),
            DELETE_MODIFY,
        );
    }

    #[test]
    fn dueling_insert_mid_walk_reports_reason_4() {
        // old still has an earlier key (1) keeping all three cursors live
        // when committed and new both insert the same new key (2).
        expect_reason(mapping(&[(1, 10)]), mapping(&[(2, 20)]), mapping(&[(2, 21)]), DUELING_INSERT);
    }

    #[test]
    fn dueling_delete_mid_walk_reports_reason_5() {
        expect_reason(mapping(&[(1, 10)]), mapping(&[(5, 50)]), mapping(&[(7, 70)]), DUELING_DELETE);
    }

    #[test]
    fn dueling_insert_at_tail_reports_reason_6() {
        // old is empty outright, so the conflict surfaces in the
        // "new inserts" tail loop rather than the main walk.
        expect_reason(Bucket::new_mapping(), mapping(&[(1, 11)]), mapping(&[(1, 12)]), DUELING_INSERT_TAIL);
    }

    #[test]
    fn dueling_delete_new_exhausted_reports_reason_7() {
        expect_reason(
            mapping(&[(1, 10), (2, 20)]),
            mapping(&[(1, 10), (2, 99)]),
            mapping(&[(1, 10)]),
            DUELING_DELETE_NEW_EXHAUSTED,
        );
    }

    #[test]
    fn dueling_delete_committed_exhausted_reports_reason_8() {
        expect_reason(
            mapping(&[(1, 10), (2, 20)]),
            mapping(&[(1, 10)]),
            mapping(&[(1, 10), (2, 21)]),
            DUELING_DELETE_COMMITTED_EXHAUSTED,
        );
    }

    #[test]
    fn lone_old_key_at_tail_reports_reason_9() {
        // Both sides delete key 2 (identically); the original still flags
        // this at the final `i1.position >= 0` check with no
        // value-equality escape hatch.
        expect_reason(mapping(&[(1, 10), (2, 20)]), mapping(&[(1, 10)]), mapping(&[(1, 10)]), LONE_OLD_REMAINING);
    }

    fn set_of(keys: &[i64]) -> Bucket<i64, i64> {
        let mut b = Bucket::new_set();
        for &k in keys {
            b.insert_key(k).unwrap();
        }
        b
    }

    #[test]
    fn set_merge_never_conflicts_on_disjoint_inserts() {
        let old = set_of(&[1]);
        let committed = set_of(&[1, 2]);
        let new = set_of(&[1, 3]);
        let merged = set_merge(&old, &committed, &new).unwrap();
        assert_eq!(merged, vec![1, 2, 3]);
    }

    #[test]
    fn set_merge_drops_key_deleted_by_either_side() {
        let old = set_of(&[1, 2]);
        let mut committed_mut = set_of(&[1, 2]);
        committed_mut.remove_key(&2).unwrap();
        let new = set_of(&[1, 2]);
        let merged = set_merge(&old, &committed_mut, &new).unwrap();
        assert_eq!(merged, vec![1]);
    }

    #[test]
    fn set_merge_still_reports_structural_conflicts() {
        // Membership can't disagree on a *value*, but it can still disagree
        // structurally: both sides insert the same never-before-seen key
        // while an earlier key keeps all three cursors alive (reason 4).
        let old = set_of(&[1]);
        let committed = set_of(&[1, 2]);
        let new = set_of(&[1, 2]);
        // Both sides inserting the identical key is not a conflict...
        assert_eq!(set_merge(&old, &committed, &new).unwrap(), vec![1, 2]);
        // ...but a genuine structural disagreement still is:
        let old2 = set_of(&[1]);
        let committed2 = set_of(&[5]);
        let new2 = set_of(&[7]);
        let err = set_merge(&old2, &committed2, &new2).unwrap_err();
        assert!(matches!(err, Error::Conflict { reason: DUELING_DELETE, .. }));
    }

    #[test]
    fn resolve_conflict_accepts_matching_next_and_rejects_mismatch() {
        use crate::cache::{CacheConfig, PickleCache};
        use crate::jar::MemoryJar;
        use std::cell::RefCell;
        use std::rc::Rc;

        let jar: Rc<dyn crate::jar::Jar> = Rc::new(MemoryJar::new());
        let cache = Rc::new(RefCell::new(PickleCache::new(CacheConfig::default())));
        let sibling_a = Rc::new(RefCell::new(mapping(&[(9, 90)])));
        Bucket::place_in_jar(&sibling_a, &jar, &cache).unwrap();
        let sibling_b = Rc::new(RefCell::new(mapping(&[(99, 900)])));
        Bucket::place_in_jar(&sibling_b, &jar, &cache).unwrap();

        let mut old = mapping(&[(1, 10)]);
        let mut committed = mapping(&[(1, 10)]);
        let mut new = mapping(&[(1, 10)]);
        old.set_next(Some(Rc::clone(&sibling_a)));
        committed.set_next(Some(Rc::clone(&sibling_a)));
        new.set_next(Some(Rc::clone(&sibling_a)));
        assert!(resolve_conflict(&mut old, &mut committed, &mut new).is_ok());

        new.set_next(Some(Rc::clone(&sibling_b)));
        let err = resolve_conflict(&mut old, &mut committed, &mut new).unwrap_err();
        assert!(matches!(err, Error::RuntimeError(_)));
    }
}
