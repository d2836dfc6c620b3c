//! Bucket / Set — the B-tree leaf (spec.md §3 "Bucket", §4.2).
//!
//! Grounded in the teacher's own `Bucket` (`bucket.rs`) for the owning
//! `Rc<RefCell<_>>` graph with a stored weak self-pointer, and in the
//! teacher's `node.rs`/`freelist.rs` for the sorted-array-with-binary-search
//! shape; generalized from bolt's byte-slice keys/values to the generic
//! `KeyOps`/`ValueOps` pair per REDESIGN FLAGS.
//!
//! A `Bucket<K, V>` is the mapping variant; `Set<K>` (`bucket::Set<K>`) is
//! the value-less variant, built with `Bucket::new_set` — the original's
//! separate `BucketTemplate.c` / `SetTemplate.c` C types collapse into one
//! Rust struct with an `is_set` discriminant fixed at construction, since
//! both arms need identical split/search/range-search machinery and only
//! differ in whether a `values` array is threaded through.

use crate::cache::PickleCache;
use crate::error::Error;
use crate::jar::Jar;
use crate::key::{KeyOps, NoValue, ValueOps};
use crate::oid::Oid;
use crate::persistent::{PersistentHeader, PersistentNode, State};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Initial backing-array floor for a bucket that has just grown from
/// empty (spec.md §3 invariant). `Vec` manages capacity doubling on its
/// own past this point; we only reserve the floor explicitly so an
/// empty-then-grown bucket matches the invariant instead of allocating a
/// 1-element `Vec`.
pub const MIN_BUCKET_ALLOC: usize = 16;

/// Value-less variant of [`Bucket`] (spec.md "A Set is the value-less
/// variant of a Bucket").
pub type Set<K> = Bucket<K, NoValue>;

/// Result of a `set`/`insert_key` mutation (spec.md §4.2 "Set": replaces
/// the original's combined `{-1, 0, 1}` return/error convention with a
/// typed outcome plus `Result` for the error channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// `unique` was set and the key was already present: no-op.
    Unchanged,
    /// Existing key's value was overwritten; bucket length unchanged.
    Replaced,
    /// A new (key, value) pair was inserted; bucket grew by one.
    Grew,
    /// A (key, value) pair was removed; bucket shrank by one.
    Shrunk,
}

#[derive(Serialize, Deserialize)]
pub struct BucketState<K, V> {
    pub is_set: bool,
    /// Interleaved (key, value) pairs; value is `None` for every entry of
    /// a set bucket (spec.md §6 "Persisted state layout").
    pub entries: Vec<(K, Option<V>)>,
    pub next: Option<Oid>,
}

pub struct Bucket<K: KeyOps, V: ValueOps> {
    header: PersistentHeader,
    is_set: bool,
    keys: Vec<K>,
    values: Vec<V>,
    next: Option<Rc<RefCell<Bucket<K, V>>>>,
    cache: Option<Weak<RefCell<PickleCache<RefCell<Bucket<K, V>>>>>>,
}

impl<K: KeyOps, V: ValueOps> Bucket<K, V> {
    pub fn new_mapping() -> Self {
        Bucket {
            header: PersistentHeader::transient(),
            is_set: false,
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
            cache: None,
        }
    }

    pub fn new_set() -> Self {
        Bucket {
            header: PersistentHeader::transient(),
            is_set: true,
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
            cache: None,
        }
    }

    pub(crate) fn new_ghost(oid: Oid, jar: Weak<dyn Jar>, is_set: bool) -> Self {
        Bucket {
            header: PersistentHeader::ghost(oid, jar),
            is_set,
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
            cache: None,
        }
    }

    /// Same shape (is_set, jar, cache) as `template`, empty payload —
    /// used by [`Bucket::split`] to build the right sibling.
    fn sibling_of(template: &Bucket<K, V>) -> Self {
        let mut b = if template.is_set {
            Bucket::new_set()
        } else {
            Bucket::new_mapping()
        };
        if let Some(jar) = template.header.jar() {
            b.header.attach_jar(Rc::downgrade(&jar));
        }
        b.cache = template.cache.clone();
        b
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn oid(&self) -> Option<Oid> {
        self.header.oid()
    }

    pub fn state(&self) -> State {
        self.header.state()
    }

    pub fn next(&self) -> Option<Rc<RefCell<Bucket<K, V>>>> {
        self.next.clone()
    }

    pub fn keys_snapshot(&self) -> Vec<K> {
        self.keys.clone()
    }

    /// Empty for a set bucket (`values` is never populated when `is_set`).
    pub fn values_snapshot(&self) -> Vec<V> {
        self.values.clone()
    }

    /// Overwrite the `next` link directly, bypassing `split`'s splice
    /// logic (spec.md §4.5 "resolveConflict" installs a merged bucket's
    /// `next` from the pre-merge state rather than growing it in place).
    pub(crate) fn set_next(&mut self, next: Option<Rc<RefCell<Bucket<K, V>>>>) {
        self.next = next;
    }

    /// Place a transient bucket in `jar`/`cache`, allocating its oid
    /// (spec.md §6 "jar.new_oid — allocate a fresh oid when placing a
    /// transient object into the jar").
    pub fn place_in_jar(
        this: &Rc<RefCell<Bucket<K, V>>>,
        jar: &Rc<dyn Jar>,
        cache: &Rc<RefCell<PickleCache<RefCell<Bucket<K, V>>>>>,
    ) -> Result<Oid, Error> {
        let oid = jar.new_oid();
        {
            let mut b = this.borrow_mut();
            b.header.set_oid(oid);
            b.header.attach_jar(Rc::downgrade(jar));
            b.cache = Some(Rc::downgrade(cache));
        }
        cache.borrow_mut().insert(oid, Rc::clone(this))?;
        Ok(oid)
    }

    /// Guarantee `state() >= UpToDate`, reloading from the jar if this
    /// bucket is currently a ghost (spec.md §4.1 "activate").
    pub fn ensure_active(&mut self) -> Result<(), Error> {
        if self.header.state() != State::Ghost {
            return Ok(());
        }
        let jar = self
            .header
            .jar()
            .ok_or_else(|| Error::RuntimeError("ghost bucket has no jar attached".into()))?;
        let oid = self
            .header
            .oid()
            .ok_or_else(|| Error::RuntimeError("ghost bucket has no oid".into()))?;
        let bytes = jar.load(oid).map_err(|e| Error::Jar(e.to_string()))?;
        let state: BucketState<K, V> =
            serde_json::from_slice(&bytes).map_err(|e| Error::RuntimeError(e.to_string()))?;
        self.install_state(state)?;
        self.header.mark_uptodate();
        if let Some(cache) = self.cache.as_ref().and_then(Weak::upgrade) {
            cache.borrow_mut().note_activated(oid);
        }
        tracing::trace!(oid = oid.0, "bucket activated from jar");
        Ok(())
    }

    fn install_state(&mut self, state: BucketState<K, V>) -> Result<(), Error> {
        self.is_set = state.is_set;
        self.keys = Vec::with_capacity(state.entries.len());
        self.values = Vec::with_capacity(state.entries.len());
        for (k, v) in state.entries {
            self.keys.push(k);
            if let Some(v) = v {
                self.values.push(v);
            }
        }
        self.next = match state.next {
            None => None,
            Some(oid) => Some(self.resolve_ref(oid)?),
        };
        Ok(())
    }

    /// Resolve a serialized `next` oid into a live (possibly still-ghost)
    /// bucket via the cache, constructing a fresh ghost entry if this is
    /// the first time it's been seen.
    fn resolve_ref(&self, oid: Oid) -> Result<Rc<RefCell<Bucket<K, V>>>, Error> {
        let cache_weak = self
            .cache
            .clone()
            .ok_or_else(|| Error::RuntimeError("bucket has no cache attached".into()))?;
        let cache = cache_weak
            .upgrade()
            .ok_or_else(|| Error::RuntimeError("bucket's cache has been dropped".into()))?;
        let mut cache_mut = cache.borrow_mut();
        if let Some(existing) = cache_mut.get(oid) {
            return Ok(existing);
        }
        let jar = self
            .header
            .jar()
            .ok_or_else(|| Error::RuntimeError("bucket has no jar attached".into()))?;
        let ghost = Rc::new(RefCell::new(Bucket::new_ghost(
            oid,
            Rc::downgrade(&jar),
            self.is_set,
        )));
        {
            let mut g = ghost.borrow_mut();
            g.cache = Some(Rc::downgrade(&cache));
        }
        cache_mut.insert(oid, Rc::clone(&ghost))?;
        Ok(ghost)
    }

    /// Serialize this bucket's resident state (spec.md §6 "Persisted
    /// state layout"). Calling this on a ghost yields an empty-entries
    /// state; callers are expected to `ensure_active` first.
    pub fn getstate(&self) -> BucketState<K, V> {
        let entries = if self.is_set {
            self.keys.iter().cloned().map(|k| (k, None)).collect()
        } else {
            self.keys
                .iter()
                .cloned()
                .zip(self.values.iter().cloned())
                .map(|(k, v)| (k, Some(v)))
                .collect()
        };
        let next = self.next.as_ref().and_then(|n| n.borrow().header.oid());
        BucketState {
            is_set: self.is_set,
            entries,
            next,
        }
    }

    pub fn setstate(&mut self, state: BucketState<K, V>) -> Result<(), Error> {
        self.install_state(state)
    }

    fn grow_if_needed(&mut self) {
        if self.keys.len() == self.keys.capacity() {
            let new_cap = (self.keys.capacity() * 2).max(MIN_BUCKET_ALLOC);
            self.keys.reserve(new_cap - self.keys.capacity());
            if !self.is_set {
                self.values.reserve(new_cap.saturating_sub(self.values.capacity()));
            }
        }
    }

    /// Binary search with strict-less on the midpoint (spec.md §4.2
    /// "Search"): `(index, present)`, `index` the insertion point on a
    /// miss.
    pub fn search(&self, key: &K) -> (usize, bool) {
        match self.keys.binary_search(key) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        }
    }

    pub fn contains_key(&mut self, key: &K) -> Result<bool, Error> {
        self.ensure_active()?;
        Ok(self.search(key).1)
    }

    pub fn get(&mut self, key: &K) -> Result<&V, Error> {
        if self.is_set {
            return Err(Error::TypeError("get() on a set bucket".into()));
        }
        self.ensure_active()?;
        let (idx, present) = self.search(key);
        if present {
            Ok(&self.values[idx])
        } else {
            Err(Error::KeyError)
        }
    }

    /// Mapping-bucket mutation (spec.md §4.2 "Set"). `value = None` is a
    /// delete; `unique` refuses to overwrite an existing mapping.
    pub fn set(&mut self, key: K, value: Option<V>, unique: bool) -> Result<SetOutcome, Error> {
        if self.is_set {
            return Err(Error::TypeError("set() on a set bucket".into()));
        }
        self.ensure_active()?;
        let (idx, present) = self.search(&key);
        match value {
            None => {
                if !present {
                    return Err(Error::KeyError);
                }
                self.header.change_notify()?;
                self.keys.remove(idx);
                self.values.remove(idx);
                Ok(SetOutcome::Shrunk)
            }
            Some(v) => {
                if present {
                    if unique {
                        return Ok(SetOutcome::Unchanged);
                    }
                    self.header.change_notify()?;
                    self.values[idx] = v;
                    Ok(SetOutcome::Replaced)
                } else {
                    self.header.change_notify()?;
                    self.grow_if_needed();
                    self.keys.insert(idx, key);
                    self.values.insert(idx, v);
                    Ok(SetOutcome::Grew)
                }
            }
        }
    }

    /// Set-bucket insert (spec.md §4.2 "Set-bucket specializations"):
    /// `true` if the key was absent and got added.
    pub fn insert_key(&mut self, key: K) -> Result<bool, Error> {
        if !self.is_set {
            return Err(Error::TypeError("insert_key() on a mapping bucket".into()));
        }
        self.ensure_active()?;
        let (idx, present) = self.search(&key);
        if present {
            return Ok(false);
        }
        self.header.change_notify()?;
        self.grow_if_needed();
        self.keys.insert(idx, key);
        Ok(true)
    }

    pub fn remove_key(&mut self, key: &K) -> Result<(), Error> {
        if !self.is_set {
            return Err(Error::TypeError("remove_key() on a mapping bucket".into()));
        }
        self.ensure_active()?;
        let (idx, present) = self.search(key);
        if !present {
            return Err(Error::KeyError);
        }
        self.header.change_notify()?;
        self.keys.remove(idx);
        Ok(())
    }

    /// Half-open range search (spec.md §4.2 "Range search"): an inclusive
    /// `(low, high)` offset pair into `keys`, or `(0, -1)` for an empty
    /// result.
    pub fn range_search(
        &mut self,
        min: Option<&K>,
        max: Option<&K>,
        exclude_min: bool,
        exclude_max: bool,
    ) -> Result<(i64, i64), Error> {
        self.ensure_active()?;
        if self.keys.is_empty() {
            return Ok((0, -1));
        }
        let low: i64 = match min {
            None => 0,
            Some(k) => {
                let (idx, present) = self.search(k);
                (idx + if present && exclude_min { 1 } else { 0 }) as i64
            }
        };
        let high: i64 = match max {
            None => self.keys.len() as i64 - 1,
            Some(k) => {
                let (idx, present) = self.search(k);
                if present {
                    idx as i64 - if exclude_max { 1 } else { 0 }
                } else {
                    idx as i64 - 1
                }
            }
        };
        if low > high {
            Ok((0, -1))
        } else {
            Ok((low, high))
        }
    }

    /// Split in two at `at` (or the midpoint if out of bounds); the new
    /// successor is spliced into the linked list between `self` and
    /// `self.next` (spec.md §4.2 "Split").
    pub fn split(
        this: &Rc<RefCell<Bucket<K, V>>>,
        at: Option<usize>,
    ) -> Result<Rc<RefCell<Bucket<K, V>>>, Error> {
        let mut me = this.borrow_mut();
        me.ensure_active()?;
        let len = me.keys.len();
        let idx = match at {
            Some(i) if i < len => i,
            _ => len / 2,
        };
        let new_keys = me.keys.split_off(idx);
        let new_values = if me.is_set {
            Vec::new()
        } else {
            me.values.split_off(idx)
        };
        let mut sibling = Bucket::sibling_of(&me);
        sibling.keys = new_keys;
        sibling.values = new_values;
        sibling.next = me.next.take();
        let sibling_rc = Rc::new(RefCell::new(sibling));
        me.next = Some(Rc::clone(&sibling_rc));
        me.header.change_notify()?;
        Ok(sibling_rc)
    }

    /// Unlink `self.next` from the list: `self.next <- self.next.next`
    /// (spec.md §4.2 "Delete-next-bucket"). No-op if `next` is null.
    pub fn delete_next_bucket(&mut self) -> Result<(), Error> {
        self.ensure_active()?;
        if let Some(next) = self.next.take() {
            let mut next_ref = next.borrow_mut();
            next_ref.ensure_active()?;
            let after = next_ref.next.clone();
            drop(next_ref);
            self.next = after;
            self.header.change_notify()?;
        }
        Ok(())
    }
}

impl<K: KeyOps, V: ValueOps> crate::persistent::Pinned for Bucket<K, V> {
    fn header_mut(&mut self) -> &mut PersistentHeader {
        &mut self.header
    }
}

impl<K: KeyOps, V: ValueOps> PersistentNode for RefCell<Bucket<K, V>> {
    fn oid(&self) -> Option<Oid> {
        self.borrow().header.oid()
    }

    fn state(&self) -> State {
        self.borrow().header.state()
    }

    fn estimated_size(&self) -> u32 {
        self.borrow().header.estimated_size()
    }

    fn deactivate(&self) -> bool {
        let mut b = self.borrow_mut();
        if b.header.try_deactivate() {
            b.keys.clear();
            b.keys.shrink_to_fit();
            b.values.clear();
            b.values.shrink_to_fit();
            b.next = None;
            true
        } else {
            false
        }
    }

    fn invalidate(&self) {
        let mut b = self.borrow_mut();
        b.header.force_ghost();
        b.keys.clear();
        b.values.clear();
        b.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: i64) -> Bucket<i64, i64> {
        let mut b = Bucket::new_mapping();
        for i in 0..n {
            b.set(i, Some(i * 10), false).unwrap();
        }
        b
    }

    #[test]
    fn search_finds_insertion_point_on_miss() {
        let b = filled(10);
        assert_eq!(b.search(&5), (5, true));
        assert_eq!(b.search(&100), (10, false));
        assert_eq!(b.search(&-1), (0, false));
    }

    #[test]
    fn set_replace_does_not_grow() {
        let mut b = filled(5);
        assert_eq!(b.set(2, Some(999), false).unwrap(), SetOutcome::Replaced);
        assert_eq!(b.len(), 5);
        assert_eq!(*b.get(&2).unwrap(), 999);
    }

    #[test]
    fn set_unique_refuses_overwrite() {
        let mut b = filled(5);
        assert_eq!(b.set(2, Some(999), true).unwrap(), SetOutcome::Unchanged);
        assert_eq!(*b.get(&2).unwrap(), 20);
    }

    #[test]
    fn delete_absent_key_is_keyerror() {
        let mut b = filled(3);
        assert!(matches!(b.set(99, None, false), Err(Error::KeyError)));
    }

    #[test]
    fn set_bucket_rejects_values() {
        let mut s: Set<i64> = Bucket::new_set();
        assert!(s.insert_key(1).unwrap());
        assert!(!s.insert_key(1).unwrap());
        assert!(matches!(s.get(&1), Err(Error::TypeError(_))));
    }

    #[test]
    fn split_preserves_order_and_links_successor() {
        let b = Rc::new(RefCell::new(filled(10)));
        let right = Bucket::split(&b, None).unwrap();
        assert_eq!(b.borrow().len(), 5);
        assert_eq!(right.borrow().len(), 5);
        assert_eq!(b.borrow().keys_snapshot(), vec![0, 1, 2, 3, 4]);
        assert_eq!(right.borrow().keys_snapshot(), vec![5, 6, 7, 8, 9]);
        assert!(Rc::ptr_eq(&b.borrow().next().unwrap(), &right));
    }

    #[test]
    fn range_search_empty_when_bounds_cross() {
        let mut b = filled(10);
        let (lo, hi) = b.range_search(Some(&8), Some(&2), false, false).unwrap();
        assert_eq!((lo, hi), (0, -1));
    }

    #[test]
    fn range_search_excludes_endpoints() {
        let mut b = filled(10);
        let (lo, hi) = b.range_search(Some(&2), Some(&7), true, true).unwrap();
        assert_eq!((lo, hi), (3, 6));
    }

    #[test]
    fn getstate_setstate_round_trip() {
        let b = filled(6);
        let state = b.getstate();
        let mut fresh: Bucket<i64, i64> = Bucket::new_mapping();
        fresh.setstate(state).unwrap();
        assert_eq!(fresh.keys_snapshot(), b.keys_snapshot());
        assert!(fresh.next().is_none() && b.next().is_none());
    }

    #[test]
    fn deactivate_clears_payload_and_refuses_when_changed() {
        let cell = RefCell::new(filled(4));
        cell.borrow_mut().header.change_notify().unwrap();
        assert!(!PersistentNode::deactivate(&cell));
        assert_eq!(cell.borrow().len(), 4);
    }
}
