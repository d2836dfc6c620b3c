//! `BTreeItems` — the range-iteration cursor over a tree (spec.md §4.4).
//!
//! The original threads a `(firstbucket, first_index, lastbucket,
//! last_index)` quadruple through `BTreeItemsTemplate.c` so that seeking
//! and slicing never have to re-walk from the tree root. This crate keeps
//! the idea of a single live `(bucket, index)` cursor but re-derives a
//! target position by descending from the root on `seek` rather than
//! caching the upper bound, trading the original's O(1) reseek for an
//! O(log n) one — a "pseudoindex" in the same sense the original's docs
//! use the term: a position that is recomputed, not a stable integer
//! offset into a flat array.
//!
//! The pseudoindex itself — a signed logical offset from the start (`0`)
//! or end (`-1`) of the range — and the `PreviousBucket` backward hop it
//! needs are both implemented here: only the *mechanism* that keeps a
//! cursor current was redesigned, not the signed-index contract spec.md
//! §4.4 describes for `seek`/`Item`.

use crate::bucket::Bucket;
use crate::btree::{BTree, Child};
use crate::error::Error;
use crate::key::{KeyOps, ValueOps};
use std::cell::RefCell;
use std::rc::Rc;

/// Which projection of a (key, value) pair an items cursor yields
/// (spec.md §4.4 "kind: 'k' / 'v' / 'i'").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Key,
    Value,
    Item,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry<K, V> {
    Key(K),
    Value(V),
    Item(K, V),
}

type Cursor<K, V> = (Rc<RefCell<Bucket<K, V>>>, usize);

pub struct BTreeItems<K: KeyOps, V: ValueOps> {
    kind: ItemKind,
    root: Rc<RefCell<BTree<K, V>>>,
    min: Option<K>,
    exclude_min: bool,
    max: Option<K>,
    exclude_max: bool,
    current: Option<Cursor<K, V>>,
    /// Signed logical offset of `current` from the start of the range
    /// (`>= 0`) or from the end of the range (`< 0`, with `-1` the last
    /// element). Re-anchored by [`BTreeItems::seek`] whenever its target
    /// index crosses from one sign to the other.
    pseudoindex: i64,
}

impl<K: KeyOps, V: ValueOps> BTreeItems<K, V> {
    /// A half-open (by default) range `[min, max]` over `root`, honoring
    /// `exclude_min`/`exclude_max` the same way
    /// [`crate::bucket::Bucket::range_search`] does at the single-bucket
    /// level (spec.md §4.2 "Range search").
    pub fn range(
        root: &Rc<RefCell<BTree<K, V>>>,
        min: Option<&K>,
        max: Option<&K>,
        exclude_min: bool,
        exclude_max: bool,
        kind: ItemKind,
    ) -> Result<Self, Error> {
        let current = Self::locate_low(root, min, exclude_min)?;
        Ok(BTreeItems {
            kind,
            root: Rc::clone(root),
            min: min.cloned(),
            exclude_min,
            max: max.cloned(),
            exclude_max,
            current,
            pseudoindex: 0,
        })
    }

    pub fn keys(root: &Rc<RefCell<BTree<K, V>>>) -> Result<Self, Error> {
        Self::range(root, None, None, false, false, ItemKind::Key)
    }

    pub fn values(root: &Rc<RefCell<BTree<K, V>>>) -> Result<Self, Error> {
        Self::range(root, None, None, false, false, ItemKind::Value)
    }

    pub fn items(root: &Rc<RefCell<BTree<K, V>>>) -> Result<Self, Error> {
        Self::range(root, None, None, false, false, ItemKind::Item)
    }

    /// Smallest-key-first descent: the leaf/offset at logical index `0`
    /// of a `[min, ..]` range.
    fn locate_low(
        root: &Rc<RefCell<BTree<K, V>>>,
        min: Option<&K>,
        exclude_min: bool,
    ) -> Result<Option<Cursor<K, V>>, Error> {
        let key = match min {
            None => return Ok(BTree::first_bucket(root)?.map(|b| (b, 0))),
            Some(k) => k,
        };
        let mut current = Rc::clone(root);
        loop {
            current.borrow_mut().ensure_active()?;
            if current.borrow().is_empty() {
                return Ok(None);
            }
            let idx = current.borrow().locate_child_index(key);
            let child = current.borrow().child_ref(idx);
            match child {
                Child::Leaf(bucket) => {
                    bucket.borrow_mut().ensure_active()?;
                    let (pos, present) = bucket.borrow().search(key);
                    let mut start = pos + if present && exclude_min { 1 } else { 0 };
                    // The chosen bucket may have nothing left at or past
                    // `start` (e.g. `min` is its last key and `exclude_min`
                    // is set) — walk forward through `next` until a
                    // bucket actually has an element at the target offset,
                    // so the returned cursor is always in-bounds.
                    let mut cur = bucket;
                    loop {
                        let len = cur.borrow().len();
                        if start < len {
                            return Ok(Some((cur, start)));
                        }
                        let next = cur.borrow().next();
                        match next {
                            None => return Ok(None),
                            Some(n) => {
                                n.borrow_mut().ensure_active()?;
                                cur = n;
                                start = 0;
                            }
                        }
                    }
                }
                Child::Node(sub) => current = sub,
            }
        }
    }

    /// Largest-key-last descent: the leaf/offset at logical index `-1`
    /// of a `[.., max]` range. Symmetric to [`BTreeItems::locate_low`] —
    /// same root-to-leaf descent, biased to the high end of each bucket
    /// instead of the low end (spec.md §4.4 "Range-end find").
    fn locate_high(
        root: &Rc<RefCell<BTree<K, V>>>,
        max: Option<&K>,
        exclude_max: bool,
    ) -> Result<Option<Cursor<K, V>>, Error> {
        let key = match max {
            None => {
                let bucket = BTree::last_bucket(root)?;
                return Ok(match bucket {
                    None => None,
                    Some(b) => {
                        b.borrow_mut().ensure_active()?;
                        let len = b.borrow().len();
                        if len == 0 { None } else { Some((b, len - 1)) }
                    }
                });
            }
            Some(k) => k,
        };
        let mut current = Rc::clone(root);
        loop {
            current.borrow_mut().ensure_active()?;
            if current.borrow().is_empty() {
                return Ok(None);
            }
            let idx = current.borrow().locate_child_index(key);
            let child = current.borrow().child_ref(idx);
            match child {
                Child::Leaf(bucket) => {
                    bucket.borrow_mut().ensure_active()?;
                    let (low, high) = bucket.borrow_mut().range_search(None, Some(key), false, exclude_max)?;
                    if high < low {
                        return Ok(None);
                    }
                    return Ok(Some((bucket, high as usize)));
                }
                Child::Node(sub) => current = sub,
            }
        }
    }

    /// `PreviousBucket` (spec.md §4.4): linear scan from `firstbucket`
    /// for the bucket whose `next` link is `target`. O(n) in bucket
    /// count, the same cost the original pays for the same walk.
    fn previous_bucket(&self, target: &Rc<RefCell<Bucket<K, V>>>) -> Result<Option<Rc<RefCell<Bucket<K, V>>>>, Error> {
        let mut cur = BTree::first_bucket(&self.root)?;
        loop {
            match cur {
                None => return Ok(None),
                Some(b) => {
                    let n = b.borrow().next();
                    if let Some(n) = &n {
                        if Rc::ptr_eq(n, target) {
                            return Ok(Some(b));
                        }
                    }
                    cur = n;
                }
            }
        }
    }

    fn physical_next(&self, bucket: &Rc<RefCell<Bucket<K, V>>>, idx: usize) -> Result<Option<Cursor<K, V>>, Error> {
        let len = bucket.borrow().len();
        if idx + 1 < len {
            return Ok(Some((Rc::clone(bucket), idx + 1)));
        }
        let mut next = bucket.borrow().next();
        loop {
            match next {
                None => return Ok(None),
                Some(b) => {
                    b.borrow_mut().ensure_active()?;
                    if b.borrow().len() > 0 {
                        return Ok(Some((b, 0)));
                    }
                    let n = b.borrow().next();
                    next = n;
                }
            }
        }
    }

    fn physical_prev(&self, bucket: &Rc<RefCell<Bucket<K, V>>>, idx: usize) -> Result<Option<Cursor<K, V>>, Error> {
        if idx > 0 {
            return Ok(Some((Rc::clone(bucket), idx - 1)));
        }
        let mut cur = Rc::clone(bucket);
        loop {
            match self.previous_bucket(&cur)? {
                None => return Ok(None),
                Some(p) => {
                    p.borrow_mut().ensure_active()?;
                    let plen = p.borrow().len();
                    if plen > 0 {
                        return Ok(Some((p, plen - 1)));
                    }
                    cur = p;
                }
            }
        }
    }

    fn within_upper_bound(&self, bucket: &Rc<RefCell<Bucket<K, V>>>, idx: usize) -> bool {
        match &self.max {
            None => true,
            Some(max) => {
                let key = bucket.borrow().keys_snapshot()[idx].clone();
                !(&key > max || (&key == max && self.exclude_max))
            }
        }
    }

    fn within_lower_bound(&self, bucket: &Rc<RefCell<Bucket<K, V>>>, idx: usize) -> bool {
        match &self.min {
            None => true,
            Some(min) => {
                let key = bucket.borrow().keys_snapshot()[idx].clone();
                !(&key < min || (&key == min && self.exclude_min))
            }
        }
    }

    /// Reposition the cursor at signed logical index `i` (spec.md §4.4
    /// "Seek"). Negative indices count from the end of the range (`-1`
    /// is the last element). Re-anchors to the low or high boundary of
    /// the range whenever `i` and the current pseudoindex disagree in
    /// sign, then walks the remaining `delta` positions one hop at a
    /// time via `next`/`PreviousBucket`.
    pub fn seek(&mut self, i: i64) -> Result<(), Error> {
        if (i >= 0) != (self.pseudoindex >= 0) {
            if i >= 0 {
                self.current = Self::locate_low(&self.root, self.min.as_ref(), self.exclude_min)?;
                self.pseudoindex = 0;
            } else {
                self.current = Self::locate_high(&self.root, self.max.as_ref(), self.exclude_max)?;
                self.pseudoindex = -1;
            }
        }
        let mut delta = i - self.pseudoindex;
        while delta > 0 {
            let (bucket, idx) = self.current.clone().ok_or(Error::IndexError)?;
            match self.physical_next(&bucket, idx)? {
                Some((b, ni)) if self.within_upper_bound(&b, ni) => {
                    self.current = Some((b, ni));
                    self.pseudoindex += 1;
                    delta -= 1;
                }
                _ => return Err(Error::IndexError),
            }
        }
        while delta < 0 {
            let (bucket, idx) = self.current.clone().ok_or(Error::IndexError)?;
            match self.physical_prev(&bucket, idx)? {
                Some((b, pi)) if self.within_lower_bound(&b, pi) => {
                    self.current = Some((b, pi));
                    self.pseudoindex -= 1;
                    delta += 1;
                }
                _ => return Err(Error::IndexError),
            }
        }
        Ok(())
    }

    fn entry_at_current(&mut self) -> Result<Entry<K, V>, Error> {
        let (bucket, idx) = self.current.clone().ok_or(Error::IndexError)?;
        bucket.borrow_mut().ensure_active()?;
        let key = bucket.borrow().keys_snapshot()[idx].clone();
        match self.kind {
            ItemKind::Key => Ok(Entry::Key(key)),
            ItemKind::Value => {
                if bucket.borrow().is_set() {
                    Err(Error::TypeError("value iteration over a set".into()))
                } else {
                    bucket.borrow_mut().get(&key).map(|v| Entry::Value(v.clone()))
                }
            }
            ItemKind::Item => {
                if bucket.borrow().is_set() {
                    Err(Error::TypeError("item iteration over a set".into()))
                } else {
                    bucket
                        .borrow_mut()
                        .get(&key)
                        .map(|v| Entry::Item(key.clone(), v.clone()))
                }
            }
        }
    }

    /// `Item(i)` (spec.md §4.4): seek to signed index `i` and dereference.
    pub fn item(&mut self, i: i64) -> Result<Entry<K, V>, Error> {
        self.seek(i)?;
        self.entry_at_current()
    }

    /// Drop the first `lo` items and stop after `hi - lo` more (spec.md
    /// §4.4 "slice"). Implemented by plain iteration since no cached
    /// upper-bound position is kept; see the module doc for why that
    /// trade is acceptable here.
    pub fn slice(mut self, lo: usize, hi: usize) -> Result<Vec<Entry<K, V>>, Error> {
        if hi < lo {
            return Err(Error::IndexError);
        }
        for _ in 0..lo {
            match self.next() {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(Error::IndexError),
            }
        }
        let mut out = Vec::with_capacity(hi - lo);
        for _ in lo..hi {
            match self.next() {
                Some(Ok(entry)) => out.push(entry),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Length / non-emptiness (spec.md §4.4): walks the bucket chain
    /// summing `len` until the last bucket. `is_empty` above is the
    /// short-circuiting non-emptiness check; this is the full O(n) count
    /// for `len(m)`.
    pub fn count(root: &Rc<RefCell<BTree<K, V>>>) -> Result<usize, Error> {
        let mut total = 0usize;
        let mut bucket = BTree::first_bucket(root)?;
        while let Some(b) = bucket {
            b.borrow_mut().ensure_active()?;
            total += b.borrow().len();
            let next = b.borrow().next();
            bucket = next;
        }
        Ok(total)
    }
}

impl<K: KeyOps, V: ValueOps> Iterator for BTreeItems<K, V> {
    type Item = Result<Entry<K, V>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (bucket, idx) = self.current.clone()?;
            if let Err(e) = bucket.borrow_mut().ensure_active() {
                self.current = None;
                return Some(Err(e));
            }
            let len = bucket.borrow().len();
            if idx >= len {
                let next_bucket = bucket.borrow().next();
                match next_bucket {
                    Some(nb) => {
                        self.current = Some((nb, 0));
                        continue;
                    }
                    None => {
                        self.current = None;
                        return None;
                    }
                }
            }
            if !self.within_upper_bound(&bucket, idx) {
                self.current = None;
                return None;
            }
            let result = self.entry_at_current();
            self.current = Some((Rc::clone(&bucket), idx + 1));
            self.pseudoindex += 1;
            return Some(result);
        }
    }
}
