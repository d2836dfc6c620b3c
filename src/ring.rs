//! The LRU ring (spec.md §4.6, §8 "Cache ring" invariant).
//!
//! The original embeds `prev`/`next` pointers directly in every
//! persistent object and walks them with a stack-allocated placeholder
//! node to stay safe across arbitrary removal mid-walk (spec.md §4.6
//! "Incremental GC"). This crate keeps the ring's linkage out of the
//! node entirely (spec.md §9's arena rewrite) as a `HashMap<Oid, Link>`
//! intrusive doubly-linked list addressed by oid; GC takes a snapshot
//! `Vec<Oid>` of the walk order before mutating, which is the safe
//! Rust-idiomatic equivalent of the placeholder trick — no raw pointers,
//! no possibility of a dangling `next`.

use crate::oid::Oid;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: Option<Oid>,
    next: Option<Oid>,
}

/// `lru` end = `ring_home.next` (next eviction candidate); `mru` end =
/// `ring_home.prev` (most recently used, spec.md: "moves its ring node to
/// the position immediately before ring_home").
#[derive(Debug, Default)]
pub struct Ring {
    links: HashMap<Oid, Link>,
    lru: Option<Oid>,
    mru: Option<Oid>,
}

impl Ring {
    pub fn new() -> Self {
        Ring {
            links: HashMap::new(),
            lru: None,
            mru: None,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.links.contains_key(&oid)
    }

    fn unlink(&mut self, oid: Oid) {
        if let Some(link) = self.links.remove(&oid) {
            match link.prev {
                Some(p) => self.links.get_mut(&p).unwrap().next = link.next,
                None => self.lru = link.next,
            }
            match link.next {
                Some(n) => self.links.get_mut(&n).unwrap().prev = link.prev,
                None => self.mru = link.prev,
            }
        }
    }

    /// Insert (or move) `oid` to the most-recently-used end.
    pub fn touch(&mut self, oid: Oid) {
        if self.links.contains_key(&oid) {
            self.unlink(oid);
        }
        let old_mru = self.mru;
        self.links.insert(
            oid,
            Link {
                prev: old_mru,
                next: None,
            },
        );
        if let Some(m) = old_mru {
            self.links.get_mut(&m).unwrap().next = Some(oid);
        } else {
            self.lru = Some(oid);
        }
        self.mru = Some(oid);
    }

    pub fn remove(&mut self, oid: Oid) {
        self.unlink(oid);
    }

    /// Oids from `ring_home.next` toward `ring_home` (LRU -> MRU), a
    /// snapshot safe to iterate across concurrent removal by the caller.
    pub fn order_from_lru(&self) -> Vec<Oid> {
        let mut out = Vec::with_capacity(self.links.len());
        let mut cur = self.lru;
        while let Some(oid) = cur {
            out.push(oid);
            cur = self.links.get(&oid).and_then(|l| l.next);
        }
        out
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        let forward = self.order_from_lru();
        assert_eq!(forward.len(), self.links.len());
        let mut seen_mru = None;
        for oid in &forward {
            seen_mru = Some(*oid);
        }
        assert_eq!(seen_mru, self.mru);
        for (&oid, link) in self.links.iter() {
            if let Some(p) = link.prev {
                assert_eq!(self.links[&p].next, Some(oid));
            } else {
                assert_eq!(self.lru, Some(oid));
            }
            if let Some(n) = link.next {
                assert_eq!(self.links[&n].prev, Some(oid));
            } else {
                assert_eq!(self.mru, Some(oid));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_moves_to_mru_end() {
        let mut r = Ring::new();
        r.touch(Oid(1));
        r.touch(Oid(2));
        r.touch(Oid(3));
        assert_eq!(r.order_from_lru(), vec![Oid(1), Oid(2), Oid(3)]);
        r.touch(Oid(1));
        assert_eq!(r.order_from_lru(), vec![Oid(2), Oid(3), Oid(1)]);
        r.check_invariants();
    }

    #[test]
    fn remove_middle_relinks_neighbors() {
        let mut r = Ring::new();
        for i in 1..=5u64 {
            r.touch(Oid(i));
        }
        r.remove(Oid(3));
        assert_eq!(
            r.order_from_lru(),
            vec![Oid(1), Oid(2), Oid(4), Oid(5)]
        );
        r.check_invariants();
    }
}
