//! Persistent object base and state machine (spec.md §3 "Persistent
//! header", §4.1).
//!
//! REDESIGN FLAGS (spec.md §9) calls for collapsing the four persisted
//! states `{GHOST, UPTODATE, CHANGED, STICKY}` down to three, with
//! stickiness modeled as a scoped guard rather than a state. That's what
//! this module does: [`State`] only ever holds `Ghost`, `UpToDate`, or
//! `Changed`; [`StickyGuard`] is a RAII pin that blocks the cache's GC
//! from ghostifying an object while a critical section holds a live
//! borrow into its payload.

use crate::error::Error;
use crate::jar::Jar;
use crate::oid::Oid;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Persistence state of a node (spec.md §3 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum State {
    Ghost = -1,
    UpToDate = 0,
    Changed = 1,
}

/// Embedded in every persistent node (spec.md §3 "Persistent header").
///
/// `ring`/`cache` linkage lives in the cache itself (spec.md §9's arena
/// rewrite: "ring placement becomes explicit instead of piggybacked on
/// refcount stealing"), so the header only needs the jar/oid/serial/state
/// bookkeeping a node manages on its own behalf.
#[derive(Debug)]
pub struct PersistentHeader {
    oid: Option<Oid>,
    jar: Option<Weak<dyn Jar>>,
    serial: u64,
    state: State,
    pins: u32,
    /// 24-bit size estimate in 64-byte blocks, spec.md §3.
    estimated_size: u32,
}

const MAX_ESTIMATED_SIZE: u32 = 0xFF_FFFF;

impl PersistentHeader {
    /// A freshly created, transient (unattached) object: UPTODATE per
    /// spec.md §3 "Lifecycle".
    pub fn transient() -> Self {
        PersistentHeader {
            oid: None,
            jar: None,
            serial: 0,
            state: State::UpToDate,
            pins: 0,
            estimated_size: 0,
        }
    }

    /// An object installed by the jar as a ghost.
    pub fn ghost(oid: Oid, jar: Weak<dyn Jar>) -> Self {
        PersistentHeader {
            oid: Some(oid),
            jar: Some(jar),
            serial: 0,
            state: State::Ghost,
            pins: 0,
            estimated_size: 0,
        }
    }

    pub fn oid(&self) -> Option<Oid> {
        self.oid
    }

    pub fn set_oid(&mut self, oid: Oid) {
        self.oid = Some(oid);
    }

    pub fn attach_jar(&mut self, jar: Weak<dyn Jar>) {
        self.jar = Some(jar);
    }

    pub fn jar(&self) -> Option<std::rc::Rc<dyn Jar>> {
        self.jar.as_ref().and_then(Weak::upgrade)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn bump_serial(&mut self) {
        self.serial = self.serial.wrapping_add(1);
    }

    pub fn estimated_size(&self) -> u32 {
        self.estimated_size
    }

    pub fn set_estimated_size(&mut self, blocks: u32) {
        self.estimated_size = blocks.min(MAX_ESTIMATED_SIZE);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pin(&mut self) {
        self.pins += 1;
    }

    pub fn unpin(&mut self) {
        self.pins = self.pins.saturating_sub(1);
    }

    /// `activate`: GHOST -> UPTODATE is the caller's job (it must reload
    /// payload from the jar first); this just flips the bookkeeping bit
    /// once that's done.
    pub fn mark_uptodate(&mut self) {
        if self.state == State::Ghost {
            self.state = State::UpToDate;
        }
    }

    /// Unconditional GHOST transition (spec.md §4.1 "invalidate").
    pub fn force_ghost(&mut self) {
        self.state = State::Ghost;
    }

    /// UPTODATE -> GHOST, refused if CHANGED or pinned sticky.
    /// Returns whether the transition happened.
    pub fn try_deactivate(&mut self) -> bool {
        if self.state == State::UpToDate && !self.is_pinned() {
            self.state = State::Ghost;
            true
        } else {
            false
        }
    }

    /// `change-notify`: first mutation while UPTODATE/pinned-UPTODATE.
    /// Registers with the jar (if attached) then flips to CHANGED.
    /// No-op (`Ok(())`) if already CHANGED. Errors if called on a ghost:
    /// a ghost has no live payload to mutate, so reaching this is a
    /// programmer error in the caller, not user error.
    pub fn change_notify(&mut self) -> Result<(), Error> {
        match self.state {
            State::Changed => Ok(()),
            State::Ghost => Err(Error::RuntimeError(
                "mutation attempted on a ghost object".into(),
            )),
            State::UpToDate => {
                if let (Some(jar), Some(oid)) = (self.jar(), self.oid) {
                    jar.register(oid).map_err(|e| Error::Jar(e.to_string()))?;
                }
                self.state = State::Changed;
                self.bump_serial();
                Ok(())
            }
        }
    }
}

/// Object-safe trait every cache-resident node implements so
/// [`crate::cache::PickleCache`] can manage it without knowing its key/value
/// types.
pub trait PersistentNode {
    fn oid(&self) -> Option<Oid>;
    fn state(&self) -> State;
    fn estimated_size(&self) -> u32;

    /// Attempt UPTODATE -> GHOST, dropping resident payload (keys,
    /// values, child pointers). Returns whether it happened.
    fn deactivate(&self) -> bool;

    /// Unconditional GHOST transition, regardless of dirtiness
    /// (spec.md §4.1 "invalidate").
    fn invalidate(&self);
}

/// Anything with a [`PersistentHeader`] to pin (spec.md §4.1 "STICKY").
/// Implemented directly on [`crate::bucket::Bucket`] and
/// [`crate::btree::BTree`] rather than on their `RefCell` wrappers, since
/// pinning needs `&mut` access to the header field itself.
pub trait Pinned {
    fn header_mut(&mut self) -> &mut PersistentHeader;
}

/// RAII pin: raises the node's pin count for as long as the guard lives,
/// blocking [`PersistentHeader::try_deactivate`] the way spec.md §4.1's
/// STICKY state blocks GC from ghostifying an object mid-critical-section.
/// Reentrant — nesting two guards over the same node just adds two counts,
/// and the node stays pinned until both drop.
pub struct StickyGuard<T: Pinned> {
    node: Rc<RefCell<T>>,
}

impl<T: Pinned> StickyGuard<T> {
    pub fn new(node: &Rc<RefCell<T>>) -> Self {
        node.borrow_mut().header_mut().pin();
        StickyGuard { node: Rc::clone(node) }
    }
}

impl<T: Pinned> Drop for StickyGuard<T> {
    fn drop(&mut self) {
        self.node.borrow_mut().header_mut().unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(PersistentHeader);

    impl Pinned for Dummy {
        fn header_mut(&mut self) -> &mut PersistentHeader {
            &mut self.0
        }
    }

    #[test]
    fn guard_pins_on_construction_and_unpins_on_drop() {
        let node = Rc::new(RefCell::new(Dummy(PersistentHeader::transient())));
        assert!(!node.borrow().0.is_pinned());
        {
            let _guard = StickyGuard::new(&node);
            assert!(node.borrow().0.is_pinned());
            assert!(!node.borrow_mut().0.try_deactivate());
        }
        assert!(!node.borrow().0.is_pinned());
    }

    #[test]
    fn nested_guards_keep_node_pinned_until_both_drop() {
        let node = Rc::new(RefCell::new(Dummy(PersistentHeader::transient())));
        let outer = StickyGuard::new(&node);
        let inner = StickyGuard::new(&node);
        assert!(node.borrow().0.is_pinned());
        drop(inner);
        assert!(node.borrow().0.is_pinned());
        drop(outer);
        assert!(!node.borrow().0.is_pinned());
    }
}
