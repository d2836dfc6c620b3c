//! Jar protocol (spec.md §6 "Jar protocol") and an in-memory test double.
//!
//! The pickle format, the real storage backend, and transaction
//! orchestration are all out of scope (spec.md §1) — they belong to a
//! host application. This module defines the trait boundary the core
//! calls into, plus [`MemoryJar`], a minimal collaborator used by this
//! crate's own tests and doctests. It is grounded in the teacher's
//! `tx.rs`/`meta.rs` pair, which play the same "transaction stand-in"
//! role for the B+tree engine, generalized into something actually
//! usable instead of an empty stub.

use crate::oid::Oid;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage/transaction collaborator consumed by persistent nodes.
///
/// Every method is synchronous per spec.md §5 ("Every `activate` call may
/// block while the jar materializes state... every mutation may trigger
/// `jar.register` which is synchronous").
pub trait Jar {
    /// Fetch the serialized state last stored for `oid`.
    fn load(&self, oid: Oid) -> Result<Vec<u8>, JarError>;

    /// Persist `bytes` as the new state for `oid`.
    fn store(&self, oid: Oid, bytes: Vec<u8>) -> Result<(), JarError>;

    /// Join `oid` to the jar's current transaction (spec.md: "jar.register").
    fn register(&self, oid: Oid) -> Result<(), JarError>;

    /// Allocate a fresh oid for a transient object being placed in the jar.
    fn new_oid(&self) -> Oid;

    /// Reinitialize a persistent class (spec.md §4.6 "Sentinel class
    /// values"). Most hosts never use persistent classes; the default
    /// is a no-op.
    fn setklassstate(&self, _class_name: &str) -> Result<(), JarError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JarError {
    #[error("no state stored for {0}")]
    NotFound(Oid),
    #[error("{0}")]
    Other(String),
}

/// A trivial in-process jar: an oid counter plus a `HashMap<Oid, Vec<u8>>`.
/// No durability, no transactions beyond a running "registered" set —
/// sufficient to exercise activate/deactivate/register end to end in
/// tests without a real storage backend.
#[derive(Default)]
pub struct MemoryJar {
    next_oid: AtomicU64,
    store: RefCell<HashMap<Oid, Vec<u8>>>,
    registered: RefCell<Vec<Oid>>,
}

impl MemoryJar {
    pub fn new() -> Self {
        MemoryJar {
            next_oid: AtomicU64::new(1),
            store: RefCell::new(HashMap::new()),
            registered: RefCell::new(Vec::new()),
        }
    }

    /// Objects that have called `register` since the jar was created (or
    /// last cleared). A real jar would drain this at transaction commit.
    pub fn registered(&self) -> Vec<Oid> {
        self.registered.borrow().clone()
    }

    pub fn clear_registered(&self) {
        self.registered.borrow_mut().clear();
    }
}

impl Jar for MemoryJar {
    fn load(&self, oid: Oid) -> Result<Vec<u8>, JarError> {
        self.store
            .borrow()
            .get(&oid)
            .cloned()
            .ok_or(JarError::NotFound(oid))
    }

    fn store(&self, oid: Oid, bytes: Vec<u8>) -> Result<(), JarError> {
        self.store.borrow_mut().insert(oid, bytes);
        Ok(())
    }

    fn register(&self, oid: Oid) -> Result<(), JarError> {
        let mut reg = self.registered.borrow_mut();
        if !reg.contains(&oid) {
            reg.push(oid);
        }
        Ok(())
    }

    fn new_oid(&self) -> Oid {
        Oid(self.next_oid.fetch_add(1, Ordering::Relaxed))
    }
}
