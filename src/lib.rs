//! Persistent, disk-backed ordered maps and sets with an object-level
//! pickle cache (spec.md "PURPOSE & SCOPE").
//!
//! The crate is organized the way the data model splits naturally:
//!
//! - [`oid`] — object identifiers.
//! - [`error`] — the shared `Result` error type, including three-way
//!   merge conflict reasons.
//! - [`key`] — the `KeyOps`/`ValueOps`/`Weighted` trait bundles every
//!   bucket and tree is generic over.
//! - [`jar`] — the storage/transaction collaborator trait, plus an
//!   in-memory implementation for tests.
//! - [`persistent`] — the ghost/up-to-date/changed state machine shared
//!   by every cache-resident node.
//! - [`ring`] and [`cache`] — the LRU ring and the pickle cache built on
//!   top of it.
//! - [`bucket`] — `Bucket`/`Set`, the leaf level.
//! - [`btree`] — `BTree`/`TreeSet`, the interior level.
//! - [`items`] — range/seek/slice iteration over a tree.
//! - [`setop`] — union/intersection/difference, plain and weighted.
//! - [`merge`] — three-way conflict resolution.

pub mod bucket;
pub mod btree;
pub mod cache;
pub mod error;
pub mod items;
pub mod jar;
pub mod key;
pub mod merge;
pub mod oid;
pub mod persistent;
pub mod ring;
pub mod setop;

pub use bucket::{Bucket, Set};
pub use btree::{BTree, TreeSet};
pub use cache::{CacheConfig, PickleCache};
pub use error::{ConflictReason, Error};
pub use items::{BTreeItems, Entry, ItemKind};
pub use jar::{Jar, JarError, MemoryJar};
pub use key::{KeyOps, NoValue, ValueOps, Weighted};
pub use oid::Oid;
pub use persistent::{Pinned, PersistentHeader, PersistentNode, State, StickyGuard};
