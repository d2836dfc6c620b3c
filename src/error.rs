//! Error taxonomy for the whole crate (spec.md §7).
//!
//! Every fallible core operation returns `Result<_, Error>`. `has_key` /
//! `contains_key` are the one exception called out in the spec: they
//! return a bare `bool` and never raise `KeyError`.

/// The conflict-resolution branch that could not be reconciled.
///
/// These codes are a stable part of the external contract (three-way
/// merge callers key on them for telemetry). They match the numbering
/// the original `bucket_merge`'s `merge_error(p1, p2, p3, reason)` call
/// sites use, not a renumbering local to this crate — see
/// [`crate::merge::reason`].
pub type ConflictReason = u8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    KeyError,

    #[error("{0}")]
    ValueError(String),

    #[error("{0}")]
    TypeError(String),

    #[error(
        "three-way merge conflict at positions ({pos1}, {pos2}, {pos3}), reason {reason}"
    )]
    Conflict {
        pos1: i64,
        pos2: i64,
        pos3: i64,
        reason: ConflictReason,
    },

    #[error("iterator index out of range")]
    IndexError,

    #[error("corrupted structure: {0}")]
    RuntimeError(String),

    #[error("comparator failed: {0}")]
    Comparator(String),

    #[error("jar error: {0}")]
    Jar(String),
}

impl Error {
    pub fn conflict(pos1: i64, pos2: i64, pos3: i64, reason: ConflictReason) -> Error {
        Error::Conflict {
            pos1,
            pos2,
            pos3,
            reason,
        }
    }
}
