use std::fmt;

/// Opaque object identifier issued by a [`crate::jar::Jar`].
///
/// Mirrors the 8-byte oid the original embedding assigns to every
/// persistent object; kept as a thin newtype so callers cannot confuse an
/// oid with an ordinary integer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u64);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}
