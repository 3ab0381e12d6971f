//! Call tags: correlation tokens between an operation and its completion.
//!
//! A tag is handed to the substrate when an operation starts and comes back on
//! the completion queue when it ends. Consumers keep per-operation context in a
//! map keyed by the tag instead of reinterpreting addresses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token identifying one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallTag(u64);

impl CallTag {
    /// Build a tag from a raw value.
    ///
    /// Substrates and tests use this; engine code gets tags from a
    /// [`TagFactory`].
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Allocates tags that are unique for the lifetime of the factory.
///
/// Safe to share between workers; each call to [`next`](Self::next) returns a
/// value no other caller has seen.
#[derive(Debug)]
pub struct TagFactory {
    next_id: AtomicU64,
}

impl TagFactory {
    /// Create a factory starting from 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a factory starting from `first`.
    ///
    /// Useful when two factories feed the same queue and must not collide.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first),
        }
    }

    /// Allocate the next tag.
    pub fn next(&self) -> CallTag {
        CallTag(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TagFactory {
    fn default() -> Self {
        Self::new()
    }
}
