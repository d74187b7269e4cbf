//! Context tags for re-entrancy-by-identity on buffer locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for an execution context.
///
/// A context that locks a buffer with its tag may re-enter the lock with the
/// same tag without blocking; a single unlock releases it. The default tag
/// disables this behaviour.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ContextTag(u64);

impl ContextTag {
    /// The untagged context. Locks taken with this tag never match a later
    /// lock attempt.
    pub const NONE: ContextTag = ContextTag(0);

    /// Allocates a process-unique tag.
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextTag(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        ContextTag(raw)
    }
}
