//! Stable indirection between views and migrating buffers.
//!
//! When the buffer manager merges overlapping buffers, outstanding views must
//! transparently start resolving to the replacement buffer. Rather than
//! scanning every view at merge time, each buffer owns a delegate and the
//! merge links the old buffer's delegate to the new buffer's delegate with an
//! additive offset. Views pay the cost lazily: the next stable lock flattens
//! the chain.

use std::sync::{Arc, OnceLock, Weak};

use crate::buffer::Buffer;

struct DelegateLink {
    target: Arc<BufferDelegate>,
    offset: usize,
}

/// A stable handle to a buffer that can be redirected to a replacement.
///
/// Links are write-once and chains are acyclic; both are upheld by the buffer
/// manager, which owns all delegates and links only freshly created buffers.
pub struct BufferDelegate {
    target: Weak<Buffer>,
    link: OnceLock<DelegateLink>,
}

impl BufferDelegate {
    pub(crate) fn new(target: Weak<Buffer>) -> Arc<Self> {
        Arc::new(Self {
            target,
            link: OnceLock::new(),
        })
    }

    /// The buffer this delegate currently resolves to, following links.
    ///
    /// Panics if the terminal buffer has been dropped; the manager keeps
    /// every buffer reachable from an outstanding view alive.
    pub fn buffer(self: &Arc<Self>) -> Arc<Buffer> {
        let mut current = Arc::clone(self);
        while let Some(link) = current.link.get() {
            let next = Arc::clone(&link.target);
            current = next;
        }
        current
            .target
            .upgrade()
            .expect("delegate resolves to a dropped buffer; the manager must keep linked buffers alive")
    }

    /// The accumulated offset along the link chain. Zero for a delegate that
    /// was never linked.
    pub fn offset(&self) -> usize {
        let mut total = 0;
        let mut current = self.link.get();
        while let Some(link) = current {
            total += link.offset;
            current = link.target.link.get();
        }
        total
    }

    /// Redirects this delegate to `target`, offsetting all resolutions by
    /// `offset`. Both the current and the new buffer must be locked.
    ///
    /// Panics if the delegate is already linked.
    pub fn link(&self, target: Arc<BufferDelegate>, offset: usize) {
        let linked = self
            .link
            .set(DelegateLink { target, offset })
            .is_ok();
        assert!(linked, "cannot link a buffer delegate that is already linked");
    }

    pub fn is_linked(&self) -> bool {
        self.link.get().is_some()
    }
}

impl std::fmt::Debug for BufferDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDelegate")
            .field("linked", &self.is_linked())
            .finish()
    }
}
