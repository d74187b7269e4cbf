//! Views into buffers that survive buffer migration.
//!
//! A [`BufferView`] holds a delegate rather than a buffer, so the manager can
//! merge the underlying buffer away between uses. The price is paid at lock
//! time: the buffer resolved before acquisition may no longer be the current
//! one afterwards, so acquisition runs a lock-then-recheck loop and then
//! flattens the delegate chain while the view is stable.

use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::{Buffer, BufferBinding};
use crate::delegate::BufferDelegate;
use crate::fence::FenceCycle;
use crate::megabuffer::MegaBufferAllocator;
use crate::span::ByteSpan;
use crate::tag::ContextTag;

/// A contiguous sub-range of a buffer usable as an independent binding
/// target.
///
/// The `(buffer, offset)` pair a view resolves to may change over time as
/// buffers are merged; `size` is fixed at construction. The view must be
/// locked before accessing the underlying buffer through it.
#[derive(Clone)]
pub struct BufferView {
    delegate: Arc<BufferDelegate>,
    offset: usize,
    pub size: usize,
}

impl BufferView {
    pub(crate) fn new(delegate: Arc<BufferDelegate>, offset: usize, size: usize) -> Self {
        Self {
            delegate,
            offset,
            size,
        }
    }

    /// The buffer this view currently resolves to. The view must be locked.
    pub fn buffer(&self) -> Arc<Buffer> {
        self.delegate.buffer()
    }

    /// The view's offset in the underlying buffer. The view must be locked.
    pub fn offset(&self) -> usize {
        self.offset + self.delegate.offset()
    }

    /// Rewrites the delegate pointer chain so the view points directly at the
    /// current underlying buffer's delegate, folding link offsets into the
    /// view offset.
    fn resolve_delegate(&mut self) {
        self.offset += self.delegate.offset();
        self.delegate = self.delegate.buffer().delegate();
    }

    /// Locks the underlying buffer.
    ///
    /// If the buffer migrates between resolution and acquisition, the stale
    /// lock is released and the acquisition retried against the new buffer.
    pub fn lock(&mut self) {
        loop {
            let pre_lock = self.delegate.buffer();
            pre_lock.lock();
            if Arc::ptr_eq(&pre_lock, &self.delegate.buffer()) {
                break;
            }
            pre_lock.unlock();
        }
        self.resolve_delegate();
    }

    /// Attempts to lock the underlying buffer without blocking. A failed
    /// acquisition returns `false` immediately, without retrying migration.
    pub fn try_lock(&mut self) -> bool {
        loop {
            let pre_lock = self.delegate.buffer();
            if !pre_lock.try_lock() {
                return false;
            }
            if Arc::ptr_eq(&pre_lock, &self.delegate.buffer()) {
                break;
            }
            pre_lock.unlock();
        }
        self.resolve_delegate();
        true
    }

    /// Locks the underlying buffer unless `tag` already holds it. Returns
    /// whether the lock was freshly acquired by this call.
    pub fn lock_with_tag(&mut self, tag: ContextTag) -> bool {
        let acquired = loop {
            let pre_lock = self.delegate.buffer();
            let acquired = pre_lock.lock_with_tag(tag);
            if Arc::ptr_eq(&pre_lock, &self.delegate.buffer()) {
                break acquired;
            }
            pre_lock.unlock();
        };
        self.resolve_delegate();
        acquired
    }

    pub fn unlock(&self) {
        self.delegate.buffer().unlock();
    }

    /// Reads from the view at `read_offset`. The view must be locked; see
    /// [`Buffer::read`].
    pub fn read(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        out: &mut [u8],
        read_offset: usize,
    ) {
        self.buffer()
            .read(is_first_usage, flush_host, out, read_offset + self.offset());
    }

    /// Writes to the view at `write_offset`. The view must be locked; see
    /// [`Buffer::write`] for the GPU-copy retry contract.
    pub fn write(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        data: &[u8],
        write_offset: usize,
        gpu_copy: Option<&mut dyn FnMut()>,
    ) -> bool {
        self.buffer().write(
            is_first_usage,
            flush_host,
            data,
            write_offset + self.offset(),
            gpu_copy,
        )
    }

    /// Reads a POD value at `read_offset`. The view must be locked.
    pub fn read_val<T: Pod>(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        read_offset: usize,
    ) -> T {
        let mut value: T = bytemuck::Zeroable::zeroed();
        self.read(
            is_first_usage,
            flush_host,
            bytemuck::bytes_of_mut(&mut value),
            read_offset,
        );
        value
    }

    /// Writes a POD value at `write_offset`. The view must be locked; see
    /// [`Buffer::write`].
    pub fn write_val<T: Pod>(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        value: &T,
        write_offset: usize,
        gpu_copy: Option<&mut dyn FnMut()>,
    ) -> bool {
        self.write(
            is_first_usage,
            flush_host,
            bytemuck::bytes_of(value),
            write_offset,
            gpu_copy,
        )
    }

    /// Stages the view's contents into the megabuffer if beneficial,
    /// optionally overriding the staged size. The view must be locked; see
    /// [`Buffer::try_megabuffer_view`].
    pub fn try_megabuffer(
        &self,
        cycle: &Arc<FenceCycle>,
        allocator: &dyn MegaBufferAllocator,
        execution_number: u64,
        size_override: Option<usize>,
    ) -> Option<BufferBinding> {
        self.buffer().try_megabuffer_view(
            cycle,
            allocator,
            execution_number,
            self.offset(),
            size_override.unwrap_or(self.size),
        )
    }

    /// The view's slice of the mirror, synchronized from the GPU if needed.
    /// The returned span must not be written to, and the view must stay
    /// locked while it is in use.
    pub fn read_only_backing_span(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
    ) -> ByteSpan {
        let backing = self
            .buffer()
            .read_only_backing_span(is_first_usage, flush_host);
        backing.subspan(self.offset(), self.size)
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}
