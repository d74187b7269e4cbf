//! Host GPU-visible buffer allocations.
//!
//! The coherency core does not talk to a graphics API directly; it asks a
//! [`HostAllocator`] for backings that are CPU-writable and GPU-visible and
//! identifies them by opaque [`BackingId`]s when handing out bindings. The
//! emulator wires in its real device allocator; [`SystemAllocator`] is a
//! heap-backed implementation for tests and headless runs.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::span::ByteSpan;

/// Opaque handle to a GPU-visible buffer object, the moral equivalent of the
/// graphics API's buffer handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BackingId(pub u64);

/// A GPU-visible allocation with a CPU-mappable view of its contents.
#[derive(Clone, Copy, Debug)]
pub struct Backing {
    pub id: BackingId,
    pub data: ByteSpan,
}

/// Allocates GPU-visible buffers.
pub trait HostAllocator: Send + Sync {
    /// Allocates a zero-initialized buffer of `size` bytes. The returned span
    /// stays valid for the lifetime of the allocator.
    fn allocate_buffer(&self, size: usize) -> Backing;
}

/// Heap-backed [`HostAllocator`].
///
/// Allocations are retained in an internal pool so their spans stay valid
/// until the allocator is dropped, mirroring how device memory outlives the
/// buffers suballocated from it.
pub struct SystemAllocator {
    pool: Mutex<Vec<Box<[u8]>>>,
    next_id: AtomicU64,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Looks up the span of a previously allocated backing.
    ///
    /// This exists so an execution engine (or a test standing in for one) can
    /// play the GPU's part and mutate backing contents directly.
    pub fn span_of(&self, id: BackingId) -> Option<ByteSpan> {
        let index = usize::try_from(id.0.checked_sub(1)?).ok()?;
        let mut pool = self.pool.lock();
        pool.get_mut(index)
            .map(|storage| ByteSpan::from_slice(storage))
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator for SystemAllocator {
    fn allocate_buffer(&self, size: usize) -> Backing {
        let mut storage = vec![0u8; size].into_boxed_slice();
        let data = ByteSpan::from_slice(&mut storage);
        // The id is assigned under the pool lock so ids and pool indices
        // agree even when allocations race.
        let mut pool = self.pool.lock();
        let id = BackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        pool.push(storage);
        Backing { id, data }
    }
}
