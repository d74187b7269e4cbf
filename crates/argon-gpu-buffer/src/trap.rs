//! CPU memory-protection traps over guest mappings.
//!
//! Guest writes to a mirrored buffer are not observable through cache
//! coherence; they are caught by protecting the guest pages and fielding the
//! resulting faults. The [`TrapFacility`] trait is the contract the core
//! programs against; the emulator provides an MMU-backed implementation on
//! real guests, while [`SoftTraps`] simulates the same protection state
//! machine in software so the core can be exercised without signal handlers.
//!
//! Trap callbacks run on the faulting guest thread under signal-like
//! constraints. A read or write callback returning `false` means it could
//! not make progress without blocking; the facility must retry the access
//! until the callback reports it handled the fault.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::span::ByteSpan;

/// Callbacks invoked from the fault path of a trapped region.
pub struct TrapCallbacks {
    /// Runs synchronously before a write fault is serviced. Used to stall the
    /// guest thread while the GPU holds the backing immutable.
    pub preempt: Box<dyn Fn() + Send + Sync>,
    /// Services a read fault. Returns `false` to request a retry.
    pub read: Box<dyn Fn() -> bool + Send + Sync>,
    /// Services a write fault. Returns `false` to request a retry.
    pub write: Box<dyn Fn() -> bool + Send + Sync>,
}

/// Handle to an installed trap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TrapHandle(u64);

/// Protection applied to a trapped region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    /// No faults are raised.
    None,
    /// Writes fault, reads proceed.
    WriteOnly,
    /// Reads and writes fault.
    ReadWrite,
}

/// Memory-protection facility over guest mappings.
pub trait TrapFacility: Send + Sync {
    /// Maps a host-linear mirror aliasing the same physical pages as
    /// `aligned`, which must be page-aligned.
    fn create_mirror(&self, aligned: ByteSpan) -> ByteSpan;

    /// Installs trap callbacks over `region`. The region starts unprotected;
    /// call [`Self::trap_regions`] to arm it.
    fn create_trap(&self, region: ByteSpan, callbacks: TrapCallbacks) -> TrapHandle;

    /// (Re)arms protection on the trap's region. `write_only` protects only
    /// writes; otherwise both reads and writes fault.
    fn trap_regions(&self, handle: TrapHandle, write_only: bool);

    /// Releases the guest physical pages behind the trap's region. The next
    /// guest access faults and must repopulate the contents.
    fn page_out_regions(&self, handle: TrapHandle);

    /// Removes protection and callbacks. The handle is invalid afterwards.
    fn delete_trap(&self, handle: TrapHandle);
}

/// Errors from [`SoftTraps`]' simulated guest accesses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrapError {
    /// A trap callback kept requesting retries past the facility's budget.
    /// Almost always a lock-ordering bug in the callbacks under test.
    #[error("trap callback requested retry {attempts} times without making progress")]
    RetryBudgetExhausted { attempts: u32 },
}

struct TrapEntry {
    region: ByteSpan,
    callbacks: Arc<TrapCallbacks>,
    protection: Protection,
    paged_out: bool,
}

/// Software implementation of [`TrapFacility`].
///
/// Guest memory is allocated from page-aligned arenas owned by the facility,
/// and `create_mirror` returns the aliased storage itself, exactly as a
/// shared-mapping mirror would behave. Guest reads and writes performed
/// through [`SoftTraps::guest_read`]/[`SoftTraps::guest_write`] run the full
/// fault protocol: preempt, retry loop, protection downgrade.
pub struct SoftTraps {
    traps: Mutex<HashMap<u64, TrapEntry>>,
    arenas: Mutex<Vec<PageAlloc>>,
    next_handle: AtomicU64,
    retry_events: AtomicU64,
}

/// Retries before a simulated guest access gives up. Generous because the
/// contended path legitimately spins until another thread releases the
/// buffer lock.
const RETRY_BUDGET: u32 = 10_000_000;

impl SoftTraps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            traps: Mutex::new(HashMap::new()),
            arenas: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            retry_events: AtomicU64::new(0),
        })
    }

    /// Allocates `len` bytes of zeroed, page-aligned guest memory owned by
    /// the facility.
    pub fn allocate_guest_pages(&self, len: usize) -> ByteSpan {
        let alloc = PageAlloc::zeroed(len);
        let span = alloc.span();
        self.arenas.lock().push(alloc);
        span
    }

    /// Total number of retry requests observed across all traps. Lets tests
    /// confirm that contention actually exercised the retry path.
    pub fn retry_events(&self) -> u64 {
        self.retry_events.load(Ordering::Relaxed)
    }

    /// Simulated guest write of `data` to `dst`.
    ///
    /// Returns the number of callback retries that occurred.
    pub fn guest_write(&self, dst: ByteSpan, data: &[u8]) -> Result<u32, TrapError> {
        assert_eq!(dst.len(), data.len());
        let retries = self.fault(dst, AccessKind::Write)?;
        unsafe { dst.write_bytes_at(0, data) };
        Ok(retries)
    }

    /// Simulated guest read from `src` into `out`.
    ///
    /// Returns the number of callback retries that occurred.
    pub fn guest_read(&self, src: ByteSpan, out: &mut [u8]) -> Result<u32, TrapError> {
        assert_eq!(src.len(), out.len());
        let retries = self.fault(src, AccessKind::Read)?;
        unsafe { src.read_bytes_at(0, out) };
        Ok(retries)
    }

    fn fault(&self, target: ByteSpan, kind: AccessKind) -> Result<u32, TrapError> {
        let mut total_retries = 0u32;
        loop {
            // Find a trap that would fault for this access. The callbacks are
            // invoked with the registry unlocked since they take buffer locks.
            let faulting = {
                let traps = self.traps.lock();
                traps.iter().find_map(|(&handle, entry)| {
                    if !entry.region.overlaps(target) {
                        return None;
                    }
                    let faults = match kind {
                        AccessKind::Write => entry.protection != Protection::None,
                        AccessKind::Read => {
                            entry.protection == Protection::ReadWrite || entry.paged_out
                        }
                    };
                    faults.then(|| (handle, Arc::clone(&entry.callbacks)))
                })
            };

            let Some((handle, callbacks)) = faulting else {
                return Ok(total_retries);
            };

            trace!(handle, ?kind, addr = target.addr(), "guest fault");

            if kind == AccessKind::Write {
                (callbacks.preempt)();
            }

            let serviced = match kind {
                AccessKind::Write => &callbacks.write,
                AccessKind::Read => &callbacks.read,
            };
            let mut attempts = 0u32;
            while !serviced() {
                attempts += 1;
                total_retries += 1;
                self.retry_events.fetch_add(1, Ordering::Relaxed);
                if attempts >= RETRY_BUDGET {
                    return Err(TrapError::RetryBudgetExhausted { attempts });
                }
                std::thread::yield_now();
            }

            // Downgrade protection the way an MMU-backed facility would after
            // a handled fault, so the retried access proceeds.
            let mut traps = self.traps.lock();
            if let Some(entry) = traps.get_mut(&handle) {
                match kind {
                    AccessKind::Write => entry.protection = Protection::None,
                    AccessKind::Read => {
                        if entry.protection == Protection::ReadWrite {
                            entry.protection = Protection::WriteOnly;
                        }
                    }
                }
                entry.paged_out = false;
            }
        }
    }

    /// Protection currently applied to a trap, for assertions in tests.
    pub fn protection_of(&self, handle: TrapHandle) -> Option<Protection> {
        self.traps.lock().get(&handle.0).map(|entry| entry.protection)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AccessKind {
    Read,
    Write,
}

impl TrapFacility for SoftTraps {
    fn create_mirror(&self, aligned: ByteSpan) -> ByteSpan {
        // The simulated mirror aliases the same storage; a shared mapping of
        // the same physical pages behaves identically.
        aligned
    }

    fn create_trap(&self, region: ByteSpan, callbacks: TrapCallbacks) -> TrapHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.traps.lock().insert(
            handle,
            TrapEntry {
                region,
                callbacks: Arc::new(callbacks),
                protection: Protection::None,
                paged_out: false,
            },
        );
        TrapHandle(handle)
    }

    fn trap_regions(&self, handle: TrapHandle, write_only: bool) {
        // A trap deleted concurrently by buffer invalidation is ignored.
        if let Some(entry) = self.traps.lock().get_mut(&handle.0) {
            entry.protection = if write_only {
                Protection::WriteOnly
            } else {
                Protection::ReadWrite
            };
        }
    }

    fn page_out_regions(&self, handle: TrapHandle) {
        if let Some(entry) = self.traps.lock().get_mut(&handle.0) {
            entry.paged_out = true;
        }
    }

    fn delete_trap(&self, handle: TrapHandle) {
        self.traps.lock().remove(&handle.0);
    }
}

/// A page-aligned, heap-owned allocation.
struct PageAlloc {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

unsafe impl Send for PageAlloc {}

impl PageAlloc {
    fn zeroed(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len.max(1), crate::span::PAGE_SIZE)
            .expect("guest arena layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "guest arena allocation failed");
        Self { ptr, len, layout }
    }

    fn span(&self) -> ByteSpan {
        unsafe { ByteSpan::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}
