//! The guest-host buffer coherency core.
//!
//! A [`Buffer`] pairs one contiguous guest memory region with one GPU-visible
//! backing and keeps the two consistent. Guest CPU writes are observed
//! through memory-protection traps and recorded as `CpuDirty`; GPU writes are
//! declared through [`Buffer::mark_gpu_dirty`] and fenced by a
//! [`FenceCycle`]. All mutation is serialized by an exclusive buffer lock
//! held for the duration of an execution context, with a separate state lock
//! serializing the coherency metadata so fault handlers can inspect it
//! without taking the full buffer lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::Mutex;
use tracing::trace;

use crate::backing::{Backing, BackingId, HostAllocator};
use crate::delegate::BufferDelegate;
use crate::fence::FenceCycle;
use crate::megabuffer::{Allocation, MegaBufferAllocator, MegaBufferConfig};
use crate::span::{align_down, align_up, ByteSpan, PAGE_SIZE};
use crate::tag::ContextTag;
use crate::trap::{TrapCallbacks, TrapFacility, TrapHandle};
use crate::view::BufferView;

/// Sequence number all buffers start off with.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// Which side of the guest/host pair holds the current truth.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DirtyState {
    /// The mirror and the backing agree.
    Clean,
    /// The mirror has been modified and the backing is stale.
    CpuDirty,
    /// The backing has been modified and the mirror is stale.
    GpuDirty,
}

/// How the backing may be accessed from the CPU for the current context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackingImmutability {
    /// The backing can be freely written.
    None,
    /// Sequenced writes must not modify the backing on the CPU because it is
    /// read directly on the GPU; unsequenced synchronization may still write
    /// it.
    SequencedWrites,
    /// No CPU writes to the backing at all; everything must be sequenced on
    /// the GPU or deferred.
    AllWrites,
}

/// A slice of a GPU-visible buffer suitable for binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BackingId,
    pub offset: u64,
    pub size: usize,
}

/// Coherency metadata guarded by the state lock.
struct CoherencyState {
    dirty: DirtyState,
    immutability: BackingImmutability,
    /// Completion signal of the latest GPU work touching the backing. Must be
    /// awaited before any CPU mutation of the backing.
    cycle: Option<Arc<FenceCycle>>,
}

struct GuestMappings {
    guest: Option<ByteSpan>,
    trap: Option<TrapHandle>,
}

struct MegaBufferTableEntry {
    allocation: Option<Allocation>,
    execution_number: u64,
    sequence_number: u64,
}

struct MegaBufferTable {
    shift: u32,
    entries: Vec<MegaBufferTableEntry>,
}

/// A guest memory region mirrored by a GPU-visible backing.
pub struct Buffer {
    id: u64,
    traps: Option<Arc<dyn TrapFacility>>,
    backing: Backing,
    /// Host-linear alias of the guest region, the authoritative CPU-side
    /// copy. Empty for host-only buffers.
    mirror: ByteSpan,
    /// Page-aligned superset of the mirror, as mapped by the trap facility.
    aligned_mirror: ByteSpan,
    mappings: Mutex<GuestMappings>,
    state: Mutex<CoherencyState>,
    /// Exclusive lock over the buffer as a coherency unit. Held raw so a
    /// context can keep it across calls and release it from another scope.
    mutex: parking_lot::RawMutex,
    /// Tag of the context currently holding `mutex`, zero when untagged.
    tag: AtomicU64,
    /// Incremented on every mutation of the backing (never for mirror-only
    /// writes). Guarded by the buffer lock; atomic only to be readable
    /// through `&self`.
    sequence_number: AtomicU64,
    /// Set once a GPU-visible inline write has ever occurred, which makes
    /// megabuffering worthwhile.
    ever_had_inline_update: AtomicBool,
    megabuffer_config: MegaBufferConfig,
    megabuffer_table: Mutex<MegaBufferTable>,
    delegate: Arc<BufferDelegate>,
}

impl Buffer {
    /// Creates a buffer mirroring `guest` with a freshly allocated backing.
    ///
    /// The buffer starts `CpuDirty` (the guest holds the truth) and untrapped;
    /// call [`Buffer::setup_guest_mappings`] afterwards to install the traps,
    /// which capture a weak reference to the returned `Arc`.
    pub fn new_guest(
        allocator: &dyn HostAllocator,
        traps: Arc<dyn TrapFacility>,
        config: MegaBufferConfig,
        guest: ByteSpan,
        id: u64,
    ) -> Arc<Buffer> {
        let backing = allocator.allocate_buffer(guest.len());

        let aligned_start = align_down(guest.addr(), PAGE_SIZE);
        let aligned_end = align_up(guest.addr() + guest.len(), PAGE_SIZE);
        let aligned =
            unsafe { ByteSpan::from_raw_parts(aligned_start as *mut u8, aligned_end - aligned_start) };
        let aligned_mirror = traps.create_mirror(aligned);
        let mirror = aligned_mirror.subspan(guest.addr() - aligned_start, guest.len());

        let shift = config.table_shift(guest.len());
        let entries = MegaBufferConfig::table_entries(guest.len(), shift);

        Arc::new_cyclic(|weak| Buffer {
            id,
            traps: Some(traps),
            backing,
            mirror,
            aligned_mirror,
            mappings: Mutex::new(GuestMappings {
                guest: Some(guest),
                trap: None,
            }),
            state: Mutex::new(CoherencyState {
                dirty: DirtyState::CpuDirty,
                immutability: BackingImmutability::None,
                cycle: None,
            }),
            mutex: parking_lot::RawMutex::INIT,
            tag: AtomicU64::new(0),
            sequence_number: AtomicU64::new(INITIAL_SEQUENCE_NUMBER),
            ever_had_inline_update: AtomicBool::new(false),
            megabuffer_config: config,
            megabuffer_table: Mutex::new(MegaBufferTable {
                shift,
                entries: (0..entries)
                    .map(|_| MegaBufferTableEntry {
                        allocation: None,
                        execution_number: 0,
                        sequence_number: 0,
                    })
                    .collect(),
            }),
            delegate: BufferDelegate::new(weak.clone()),
        })
    }

    /// Creates a buffer with no guest backing. Host-only buffers have no
    /// mirror and are permanently `Clean`.
    pub fn new_host_only(allocator: &dyn HostAllocator, size: usize, id: u64) -> Arc<Buffer> {
        let backing = allocator.allocate_buffer(size);
        Arc::new_cyclic(|weak| Buffer {
            id,
            traps: None,
            backing,
            mirror: ByteSpan::empty(),
            aligned_mirror: ByteSpan::empty(),
            mappings: Mutex::new(GuestMappings {
                guest: None,
                trap: None,
            }),
            state: Mutex::new(CoherencyState {
                dirty: DirtyState::Clean,
                immutability: BackingImmutability::None,
                cycle: None,
            }),
            mutex: parking_lot::RawMutex::INIT,
            tag: AtomicU64::new(0),
            sequence_number: AtomicU64::new(INITIAL_SEQUENCE_NUMBER),
            ever_had_inline_update: AtomicBool::new(false),
            megabuffer_config: MegaBufferConfig::default(),
            megabuffer_table: Mutex::new(MegaBufferTable {
                shift: 0,
                entries: Vec::new(),
            }),
            delegate: BufferDelegate::new(weak.clone()),
        })
    }

    /// Installs the guest traps. Must be called once after construction for
    /// guest-backed buffers; the callbacks capture a weak self-reference and
    /// silently no-op if the buffer is gone by the time they fire.
    pub fn setup_guest_mappings(self: &Arc<Self>) {
        let mut mappings = self.mappings.lock();
        let (Some(traps), Some(guest)) = (self.traps.as_ref(), mappings.guest) else {
            return;
        };

        let preempt = {
            let weak = Arc::downgrade(self);
            Box::new(move || {
                let Some(buffer) = weak.upgrade() else { return };
                let stalled = {
                    let state = buffer.state.lock();
                    state.immutability == BackingImmutability::AllWrites
                };
                // The state lock is released first so handlers on other
                // threads are not blocked while we stall on the buffer lock.
                if stalled {
                    buffer.lock();
                    buffer.unlock();
                }
            }) as Box<dyn Fn() + Send + Sync>
        };

        let read = {
            let weak = Arc::downgrade(self);
            Box::new(move || {
                let Some(buffer) = weak.upgrade() else { return true };
                trace!(buffer = buffer.id, "read trap");

                let Some(mut state) = buffer.state.try_lock() else {
                    return false;
                };
                if state.dirty != DirtyState::GpuDirty {
                    return true;
                }
                if !buffer.try_lock() {
                    return false;
                }
                // Trapping is skipped since the facility rearms protection
                // itself once the fault is handled.
                buffer.synchronize_guest_locked(&mut state, true, false);
                drop(state);
                buffer.unlock();
                true
            }) as Box<dyn Fn() -> bool + Send + Sync>
        };

        let write = {
            let weak = Arc::downgrade(self);
            Box::new(move || {
                let Some(buffer) = weak.upgrade() else { return true };
                trace!(buffer = buffer.id, "write trap");

                let Some(mut state) = buffer.state.try_lock() else {
                    return false;
                };
                if state.immutability != BackingImmutability::AllWrites
                    && state.dirty != DirtyState::GpuDirty
                {
                    state.dirty = DirtyState::CpuDirty;
                    return true;
                }
                if !buffer.try_lock() {
                    return false;
                }
                Self::wait_on_fence_locked(&mut state);
                // The guest is about to write bytes we cannot predict, so the
                // backing contents must be pulled back first.
                buffer.synchronize_guest_locked(&mut state, true, false);
                state.dirty = DirtyState::CpuDirty;
                buffer.unlock_with_state(&mut state);
                true
            }) as Box<dyn Fn() -> bool + Send + Sync>
        };

        mappings.trap = Some(traps.create_trap(
            guest,
            TrapCallbacks {
                preempt,
                read,
                write,
            },
        ));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backing_id(&self) -> BackingId {
        self.backing.id
    }

    /// The span of the backing, for host-only buffers whose contents are
    /// managed directly by the caller.
    ///
    /// Panics on guest-backed buffers, where backing access must go through
    /// the synchronized read/write paths.
    pub fn backing_span(&self) -> ByteSpan {
        assert!(
            self.mappings.lock().guest.is_none(),
            "attempted to get a span of a guest-backed buffer"
        );
        self.backing.data
    }

    /// The delegate owned by this buffer, through which views resolve to it.
    pub fn delegate(&self) -> Arc<BufferDelegate> {
        Arc::clone(&self.delegate)
    }

    fn guest_mapping(&self) -> Option<(ByteSpan, Option<TrapHandle>)> {
        let mappings = self.mappings.lock();
        mappings.guest.map(|guest| (guest, mappings.trap))
    }

    // --- locking -----------------------------------------------------------

    /// Acquires the exclusive buffer lock for the calling context.
    pub fn lock(&self) {
        self.mutex.lock();
    }

    /// Attempts to acquire the buffer lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.mutex.try_lock()
    }

    /// Acquires the buffer lock unless `tag` already holds it.
    ///
    /// Returns whether the lock was acquired by this call; `false` means the
    /// same context already owned it and no additional unlock is required.
    /// All locks with one tag must come from one thread.
    pub fn lock_with_tag(&self, tag: ContextTag) -> bool {
        if !tag.is_none() && tag == ContextTag::from_raw(self.tag.load(Ordering::Relaxed)) {
            return false;
        }
        self.mutex.lock();
        self.tag.store(tag.raw(), Ordering::Relaxed);
        true
    }

    /// Releases the buffer lock. Backing immutability is strictly
    /// per-context and resets here along with the tag.
    pub fn unlock(&self) {
        self.tag.store(0, Ordering::Relaxed);
        self.state.lock().immutability = BackingImmutability::None;
        unsafe { self.mutex.unlock() };
    }

    /// As [`Buffer::unlock`], for paths already holding the state lock.
    fn unlock_with_state(&self, state: &mut CoherencyState) {
        self.tag.store(0, Ordering::Relaxed);
        state.immutability = BackingImmutability::None;
        unsafe { self.mutex.unlock() };
    }

    // --- immutability and fences -------------------------------------------

    /// Prevents sequenced CPU writes to the backing for the duration of the
    /// context; unsequenced writes (synchronization) may still occur. The
    /// buffer must be locked.
    pub fn block_sequenced_cpu_backing_writes(&self) {
        let mut state = self.state.lock();
        if state.immutability == BackingImmutability::None {
            state.immutability = BackingImmutability::SequencedWrites;
        }
    }

    /// Prevents any CPU writes to the backing for the duration of the
    /// context. The buffer must be locked.
    pub fn block_all_cpu_backing_writes(&self) {
        self.state.lock().immutability = BackingImmutability::AllWrites;
    }

    pub fn sequenced_cpu_backing_writes_blocked(&self) -> bool {
        self.state.lock().immutability != BackingImmutability::None
    }

    pub fn all_cpu_backing_writes_blocked(&self) -> bool {
        self.state.lock().immutability == BackingImmutability::AllWrites
    }

    /// Whether the current cycle must be attached to the buffer before the
    /// context ends. Immutability is only ever entered when the backing is
    /// accessed on the GPU, so this mirrors
    /// [`Buffer::sequenced_cpu_backing_writes_blocked`].
    pub fn requires_cycle_attach(&self) -> bool {
        self.sequenced_cpu_backing_writes_blocked()
    }

    pub fn ever_had_inline_update(&self) -> bool {
        self.ever_had_inline_update.load(Ordering::Relaxed)
    }

    /// Replaces the tracked fence cycle, chaining the previous one so it is
    /// still waited transitively.
    pub fn update_cycle(&self, new_cycle: Arc<FenceCycle>) {
        let mut state = self.state.lock();
        if let Some(old) = state.cycle.take() {
            new_cycle.chain_cycle(old);
        }
        state.cycle = Some(new_cycle);
    }

    /// Waits on the tracked fence cycle, if any, and clears it.
    pub fn wait_on_fence(&self) {
        let mut state = self.state.lock();
        Self::wait_on_fence_locked(&mut state);
    }

    fn wait_on_fence_locked(state: &mut CoherencyState) {
        if let Some(cycle) = state.cycle.take() {
            cycle.wait();
        }
    }

    /// Polls the tracked fence cycle, clearing it if signalled. Returns
    /// whether the buffer is free of in-flight GPU work.
    pub fn poll_fence(&self) -> bool {
        let mut state = self.state.lock();
        Self::poll_fence_locked(&mut state)
    }

    fn poll_fence_locked(state: &mut CoherencyState) -> bool {
        let signalled = match &state.cycle {
            None => return true,
            Some(cycle) => cycle.poll(),
        };
        if signalled {
            state.cycle = None;
        }
        signalled
    }

    // --- sequence ----------------------------------------------------------

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Relaxed)
    }

    /// Increments the sequence number. Must be called after any modification
    /// of the backing contents (but not of the mirror).
    pub fn advance_sequence(&self) {
        self.sequence_number.fetch_add(1, Ordering::Relaxed);
    }

    /// Attempts to return the current sequence number and prepare the mirror
    /// for reads. A GPU dirty buffer gets a non-blocking guest sync first;
    /// `(0, empty)` is returned if that cannot complete without blocking.
    /// Otherwise callers may cache the returned span for as long as the
    /// sequence number stays unchanged. No other state is touched.
    pub fn acquire_current_sequence(&self) -> (u64, ByteSpan) {
        if !self.synchronize_guest(false, true) {
            return (0, ByteSpan::empty());
        }
        (self.sequence_number(), self.mirror)
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.state.lock().dirty
    }

    // --- synchronization ---------------------------------------------------

    /// Propagates mirror contents to the backing if the buffer is CPU dirty.
    /// The buffer must be locked.
    pub fn synchronize_host(&self, skip_trap: bool) {
        let Some((_, trap)) = self.guest_mapping() else {
            return;
        };

        {
            let mut state = self.state.lock();
            if state.dirty != DirtyState::CpuDirty {
                return;
            }
            trace!(buffer = self.id, "synchronize host");
            state.dirty = DirtyState::Clean;
            Self::wait_on_fence_locked(&mut state);
            self.advance_sequence();
            if !skip_trap {
                self.arm_trap(trap, true);
            }
        }

        // The copy runs outside the state lock; the trap was rearmed first,
        // so a guest write racing the copy re-dirties the buffer.
        unsafe { self.backing.data.copy_from(self.mirror) };
    }

    fn synchronize_host_locked(&self, state: &mut CoherencyState, skip_trap: bool) {
        let Some((_, trap)) = self.guest_mapping() else {
            return;
        };
        if state.dirty != DirtyState::CpuDirty {
            return;
        }
        trace!(buffer = self.id, "synchronize host");
        state.dirty = DirtyState::Clean;
        Self::wait_on_fence_locked(state);
        self.advance_sequence();
        if !skip_trap {
            self.arm_trap(trap, true);
        }
        unsafe { self.backing.data.copy_from(self.mirror) };
    }

    /// Propagates backing contents to the mirror if the buffer is GPU dirty.
    ///
    /// Returns `false` if the buffer has no guest, or if `non_blocking` and
    /// the fence has not signalled yet; `true` otherwise. The buffer must be
    /// locked.
    pub fn synchronize_guest(&self, skip_trap: bool, non_blocking: bool) -> bool {
        let Some((_, trap)) = self.guest_mapping() else {
            return false;
        };

        {
            let mut state = self.state.lock();
            if !self.synchronize_guest_with_state(&mut state, non_blocking) {
                return state.dirty != DirtyState::GpuDirty;
            }
        }

        if !skip_trap {
            self.arm_trap(trap, true);
        }
        true
    }

    fn synchronize_guest_locked(
        &self,
        state: &mut CoherencyState,
        skip_trap: bool,
        non_blocking: bool,
    ) -> bool {
        let Some((_, trap)) = self.guest_mapping() else {
            return false;
        };
        if !self.synchronize_guest_with_state(state, non_blocking) {
            return state.dirty != DirtyState::GpuDirty;
        }
        if !skip_trap {
            self.arm_trap(trap, true);
        }
        true
    }

    /// Performs the guest sync under an already-held state lock. Returns
    /// whether a copy happened; when `false`, the dirty state tells whether
    /// the sync was unnecessary (not GPU dirty) or refused (fence pending).
    fn synchronize_guest_with_state(
        &self,
        state: &mut CoherencyState,
        non_blocking: bool,
    ) -> bool {
        if state.dirty != DirtyState::GpuDirty {
            return false;
        }
        if non_blocking && !Self::poll_fence_locked(state) {
            return false;
        }
        trace!(buffer = self.id, "synchronize guest");
        Self::wait_on_fence_locked(state);
        unsafe { self.mirror.copy_from(self.backing.data) };
        state.dirty = DirtyState::Clean;
        true
    }

    /// Synchronizes the guest immediately, flushing pending GPU work first
    /// when this context has already used the buffer within the execution
    /// (`is_first_usage` as returned from the tagged lock).
    pub fn synchronize_guest_immediate(&self, is_first_usage: bool, flush_host: impl FnOnce()) {
        if !is_first_usage {
            flush_host();
        }
        self.synchronize_guest(false, false);
    }

    fn synchronize_guest_immediate_locked(
        &self,
        state: &mut CoherencyState,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
    ) {
        if !is_first_usage {
            flush_host();
        }
        self.synchronize_guest_locked(state, false, false);
    }

    /// Marks the backing as modified on the GPU. The mirror becomes a stale
    /// copy to be refreshed on demand, the guest pages are released, and CPU
    /// writes to the backing are blocked for the rest of the context. The
    /// buffer must be locked, and this must be called after (not before) the
    /// buffer was synchronized to the GPU.
    pub fn mark_gpu_dirty(&self) {
        let Some((_, trap)) = self.guest_mapping() else {
            return;
        };

        // The state lock is held for the whole transition so fault handlers
        // never observe a half-applied GpuDirty state.
        let mut state = self.state.lock();
        if state.dirty == DirtyState::GpuDirty {
            return;
        }
        trace!(buffer = self.id, "mark gpu dirty");

        // Protect reads as well as writes before any synchronization, so
        // guest accesses from here on fault and resynchronize.
        self.arm_trap(trap, false);

        if state.dirty == DirtyState::CpuDirty {
            self.synchronize_host_locked(&mut state, true);
        }

        state.dirty = DirtyState::GpuDirty;
        if let (Some(traps), Some(handle)) = (self.traps.as_ref(), trap) {
            traps.page_out_regions(handle);
        }
        state.immutability = BackingImmutability::AllWrites;
        // The GPU will modify the backing contents.
        self.advance_sequence();
    }

    /// Removes the guest mapping and its trap. Pending and future sync
    /// operations become no-ops; views and delegates are unaffected. The
    /// buffer must be locked.
    pub fn invalidate(&self) {
        let mut mappings = self.mappings.lock();
        if let (Some(traps), Some(handle)) = (self.traps.as_ref(), mappings.trap.take()) {
            traps.delete_trap(handle);
        }
        mappings.guest = None;
    }

    fn arm_trap(&self, trap: Option<TrapHandle>, write_only: bool) {
        if let (Some(traps), Some(handle)) = (self.traps.as_ref(), trap) {
            traps.trap_regions(handle, write_only);
        }
    }

    // --- data access -------------------------------------------------------

    /// Reads `out.len()` bytes at `offset`, synchronizing from the GPU first
    /// if it holds the truth. The buffer must be locked.
    pub fn read(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        out: &mut [u8],
        offset: usize,
    ) {
        let mut state = self.state.lock();
        if state.dirty == DirtyState::GpuDirty {
            self.synchronize_guest_immediate_locked(&mut state, is_first_usage, flush_host);
        }
        unsafe { self.mirror.read_bytes_at(offset, out) };
    }

    /// Writes `data` at `offset`, falling back to a GPU-side copy when the
    /// backing is immutable for this context.
    ///
    /// Returns `true` when a GPU-side copy is required but `gpu_copy` was not
    /// provided; the caller must repeat the write with a callback. Always
    /// `false` otherwise. The buffer must be locked; guest-backed buffers
    /// only.
    pub fn write(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
        data: &[u8],
        offset: usize,
        gpu_copy: Option<&mut dyn FnMut()>,
    ) -> bool {
        self.advance_sequence();
        self.ever_had_inline_update.store(true, Ordering::Relaxed);

        // The state lock is held for the entire write: a dirty transition
        // partway through would let the CPU and GPU copies diverge.
        let mut state = self.state.lock();

        if state.dirty == DirtyState::GpuDirty {
            self.synchronize_guest_immediate_locked(&mut state, is_first_usage, flush_host);
        }

        let sequenced_writes_blocked = state.immutability != BackingImmutability::None;
        if state.dirty == DirtyState::CpuDirty && sequenced_writes_blocked {
            // The buffer is read in sequence on the GPU; push the mirror out
            // now so this write can be sequenced there in order.
            self.synchronize_host_locked(&mut state, false);
        }

        // The mirror always gets the bytes so CPU-side reads stay coherent.
        unsafe { self.mirror.write_bytes_at(offset, data) };

        if state.dirty == DirtyState::CpuDirty && !sequenced_writes_blocked {
            // The pending host sync at the execution boundary picks this up.
            return false;
        }

        if !sequenced_writes_blocked && Self::poll_fence_locked(&mut state) {
            // No in-flight GPU use of the backing; write it directly.
            unsafe { self.backing.data.write_bytes_at(offset, data) };
            return false;
        }

        match gpu_copy {
            Some(callback) => {
                trace!(buffer = self.id, offset, len = data.len(), "gpu inline copy");
                callback();
                false
            }
            // The caller must retry with a callback that sequences the copy
            // on the GPU.
            None => true,
        }
    }

    /// Returns the mirror span after synchronizing from the GPU if needed.
    /// The returned span must not be written to, and the buffer must stay
    /// locked while it is in use.
    pub fn read_only_backing_span(
        &self,
        is_first_usage: bool,
        flush_host: impl FnOnce(),
    ) -> ByteSpan {
        let mut state = self.state.lock();
        if state.dirty == DirtyState::GpuDirty {
            self.synchronize_guest_immediate_locked(&mut state, is_first_usage, flush_host);
        }
        self.mirror
    }

    // --- views -------------------------------------------------------------

    /// A view over `size` bytes of this buffer starting at `offset`. The
    /// buffer must be locked.
    pub fn view(&self, offset: usize, size: usize) -> BufferView {
        BufferView::new(self.delegate(), offset, size)
    }

    /// A view covering `mapping`, or `None` when the mapping is not fully
    /// contained in this buffer's guest region. The buffer must be locked.
    pub fn try_view(&self, mapping: ByteSpan) -> Option<BufferView> {
        let (guest, _) = self.guest_mapping()?;
        let offset = guest.offset_within(mapping)?;
        Some(self.view(offset, mapping.len()))
    }

    // --- megabuffering -----------------------------------------------------

    /// Stages `size` bytes at `offset` into the megabuffer, reusing the
    /// cached per-region allocation when it is still current for this
    /// execution and sequence. Returns `None` when megabuffering is not
    /// worthwhile or not possible. The buffer must be locked.
    pub fn try_megabuffer_view(
        &self,
        cycle: &Arc<FenceCycle>,
        allocator: &dyn MegaBufferAllocator,
        execution_number: u64,
        offset: usize,
        size: usize,
    ) -> Option<BufferBinding> {
        if !self.synchronize_guest(false, true) {
            // The buffer cannot be synced without blocking, so its contents
            // (and therefore the sequence) are indeterminate.
            return None;
        }

        let sequence_number = self.sequence_number();
        if !self.ever_had_inline_update()
            && sequence_number < self.megabuffer_config.frequently_synced_threshold
        {
            // Rarely synced and never inline-updated: staging would only add
            // copies without avoiding any GPU-side update.
            return None;
        }

        if size > self.megabuffer_config.disable_threshold {
            return None;
        }

        let mut table = self.megabuffer_table.lock();
        let shift = table.shift;
        let entry_idx = offset >> shift;
        let entry_base = entry_idx << shift;
        let view_offset = offset - entry_base;
        let entry = &mut table.entries[entry_idx];

        let covered = entry.allocation.as_ref().is_some_and(|allocation| {
            entry.execution_number == execution_number
                && entry.sequence_number == sequence_number
                && allocation.region.len() >= view_offset + size
        });
        if !covered {
            // Size with max(previous, requested) so a larger view following a
            // smaller one within the execution does not force yet another
            // staging pass.
            let previous = entry
                .allocation
                .as_ref()
                .map(|allocation| allocation.region.len())
                .unwrap_or(0);
            let staged_len = (view_offset + size).max(previous);
            let source = self.mirror.subspan(entry_base, staged_len);
            entry.allocation = Some(allocator.push(cycle, source, true));
            entry.execution_number = execution_number;
            entry.sequence_number = sequence_number;
        }

        let allocation = entry.allocation.as_ref()?;
        Some(BufferBinding {
            buffer: allocation.buffer,
            offset: allocation.offset + view_offset as u64,
            size,
        })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let trap = self.mappings.get_mut().trap.take();
        if let (Some(traps), Some(handle)) = (self.traps.as_ref(), trap) {
            traps.delete_trap(handle);
        }
        // Flush any GPU-side truth back to the guest before the backing goes
        // away; the mirror mapping itself is owned by the trap facility.
        self.synchronize_guest(true, false);
        self.wait_on_fence();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("backing", &self.backing.id)
            .field("mirror", &self.mirror)
            .field("aligned_mirror", &self.aligned_mirror)
            .field("dirty", &self.dirty_state())
            .field("sequence", &self.sequence_number())
            .finish()
    }
}
