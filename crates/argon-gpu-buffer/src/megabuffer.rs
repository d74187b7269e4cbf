//! Megabuffer staging for small buffer fragments.
//!
//! Inline GPU updates of buffer contents are expensive to sequence; staging
//! the bytes into a large shared upload buffer and binding a slice of it is
//! usually cheaper. This module provides the allocator contract the core
//! stages through, a chunked bump-allocator implementation, and the tuning
//! knobs for the per-buffer lookup table that caches staged copies.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::backing::{Backing, BackingId, HostAllocator};
use crate::fence::FenceCycle;
use crate::span::{align_up, ByteSpan};

/// A staged copy inside the megabuffer.
#[derive(Clone, Debug)]
pub struct Allocation {
    /// The megabuffer's GPU-visible buffer.
    pub buffer: BackingId,
    /// Byte offset of the staged copy inside that buffer.
    pub offset: u64,
    /// The staged copy itself.
    pub region: ByteSpan,
}

/// Allocates short-lived staged copies inside a large upload buffer.
pub trait MegaBufferAllocator: Send + Sync {
    /// Copies `source` into fresh megabuffer space and returns its location.
    /// The space is considered in use until `cycle` signals. `cacheable`
    /// marks allocations that callers intend to reuse across lookups within
    /// an execution.
    fn push(&self, cycle: &Arc<FenceCycle>, source: ByteSpan, cacheable: bool) -> Allocation;
}

/// Counters for megabuffer traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub pushes: u64,
    pub bytes: u64,
    pub cacheable_pushes: u64,
}

/// Minimum copy alignment inside the ring.
const RING_ALIGNMENT: usize = 4;

struct RingChunk {
    backing: Backing,
    cursor: usize,
}

struct RingState {
    chunks: Vec<RingChunk>,
    active: usize,
    /// Cycles guarding space handed out since the last reset.
    held: Vec<Arc<FenceCycle>>,
    stats: RingStats,
}

/// Chunked bump allocator over GPU-visible backings.
///
/// Space is never freed individually; [`MegaBufferRing::reset`] waits on the
/// cycles of everything handed out and recycles all chunks at once, which
/// matches the per-execution lifetime of staged copies.
pub struct MegaBufferRing {
    allocator: Arc<dyn HostAllocator>,
    chunk_size: usize,
    state: Mutex<RingState>,
}

impl MegaBufferRing {
    pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

    pub fn new(allocator: Arc<dyn HostAllocator>) -> Self {
        Self::with_chunk_size(allocator, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(allocator: Arc<dyn HostAllocator>, chunk_size: usize) -> Self {
        Self {
            allocator,
            chunk_size,
            state: Mutex::new(RingState {
                chunks: Vec::new(),
                active: 0,
                held: Vec::new(),
                stats: RingStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> RingStats {
        self.state.lock().stats
    }

    /// Waits for all work referencing ring space to complete, then recycles
    /// every chunk. Call at execution boundaries.
    pub fn reset(&self) {
        let held = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.held)
        };
        for cycle in held {
            cycle.wait();
        }
        let mut state = self.state.lock();
        for chunk in &mut state.chunks {
            chunk.cursor = 0;
        }
        state.active = 0;
    }
}

impl MegaBufferAllocator for MegaBufferRing {
    fn push(&self, cycle: &Arc<FenceCycle>, source: ByteSpan, cacheable: bool) -> Allocation {
        let mut state = self.state.lock();

        // Find (or allocate) a chunk with room for the copy.
        let needed = source.len();
        loop {
            if state.active >= state.chunks.len() {
                let size = self.chunk_size.max(needed);
                let backing = self.allocator.allocate_buffer(size);
                state.chunks.push(RingChunk { backing, cursor: 0 });
            }
            let chunk = &state.chunks[state.active];
            let offset = align_up(chunk.cursor, RING_ALIGNMENT);
            if offset + needed <= chunk.backing.data.len() {
                break;
            }
            state.active += 1;
        }

        let active = state.active;
        let chunk = &mut state.chunks[active];
        let offset = align_up(chunk.cursor, RING_ALIGNMENT);
        chunk.cursor = offset + needed;
        let region = chunk.backing.data.subspan(offset, needed);
        // The ring owns this range exclusively until reset, so the copy does
        // not race the GPU reading older allocations.
        unsafe { region.copy_from(source) };
        let allocation = Allocation {
            buffer: chunk.backing.id,
            offset: offset as u64,
            region,
        };

        state.held.push(Arc::clone(cycle));
        state.stats.pushes += 1;
        state.stats.bytes += needed as u64;
        if cacheable {
            state.stats.cacheable_pushes += 1;
        }
        allocation
    }
}

/// Tuning knobs for the per-buffer megabuffer lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MegaBufferConfig {
    /// Upper bound on table entries per buffer; the entry granularity grows
    /// with the buffer until this is met.
    pub table_max_entries: usize,
    /// Minimum granularity shift for table entries.
    pub table_shift_min: u32,
    /// Views larger than this are never megabuffered.
    pub disable_threshold: usize,
    /// Buffers that never saw an inline update are only staged once their
    /// sequence number reaches this, i.e. once they sync frequently enough
    /// for staging to pay off.
    pub frequently_synced_threshold: u64,
}

impl MegaBufferConfig {
    pub const DEFAULT_TABLE_MAX_ENTRIES: usize = 0x500;
    pub const DEFAULT_TABLE_SHIFT_MIN: u32 = 8;
    pub const DEFAULT_DISABLE_THRESHOLD: usize = 128 * 1024;
    pub const DEFAULT_FREQUENTLY_SYNCED_THRESHOLD: u64 = 6;

    /// Compiled defaults plus `ARGON_MEGABUFFER_*` environment overrides.
    /// Malformed values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_env_usize("ARGON_MEGABUFFER_TABLE_MAX_ENTRIES") {
            config.table_max_entries = v;
        }
        if let Some(v) = parse_env_usize("ARGON_MEGABUFFER_TABLE_SHIFT_MIN") {
            config.table_shift_min = v as u32;
        }
        if let Some(v) = parse_env_usize("ARGON_MEGABUFFER_DISABLE_THRESHOLD") {
            config.disable_threshold = v;
        }
        if let Some(v) = parse_env_usize("ARGON_MEGABUFFER_FREQUENTLY_SYNCED_THRESHOLD") {
            config.frequently_synced_threshold = v as u64;
        }
        config
    }

    /// The entry shift for a buffer of `guest_len` bytes: the smallest shift
    /// keeping the entry count within `table_max_entries`, clamped to
    /// `table_shift_min`.
    pub fn table_shift(&self, guest_len: usize) -> u32 {
        let per_entry = guest_len.div_ceil(self.table_max_entries.max(1)).max(1);
        let shift = per_entry.next_power_of_two().trailing_zeros();
        shift.max(self.table_shift_min)
    }

    /// Number of table entries for a buffer of `guest_len` bytes at `shift`.
    pub fn table_entries(guest_len: usize, shift: u32) -> usize {
        guest_len.div_ceil(1usize << shift)
    }
}

impl Default for MegaBufferConfig {
    fn default() -> Self {
        Self {
            table_max_entries: Self::DEFAULT_TABLE_MAX_ENTRIES,
            table_shift_min: Self::DEFAULT_TABLE_SHIFT_MIN,
            disable_threshold: Self::DEFAULT_DISABLE_THRESHOLD,
            frequently_synced_threshold: Self::DEFAULT_FREQUENTLY_SYNCED_THRESHOLD,
        }
    }
}

fn parse_env_usize(var: &'static str) -> Option<usize> {
    let raw = match std::env::var(var) {
        Ok(v) => v,
        Err(std::env::VarError::NotPresent) => return None,
        Err(std::env::VarError::NotUnicode(_)) => {
            warn!(env_var = var, "ignoring {var}: not valid unicode");
            return None;
        }
    };
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(env_var = var, value = %raw, error = %err, "ignoring {var}: not a valid integer");
            None
        }
    }
}
