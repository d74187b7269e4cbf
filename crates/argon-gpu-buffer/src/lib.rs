//! `argon-gpu-buffer` keeps guest-visible memory regions coherent with their
//! GPU-backed counterparts for the Argon GPU emulation layer.
//!
//! The crate provides:
//! - [`Buffer`]: one guest region mirrored by one GPU-visible backing, with a
//!   dirty-state machine driven by memory-protection traps on the guest side
//!   and fence cycles on the GPU side.
//! - [`BufferView`]/[`BufferDelegate`]: stable handles into buffers that
//!   transparently follow buffer merges via lock-then-recheck acquisition.
//! - [`Buffer::try_megabuffer_view`] and [`MegaBufferRing`]: staging of small
//!   buffer fragments into a shared upload buffer, with a per-buffer lookup
//!   table that caches staged copies per execution and sequence.
//! - Trait contracts for the collaborators the emulator wires in
//!   ([`HostAllocator`], [`TrapFacility`], [`MegaBufferAllocator`]) plus
//!   software implementations used by tests and headless runs.

mod backing;
mod buffer;
mod delegate;
mod fence;
mod megabuffer;
mod span;
mod tag;
mod trap;
mod view;

pub use backing::{Backing, BackingId, HostAllocator, SystemAllocator};
pub use buffer::{
    BackingImmutability, Buffer, BufferBinding, DirtyState, INITIAL_SEQUENCE_NUMBER,
};
pub use delegate::BufferDelegate;
pub use fence::FenceCycle;
pub use megabuffer::{
    Allocation, MegaBufferAllocator, MegaBufferConfig, MegaBufferRing, RingStats,
};
pub use span::{align_down, align_up, ByteSpan, PAGE_SIZE};
pub use tag::ContextTag;
pub use trap::{Protection, SoftTraps, TrapCallbacks, TrapError, TrapFacility, TrapHandle};
pub use view::BufferView;
