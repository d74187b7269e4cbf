//! Shared fixture standing in for the emulator around the coherency core:
//! a host allocator playing the device, soft traps playing the MMU, and a
//! helper that mutates backings the way the GPU would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argon_gpu_buffer::{
    Buffer, ByteSpan, MegaBufferConfig, SoftTraps, SystemAllocator, TrapFacility,
};

pub struct Harness {
    pub allocator: Arc<SystemAllocator>,
    pub traps: Arc<SoftTraps>,
    next_id: AtomicU64,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(SystemAllocator::new()),
            traps: SoftTraps::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// A guest-backed buffer over freshly allocated guest pages, with traps
    /// installed.
    pub fn guest_buffer(&self, len: usize) -> (Arc<Buffer>, ByteSpan) {
        self.guest_buffer_with_config(len, MegaBufferConfig::default())
    }

    pub fn guest_buffer_with_config(
        &self,
        len: usize,
        config: MegaBufferConfig,
    ) -> (Arc<Buffer>, ByteSpan) {
        let guest = self.traps.allocate_guest_pages(len);
        let buffer = Buffer::new_guest(
            self.allocator.as_ref(),
            Arc::clone(&self.traps) as Arc<dyn TrapFacility>,
            config,
            guest,
            self.next_id.fetch_add(1, Ordering::Relaxed),
        );
        buffer.setup_guest_mappings();
        (buffer, guest)
    }

    /// Mutates the buffer's backing directly, playing the GPU's part.
    pub fn gpu_write(&self, buffer: &Buffer, offset: usize, data: &[u8]) {
        let span = self
            .allocator
            .span_of(buffer.backing_id())
            .expect("backing allocated by this harness");
        unsafe { span.write_bytes_at(offset, data) };
    }

    /// Reads the buffer's backing directly, bypassing the mirror.
    pub fn gpu_read(&self, buffer: &Buffer, offset: usize, len: usize) -> Vec<u8> {
        let span = self
            .allocator
            .span_of(buffer.backing_id())
            .expect("backing allocated by this harness");
        let mut out = vec![0u8; len];
        unsafe { span.read_bytes_at(offset, &mut out) };
        out
    }
}
