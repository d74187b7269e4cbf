//! Guest fault handling under contention: the write trap must refuse to
//! block on a held buffer lock and instead ask the trap facility to retry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use argon_gpu_buffer::DirtyState;
use common::Harness;
use pretty_assertions::assert_eq;

#[test]
fn guest_write_sets_cpu_dirty_through_the_trap() {
    let harness = Harness::new();
    let (buffer, guest) = harness.guest_buffer(0x1000);

    buffer.lock();
    buffer.write(true, || {}, &[0x10; 16], 0, None);
    buffer.synchronize_host(false);
    assert_eq!(buffer.dirty_state(), DirtyState::Clean);
    buffer.unlock();

    // The host sync armed the write trap; a guest write faults and marks the
    // buffer CPU dirty before the bytes land in the (aliased) mirror.
    let retries = harness
        .traps
        .guest_write(guest.subspan(0, 4), &[1, 2, 3, 4])
        .unwrap();
    assert_eq!(retries, 0, "uncontended fault needs no retries");
    assert_eq!(buffer.dirty_state(), DirtyState::CpuDirty);

    buffer.lock();
    let mut out = [0u8; 4];
    buffer.read(true, || {}, &mut out, 0);
    assert_eq!(out, [1, 2, 3, 4]);
    buffer.unlock();
}

#[test]
fn contended_write_trap_retries_until_the_lock_is_released() {
    let harness = Harness::new();
    let (buffer, guest) = harness.guest_buffer(0x1000);

    // Leave the buffer GPU dirty so the write trap has to take the full
    // buffer lock to pull the backing contents back.
    buffer.lock();
    buffer.synchronize_host(false);
    buffer.mark_gpu_dirty();
    buffer.unlock();
    harness.gpu_write(&buffer, 0, &[0x5A; 16]);

    // A GPU submission context holds the buffer lock while the guest writes.
    buffer.lock();

    let writer = {
        let traps = Arc::clone(&harness.traps);
        let region = guest.subspan(0, 4);
        std::thread::spawn(move || traps.guest_write(region, &[1, 2, 3, 4]))
    };

    // Hold the lock until the trap has demonstrably been asked to retry.
    while harness.traps.retry_events() < 3 {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!writer.is_finished(), "trap cannot complete while the lock is held");
    buffer.unlock();

    let retries = writer.join().unwrap().unwrap();
    assert!(retries >= 3);

    // The trap pulled the backing back, then recorded the CPU write.
    assert_eq!(buffer.dirty_state(), DirtyState::CpuDirty);
    buffer.lock();
    let mut out = [0u8; 8];
    buffer.read(true, || {}, &mut out, 0);
    assert_eq!(out[..4], [1, 2, 3, 4], "guest bytes visible after the fault");
    assert_eq!(out[4..], [0x5A; 4], "remaining bytes came from the backing");
    buffer.unlock();
}

#[test]
fn guest_write_stalls_behind_all_writes_blocked() {
    let harness = Harness::new();
    let (buffer, guest) = harness.guest_buffer(0x1000);

    buffer.lock();
    buffer.write(true, || {}, &[0xCC; 8], 0, None);
    buffer.synchronize_host(false);
    buffer.block_all_cpu_backing_writes();

    let writer = {
        let traps = Arc::clone(&harness.traps);
        let region = guest.subspan(0, 2);
        std::thread::spawn(move || traps.guest_write(region, &[7, 7]))
    };

    // The preempt callback parks the guest thread on the buffer lock while
    // backing writes are blocked for this context.
    std::thread::sleep(Duration::from_millis(30));
    assert!(!writer.is_finished(), "guest write stalls until the context ends");

    buffer.unlock();
    writer.join().unwrap().unwrap();
    assert_eq!(buffer.dirty_state(), DirtyState::CpuDirty);

    buffer.lock();
    let mut out = [0u8; 2];
    buffer.read(true, || {}, &mut out, 0);
    assert_eq!(out, [7, 7]);
    buffer.unlock();
}

#[test]
fn guest_read_of_gpu_dirty_buffer_synchronizes_in_the_fault() {
    let harness = Harness::new();
    let (buffer, guest) = harness.guest_buffer(0x1000);

    buffer.lock();
    buffer.synchronize_host(false);
    buffer.mark_gpu_dirty();
    buffer.unlock();
    harness.gpu_write(&buffer, 0, &[0xB4; 16]);

    // The guest pages were paged out; the read faults, the read trap pulls
    // the backing into the mirror, and the access proceeds.
    let mut out = [0u8; 16];
    harness.traps.guest_read(guest.subspan(0, 16), &mut out).unwrap();
    assert_eq!(out, [0xB4; 16]);
    assert_eq!(buffer.dirty_state(), DirtyState::Clean);
}
