//! Views and delegates across buffer migration: lock-then-recheck, delegate
//! chain flattening, and the re-entrant tagged lock through views.

mod common;

use std::sync::Arc;

use argon_gpu_buffer::{ContextTag, DirtyState};
use common::Harness;
use pretty_assertions::assert_eq;

#[test]
fn view_reads_and_writes_apply_its_offset() {
    let harness = Harness::new();
    let (buffer, _guest) = harness.guest_buffer(4096);

    buffer.lock();
    let view = buffer.view(256, 64);
    buffer.unlock();

    let mut view = view;
    view.lock();
    assert!(Arc::ptr_eq(&view.buffer(), &buffer));
    assert_eq!(view.offset(), 256);

    view.write(true, || {}, &[0xF0; 16], 8, None);
    let mut out = [0u8; 16];
    view.read(true, || {}, &mut out, 8);
    assert_eq!(out, [0xF0; 16]);
    view.unlock();

    // The bytes landed at the view offset within the buffer.
    buffer.lock();
    let mut out = [0u8; 16];
    buffer.read(true, || {}, &mut out, 264);
    assert_eq!(out, [0xF0; 16]);
    buffer.unlock();
}

#[test]
fn typed_view_access_round_trips() {
    let harness = Harness::new();
    let (buffer, _guest) = harness.guest_buffer(4096);

    buffer.lock();
    let view = buffer.view(0, 64);
    view.write_val::<u64>(true, || {}, &0xDEAD_BEEF_CAFE_F00D, 16, None);
    let value: u64 = view.read_val(true, || {}, 16);
    assert_eq!(value, 0xDEAD_BEEF_CAFE_F00D);
    buffer.unlock();
}

#[test]
fn locking_a_view_follows_a_migrated_delegate() {
    let harness = Harness::new();
    let (source, _) = harness.guest_buffer(4096);
    let (replacement, _) = harness.guest_buffer(8192);

    source.lock();
    let mut view = source.view(128, 64);
    source.unlock();

    // The manager merges `source` into `replacement` at offset 64 while the
    // view is not holding its lock.
    source.lock();
    replacement.lock();
    source.delegate().link(replacement.delegate(), 64);
    replacement.unlock();
    source.unlock();

    view.lock();
    assert!(
        Arc::ptr_eq(&view.buffer(), &replacement),
        "the view resolves to the replacement buffer"
    );
    assert_eq!(view.offset(), 128 + 64);

    // Stable across repeated queries while the lock is held.
    assert!(Arc::ptr_eq(&view.buffer(), &view.buffer()));
    view.unlock();
}

#[test]
fn delegate_chains_accumulate_offsets_and_flatten() {
    let harness = Harness::new();
    let (first, _) = harness.guest_buffer(4096);
    let (second, _) = harness.guest_buffer(8192);
    let (third, _) = harness.guest_buffer(8192);

    let mut view = {
        first.lock();
        let view = first.view(16, 32);
        first.unlock();
        view
    };

    first.lock();
    second.lock();
    first.delegate().link(second.delegate(), 64);
    third.lock();
    second.delegate().link(third.delegate(), 32);
    third.unlock();
    second.unlock();
    first.unlock();

    view.lock();
    assert!(Arc::ptr_eq(&view.buffer(), &third));
    assert_eq!(view.offset(), 16 + 64 + 32);
    view.unlock();

    // The chain was flattened on lock; the terminal delegate stays unlinked.
    assert!(first.delegate().is_linked());
    assert!(!third.delegate().is_linked());
    assert_eq!(first.delegate().offset(), 96);

    // A clone taken before the flatten resolves identically.
    let mut clone = view.clone();
    clone.lock();
    assert_eq!(clone.offset(), 112);
    clone.unlock();
}

#[test]
#[should_panic(expected = "already linked")]
fn linking_a_linked_delegate_panics() {
    let harness = Harness::new();
    let (first, _) = harness.guest_buffer(4096);
    let (second, _) = harness.guest_buffer(4096);
    let (third, _) = harness.guest_buffer(4096);

    first.delegate().link(second.delegate(), 0);
    first.delegate().link(third.delegate(), 0);
}

#[test]
fn try_lock_fails_fast_under_contention() {
    let harness = Harness::new();
    let (buffer, _guest) = harness.guest_buffer(4096);

    buffer.lock();
    let mut view = buffer.view(0, 16);

    let contender = {
        let mut view = view.clone();
        std::thread::spawn(move || view.try_lock())
    };
    assert!(!contender.join().unwrap(), "try_lock fails without retrying");
    buffer.unlock();

    assert!(view.try_lock());
    view.unlock();
}

#[test]
fn tagged_lock_through_views_is_reentrant_by_identity() {
    let harness = Harness::new();
    let (buffer, _guest) = harness.guest_buffer(4096);
    let tag = ContextTag::allocate();

    buffer.lock();
    let mut first = buffer.view(0, 32);
    let mut second = buffer.view(64, 32);
    buffer.unlock();

    assert!(first.lock_with_tag(tag), "first use in the context locks");
    assert!(
        !second.lock_with_tag(tag),
        "same context re-enters without locking"
    );

    // One unlock releases the context's hold.
    first.unlock();
    assert!(buffer.try_lock());
    buffer.unlock();
}

#[test]
fn try_view_requires_containment_in_the_guest_mapping() {
    let harness = Harness::new();
    let (buffer, guest) = harness.guest_buffer(4096);

    buffer.lock();
    let inside = buffer.try_view(guest.subspan(512, 256)).expect("contained mapping");
    assert_eq!(inside.offset(), 512);
    assert_eq!(inside.size, 256);

    let foreign = harness.traps.allocate_guest_pages(0x1000);
    assert!(buffer.try_view(foreign.subspan(0, 16)).is_none());
    buffer.unlock();
}

#[test]
fn migrated_view_operations_hit_the_replacement_buffer() {
    let harness = Harness::new();
    let (source, _) = harness.guest_buffer(4096);
    let (replacement, _) = harness.guest_buffer(8192);

    source.lock();
    let mut view = source.view(0, 16);
    source.unlock();

    source.lock();
    replacement.lock();
    source.delegate().link(replacement.delegate(), 32);
    replacement.unlock();
    source.unlock();

    view.lock();
    view.write(true, || {}, &[0xAB; 16], 0, None);
    view.unlock();

    replacement.lock();
    let mut out = [0u8; 16];
    replacement.read(true, || {}, &mut out, 32);
    assert_eq!(out, [0xAB; 16]);
    assert_eq!(replacement.dirty_state(), DirtyState::CpuDirty);
    source.lock();
    assert_eq!(
        source.sequence_number(),
        1,
        "the migrated-away buffer saw no writes"
    );
    source.unlock();
    replacement.unlock();
}
