//! End-to-end allocator scenarios.
//!
//! These run against the real process-wide shared record, so every test
//! serializes on one mutex, starts from a quiescent allocator (no live
//! arenas) and must return it to that state before finishing.

use std::mem::size_of;
use std::sync::{Mutex, MutexGuard};

use palisade_alloc::arena::max_payload_for;
use palisade_alloc::block::BlockHeader;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn assert_quiescent() {
    assert!(palisade_alloc::verify(), "arena invariants violated");
    assert_eq!(palisade_alloc::arena_count(), 0, "arenas leaked by a test");
}

#[test]
fn test_two_allocations_share_one_arena_and_release_unmaps_it() {
    let _serial = serial();
    assert_quiescent();

    let a = palisade_alloc::malloc(10);
    let b = palisade_alloc::malloc(10);
    assert!(!a.is_null());
    assert!(!b.is_null());
    assert_eq!(palisade_alloc::arena_count(), 1);

    palisade_alloc::free(a);
    palisade_alloc::free(b);
    assert_quiescent();
}

// Exact-fit arithmetic below assumes word granularity; under guard pages
// sizes round to whole pages instead (covered by the guard layout test).
#[cfg(not(feature = "guard"))]
#[test]
fn test_filling_an_arena_spills_into_a_second() {
    let _serial = serial();
    assert_quiescent();

    let max = max_payload_for(palisade_alloc::arena_size());
    let header = size_of::<BlockHeader>();

    // Leave room for exactly one more small block.
    let hole = 256;
    let big = palisade_alloc::malloc(max - header - hole);
    assert!(!big.is_null());
    assert_eq!(palisade_alloc::arena_count(), 1);

    // Exactly fills the remaining hole: same arena, no split possible.
    let small = palisade_alloc::malloc(hole);
    assert!(!small.is_null());
    assert_eq!(palisade_alloc::arena_count(), 1);

    // Nothing left here: the next request opens a second arena.
    let spill = palisade_alloc::malloc(hole);
    assert!(!spill.is_null());
    assert_eq!(palisade_alloc::arena_count(), 2);

    palisade_alloc::free(spill);
    assert_eq!(palisade_alloc::arena_count(), 1);
    palisade_alloc::free(small);
    palisade_alloc::free(big);
    assert_quiescent();
}

#[test]
fn test_request_boundaries_around_the_arena_payload() {
    let _serial = serial();
    assert_quiescent();

    let max = max_payload_for(palisade_alloc::arena_size());
    let header = size_of::<BlockHeader>();

    // Exactly the payload: refused outright.
    assert!(palisade_alloc::malloc(max).is_null());

    // Payload minus one header: fits in a single arena.
    let p = palisade_alloc::malloc(max - header);
    assert!(!p.is_null());
    assert_eq!(palisade_alloc::arena_count(), 1);
    palisade_alloc::free(p);
    assert_quiescent();
}

#[test]
fn test_allocations_are_pairwise_disjoint_until_released() {
    let _serial = serial();
    assert_quiescent();

    let sizes = [1usize, 7, 64, 100, 512, 1024, 4000];
    let mut live: Vec<(usize, usize)> = Vec::new();
    for &size in &sizes {
        let p = palisade_alloc::malloc(size);
        assert!(!p.is_null());
        unsafe { std::ptr::write_bytes(p, (size % 251) as u8, size) };
        live.push((p as usize, size));
    }

    for (i, &(p, n)) in live.iter().enumerate() {
        for &(q, m) in live.iter().skip(i + 1) {
            assert!(p + n <= q || q + m <= p, "ranges overlap");
        }
    }

    // Every byte still carries its tag: nobody scribbled on anyone.
    for &(p, n) in &live {
        let tag = (n % 251) as u8;
        unsafe {
            for offset in 0..n {
                assert_eq!(*((p + offset) as *const u8), tag);
            }
        }
        palisade_alloc::free(p as *mut u8);
    }
    assert_quiescent();
}

#[test]
fn test_release_restores_prior_state() {
    let _serial = serial();
    assert_quiescent();

    // A keeper allocation pins the arena; churning another slot must not
    // grow anything.
    let keeper = palisade_alloc::malloc(128);
    assert!(!keeper.is_null());
    assert_eq!(palisade_alloc::arena_count(), 1);

    for _ in 0..100 {
        let p = palisade_alloc::malloc(64);
        assert!(!p.is_null());
        palisade_alloc::free(p);
        assert_eq!(palisade_alloc::arena_count(), 1);
    }
    assert!(palisade_alloc::verify());

    palisade_alloc::free(keeper);
    assert_quiescent();
}

#[test]
fn test_report_renders_live_blocks() {
    let _serial = serial();
    assert_quiescent();

    let p = palisade_alloc::malloc(100);
    assert!(!p.is_null());

    let report = palisade_alloc::report();
    assert!(report.contains("arena at 0x"));
    assert!(report.contains("BUSY"));
    assert!(report.contains("FREE"));
    assert!(report.contains("size busy......"));

    palisade_alloc::free(p);
    assert_quiescent();

    // With no arenas left the report is empty.
    assert!(palisade_alloc::report().is_empty());
}

#[test]
fn test_double_free_is_reported_and_ignored() {
    let _serial = serial();
    assert_quiescent();

    let keeper = palisade_alloc::malloc(32);
    let p = palisade_alloc::malloc(32);
    assert!(!p.is_null());
    palisade_alloc::free(p);

    // The second release must not corrupt anything or crash.
    palisade_alloc::free(p);
    assert!(palisade_alloc::verify());

    palisade_alloc::free(keeper);
    assert_quiescent();
}

#[test]
fn test_corrupted_check_byte_aborts_release() {
    let _serial = serial();
    assert_quiescent();

    let p = palisade_alloc::malloc(100);
    assert!(!p.is_null());
    unsafe {
        let shared = palisade_alloc::shared::ptr();
        let header = palisade_alloc::block::header_from_user(shared, p);

        (*header).check_end = 0;
        palisade_alloc::free(p);
        // Declined: the block is still BUSY and the arena still live.
        assert!(!(*header).is_free());
        assert_eq!(palisade_alloc::arena_count(), 1);

        (*header).check_end = palisade_alloc::block::CHECK_BYTE;
    }
    palisade_alloc::free(p);
    assert_quiescent();
}

// The overrun lands on the neighbor's header bytes only when no guard page
// sits in between; with guard pages the same write faults instead.
#[cfg(not(feature = "guard"))]
#[test]
fn test_overrun_into_neighbor_header_is_caught_on_its_release() {
    let _serial = serial();
    assert_quiescent();

    let a = palisade_alloc::malloc(100);
    let b = palisade_alloc::malloc(100);
    assert!(!a.is_null());
    assert!(!b.is_null());

    unsafe {
        let shared = palisade_alloc::shared::ptr();
        let block_a = palisade_alloc::block::header_from_user(shared, a);
        let block_b = palisade_alloc::block::header_from_user(shared, b);

        // One byte past a's (rounded) payload: the first byte of b's header.
        let overrun = a.add((*block_a).size);
        assert_eq!(overrun as usize, block_b as usize);
        *overrun = 0x00;

        palisade_alloc::free(b);
        // Declined with a checksum diagnostic; b stays BUSY.
        assert!(!(*block_b).is_free());

        (*block_b).check_start = palisade_alloc::block::CHECK_BYTE;
    }

    palisade_alloc::free(b);
    palisade_alloc::free(a);
    assert_quiescent();
}

#[cfg(feature = "guard")]
#[test]
fn test_guard_layout_places_user_end_on_page_boundary() {
    let _serial = serial();
    assert_quiescent();
    if palisade_alloc::guard_status() == "disabled" {
        // Page size mismatch on this machine; nothing to place.
        return;
    }

    for &n in &[1usize, 100, 4095, 4096, 5000] {
        let p = palisade_alloc::malloc(n);
        assert!(!p.is_null());
        // The user region ends exactly at the next protect page, so an
        // overrun of one byte would fault.
        assert_eq!((p as usize + n) % 4096, 0, "size {}", n);
        unsafe { std::ptr::write_bytes(p, 0x42, n) };
        palisade_alloc::free(p);
    }
    assert_quiescent();
}

#[test]
fn test_realloc_walks_sizes_preserving_content() {
    let _serial = serial();
    assert_quiescent();

    let mut p = palisade_alloc::malloc(8);
    assert!(!p.is_null());
    unsafe {
        for i in 0..8 {
            *p.add(i) = i as u8;
        }
    }

    for &size in &[32usize, 300, 2000, 16, 8] {
        p = palisade_alloc::realloc(p, size);
        assert!(!p.is_null());
        unsafe {
            for i in 0..8 {
                assert_eq!(*p.add(i), i as u8);
            }
        }
    }

    palisade_alloc::free(p);
    assert_quiescent();
}
