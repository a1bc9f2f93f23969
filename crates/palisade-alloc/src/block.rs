//! Intra-arena block allocator.
//!
//! Blocks are headered spans laid out contiguously inside an arena's
//! payload. Allocation walks the chain first-fit and splits the chosen FREE
//! block when the remainder can hold at least a header and one byte;
//! release flips the block back to FREE and merges it with FREE neighbors
//! so no two adjacent FREE blocks ever survive a release.
//!
//! ## Guard geometry
//!
//! In guard builds the block header occupies exactly two pages: the first
//! page is the protect region (made inaccessible for the life of the
//! header), the second holds the fields. Sizes round up to page multiples
//! and the user pointer is pushed forward so the user region ends exactly
//! at the next header's protect page: an overrun of even one byte faults.

use crate::arena::{self, ArenaHeader};
use crate::error::AllocError;
use crate::integrity;
use crate::shared::{self, Shared};
use crate::trace;

#[cfg(feature = "stacktrace")]
use crate::config::TRACE_DEPTH;

/// Check byte stored at both ends of every header.
pub const CHECK_BYTE: u8 = 0xAA;

/// Block states. Raw integers rather than an enum so a corrupted header can
/// never materialize an invalid discriminant when read back.
pub const STATUS_FREE: u32 = 0;
pub const STATUS_BUSY: u32 = 1;

/// Machine-word allocation granularity when guard pages are off.
pub const WORD: usize = std::mem::size_of::<usize>();

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// In-band header immediately preceding each block's payload.
#[repr(C)]
#[cfg_attr(feature = "guard", repr(align(4096)))]
pub struct BlockHeader {
    /// The guard page. Inaccessible from header creation (or reallocation
    /// of the block) until the header is absorbed or the block released.
    #[cfg(feature = "guard")]
    pub protect: [u8; crate::config::PAGE_SIZE],
    /// Protection key covering the guard page, 0 when none is held.
    #[cfg(feature = "guard-pkey")]
    pub pkey: i32,
    pub check_start: u8,
    /// Payload bytes owned by this block, header excluded.
    pub size: usize,
    /// `STATUS_FREE` or `STATUS_BUSY`.
    pub status: u32,
    /// Owning arena.
    pub arena: *mut ArenaHeader,
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
    pub check_end: u8,
    /// Number of captured return addresses.
    #[cfg(feature = "stacktrace")]
    pub trace_len: usize,
    /// Allocation-site return addresses, oldest caller last.
    #[cfg(feature = "stacktrace")]
    pub trace: [usize; TRACE_DEPTH],
}

#[cfg(feature = "guard")]
const _: () = assert!(std::mem::size_of::<BlockHeader>() == 2 * crate::config::PAGE_SIZE);

impl BlockHeader {
    pub fn is_free(&self) -> bool {
        self.status == STATUS_FREE
    }

    /// Both check bytes intact.
    pub fn checks_ok(&self) -> bool {
        self.check_start == CHECK_BYTE && self.check_end == CHECK_BYTE
    }
}

/// Start of a block's payload.
pub unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
    (block as *mut u8).add(std::mem::size_of::<BlockHeader>())
}

/// Recover the header from a pointer previously handed to the caller.
/// With guard pages active the user pointer sits somewhere inside the
/// first payload page, so mask down to the page boundary first.
pub unsafe fn header_from_user(shared: *mut Shared, ptr: *mut u8) -> *mut BlockHeader {
    let mut addr = ptr as usize;
    if (*shared).guard_enabled {
        addr &= !((*shared).page_size - 1);
    }
    (addr - std::mem::size_of::<BlockHeader>()) as *mut BlockHeader
}

fn round_up(value: usize, to: usize) -> usize {
    if value % to == 0 {
        value
    } else {
        (value / to + 1) * to
    }
}

// ---------------------------------------------------------------------------
// Allocation (first-fit + split)
// ---------------------------------------------------------------------------

/// Try to place `len` bytes inside `arena`. Returns the user pointer, or
/// `None` when no FREE block fits (or the arena failed its integrity
/// check, which is logged and treated as a miss so other arenas can still
/// serve the request).
///
/// # Safety
///
/// Caller holds the global mutex; `arena` is a live arena.
pub unsafe fn alloc_from_arena(arena: *mut ArenaHeader, len: usize) -> Option<*mut u8> {
    let _guard = match (*arena).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::block", "cannot lock arena: {}", e);
            return None;
        }
    };

    let mut block = arena::first_block(arena);
    while !block.is_null() {
        if (*block).is_free() && (*block).size >= len {
            break;
        }
        block = (*block).next;
    }
    if block.is_null() {
        return None;
    }

    if let Err(kind) = integrity::check("malloc", arena) {
        log::error!(
            target: "palisade::block",
            "arena unstable while allocating: {}",
            kind
        );
        return None;
    }

    let requested = len;
    let mut len = len;
    let guard_on = shared::guard_active();
    let page = if guard_on { (*shared::ptr()).page_size } else { WORD };
    if guard_on {
        len = round_up(len, page);
    }

    let header_size = std::mem::size_of::<BlockHeader>();
    let mut next = (*block).next;
    if (*block).size > len + header_size {
        // Split: the remainder becomes a fresh FREE block spliced in
        // behind the one we hand out.
        let remainder = (block as *mut u8).add(header_size + len) as *mut BlockHeader;
        (*remainder).arena = arena;
        (*remainder).size = (*block).size - len - header_size;
        (*remainder).status = STATUS_FREE;
        (*remainder).prev = block;
        (*remainder).next = next;
        (*remainder).check_start = CHECK_BYTE;
        (*remainder).check_end = CHECK_BYTE;
        #[cfg(feature = "stacktrace")]
        {
            (*remainder).trace_len = 0;
        }
        if !next.is_null() {
            (*next).prev = remainder;
        }
        crate::guard::protect(remainder);
        next = remainder;
    } else {
        // No room for a header plus at least one byte: the block keeps its
        // full original size and absorbs the slack.
        len = (*block).size;
    }

    (*arena).elements += 1;
    (*block).arena = arena;
    (*block).size = len;
    (*block).status = STATUS_BUSY;
    (*block).next = next;
    (*block).check_start = CHECK_BYTE;
    (*block).check_end = CHECK_BYTE;
    crate::guard::protect(block);
    trace::capture(block);

    let mut memory = payload(block);
    if guard_on {
        // Push the user region forward so it ends exactly at the next
        // header's protect page.
        memory = memory.add((page - requested % page) % page);
    }

    log::debug!(
        target: "palisade::block",
        "malloc {} bytes at 0x{:012x} (#{})",
        len,
        memory as usize,
        (*arena).elements
    );
    Some(memory)
}

// ---------------------------------------------------------------------------
// Release (coalescing free)
// ---------------------------------------------------------------------------

/// Absorb `block`'s FREE successor, if any.
///
/// # Safety
///
/// Caller holds the owning arena's mutex.
pub(crate) unsafe fn coalesce_forward(block: *mut BlockHeader) {
    let next = (*block).next;
    if !next.is_null() && (*next).is_free() {
        // The absorbed header's bytes become payload again.
        crate::guard::unprotect(next);
        (*block).size += (*next).size + std::mem::size_of::<BlockHeader>();
        (*block).next = (*next).next;
        if !(*next).next.is_null() {
            (*(*next).next).prev = block;
        }
    }
}

/// Fold `block` into its FREE predecessor, if any.
///
/// # Safety
///
/// Caller holds the owning arena's mutex.
pub(crate) unsafe fn coalesce_backward(block: *mut BlockHeader) {
    let prev = (*block).prev;
    if !prev.is_null() && (*prev).is_free() {
        crate::guard::unprotect(block);
        (*prev).size += (*block).size + std::mem::size_of::<BlockHeader>();
        (*prev).next = (*block).next;
        if !(*prev).next.is_null() {
            (*(*prev).next).prev = prev;
        }
    }
}

/// Release a user pointer: validate, flip to FREE, coalesce, and unmap the
/// arena if this emptied it.
///
/// # Safety
///
/// `shared` is the live shared record; no locks are held by the caller.
pub unsafe fn release(shared: *mut Shared, ptr: *mut u8) {
    let _global = match (*shared).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::block", "cannot lock shared mutex: {}", e);
            return;
        }
    };

    let owner = arena::find_owner(shared, ptr);
    if owner.is_null() {
        log::error!(
            target: "palisade::block",
            "{}",
            AllocError::BadPointer(ptr as usize)
        );
        return;
    }

    let block = header_from_user(shared, ptr);
    if (block as usize) < arena::first_block(owner) as usize {
        // Inside the arena but before any possible payload: the recovered
        // header would fall outside the mapping.
        log::error!(
            target: "palisade::block",
            "{}",
            AllocError::BadPointer(ptr as usize)
        );
        return;
    }

    if !(*block).checks_ok() {
        log::error!(
            target: "palisade::block",
            "wrong checksum in {} (at 0x{:012x})",
            if (*block).check_start != CHECK_BYTE { "check_start" } else { "check_end" },
            ptr as usize
        );
        integrity::dump("free", owner, "block header checksum mismatch");
        return;
    }

    if (*block).is_free() {
        log::error!(
            target: "palisade::block",
            "{}",
            AllocError::DoubleFree(ptr as usize)
        );
        integrity::dump("free", owner, "double free");
        return;
    }

    let arena = (*block).arena;
    if !(*arena).checks_ok() {
        log::error!(
            target: "palisade::block",
            "wrong checksum in arena header (at 0x{:012x})",
            arena as usize
        );
        integrity::dump("free", owner, "arena header checksum mismatch");
        return;
    }

    (*arena).elements = (*arena).elements.saturating_sub(1);
    log::debug!(
        target: "palisade::block",
        "free {} bytes at 0x{:012x} (#{})",
        (*block).size,
        ptr as usize,
        (*arena).elements
    );

    let arena_guard = match (*arena).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::block", "cannot lock arena: {}", e);
            return;
        }
    };

    if let Err(kind) = integrity::check("free", arena) {
        log::error!(
            target: "palisade::block",
            "arena unstable while freeing: {}",
            kind
        );
        return;
    }

    (*block).status = STATUS_FREE;
    crate::guard::unprotect(block);
    coalesce_forward(block);
    coalesce_backward(block);

    let first = arena::first_block(arena);
    if (*first).next.is_null() {
        // Whole arena is free again: unlink it and give the mapping back.
        if !(*arena).next.is_null() {
            match (*(*arena).next).mutex.lock() {
                Ok(neighbor) => {
                    (*(*arena).next).prev = (*arena).prev;
                    drop(neighbor);
                }
                Err(e) => {
                    log::error!(target: "palisade::block", "cannot lock next arena: {}", e);
                    return;
                }
            }
        }
        if !(*arena).prev.is_null() {
            match (*(*arena).prev).mutex.lock() {
                Ok(neighbor) => {
                    (*(*arena).prev).next = (*arena).next;
                    drop(neighbor);
                }
                Err(e) => {
                    log::error!(target: "palisade::block", "cannot lock prev arena: {}", e);
                    return;
                }
            }
        }
        drop(arena_guard);
        arena::destroy(shared, arena);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_BYTES: usize = 256 * 1024;

    unsafe fn test_arena() -> *mut ArenaHeader {
        arena::create(ARENA_BYTES, std::ptr::null_mut()).expect("arena")
    }

    unsafe fn drop_arena(a: *mut ArenaHeader) {
        let _ = (*a).mutex.destroy();
        crate::shared::unmap(a as *mut u8, ARENA_BYTES);
    }

    #[test]
    fn test_first_fit_splits_and_accounts() {
        unsafe {
            let a = test_arena();
            let p = alloc_from_arena(a, 100).expect("alloc");
            assert!(!p.is_null());
            assert_eq!((*a).elements, 1);

            let first = arena::first_block(a);
            assert!(!(*first).is_free());
            let remainder = (*first).next;
            assert!(!remainder.is_null());
            assert!((*remainder).is_free());
            assert_eq!((*remainder).prev, first);
            assert!((*remainder).next.is_null());

            // The chain still covers the payload exactly.
            assert!(integrity::check("test", a).is_ok());
            drop_arena(a);
        }
    }

    #[test]
    fn test_payload_is_writable_and_disjoint() {
        unsafe {
            let a = test_arena();
            let p = alloc_from_arena(a, 64).expect("p");
            let q = alloc_from_arena(a, 64).expect("q");
            assert_ne!(p, q);
            // User ranges must not overlap.
            let (lo, hi) = if p < q { (p, q) } else { (q, p) };
            assert!(lo.add(64) <= hi);
            std::ptr::write_bytes(p, 0x5A, 64);
            std::ptr::write_bytes(q, 0xA5, 64);
            assert_eq!(*p, 0x5A);
            assert_eq!(*q, 0xA5);
            drop_arena(a);
        }
    }

    #[test]
    fn test_absorbs_slack_when_remainder_cannot_hold_header() {
        unsafe {
            let a = test_arena();
            let max = (*a).max_payload;
            // Exactly the whole payload: no split possible.
            let p = alloc_from_arena(a, max).expect("whole-payload alloc");
            assert!(!p.is_null());
            let first = arena::first_block(a);
            assert_eq!((*first).size, max);
            assert!((*first).next.is_null());

            // And nothing else fits now.
            assert!(alloc_from_arena(a, 1).is_none());
            drop_arena(a);
        }
    }

    #[test]
    fn test_first_fit_prefers_earliest_hole() {
        unsafe {
            let a = test_arena();
            let _p1 = alloc_from_arena(a, 128).expect("p1");
            let _p2 = alloc_from_arena(a, 128).expect("p2");

            // Open a hole at the front of the chain.
            let first = arena::first_block(a);
            (*first).status = STATUS_FREE;

            // A request that fits the hole must land exactly in it.
            let p3 = alloc_from_arena(a, 64).expect("p3");
            let first = arena::first_block(a);
            assert!(!(*first).is_free());
            let start = payload(first) as usize;
            assert!(p3 as usize >= start);
            assert!((p3 as usize) < start + (*first).size);
            drop_arena(a);
        }
    }

    #[test]
    fn test_coalesce_forward_merges_free_successor() {
        unsafe {
            let a = test_arena();
            let _p1 = alloc_from_arena(a, 128).expect("p1");
            let _p2 = alloc_from_arena(a, 128).expect("p2");

            let b1 = arena::first_block(a);
            let b2 = (*b1).next;
            let tail = (*b2).next;

            (*b2).status = STATUS_FREE;
            (*b1).status = STATUS_FREE;
            let merged = (*b1).size + (*b2).size + std::mem::size_of::<BlockHeader>();
            coalesce_forward(b1);
            assert_eq!((*b1).size, merged);
            assert_eq!((*b1).next, tail);
            assert_eq!((*tail).prev, b1);
            assert!(integrity::check("test", a).is_ok());
            drop_arena(a);
        }
    }

    #[test]
    fn test_coalesce_backward_merges_free_predecessor() {
        unsafe {
            let a = test_arena();
            let _p1 = alloc_from_arena(a, 128).expect("p1");
            let _p2 = alloc_from_arena(a, 128).expect("p2");

            let b1 = arena::first_block(a);
            let b2 = (*b1).next;
            let tail = (*b2).next;

            (*b1).status = STATUS_FREE;
            (*b2).status = STATUS_FREE;
            let merged = (*b1).size + (*b2).size + std::mem::size_of::<BlockHeader>();
            coalesce_backward(b2);
            assert_eq!((*b1).size, merged);
            assert_eq!((*b1).next, tail);
            assert_eq!((*tail).prev, b1);
            assert!(integrity::check("test", a).is_ok());
            drop_arena(a);
        }
    }

    #[test]
    fn test_no_adjacent_free_blocks_after_full_merge() {
        unsafe {
            let a = test_arena();
            for _ in 0..4 {
                alloc_from_arena(a, 64).expect("alloc");
            }

            // Snapshot the four busy headers before any of them is absorbed.
            let mut headers = Vec::new();
            let mut block = arena::first_block(a);
            while !block.is_null() && !(*block).is_free() {
                headers.push(block);
                block = (*block).next;
            }
            assert_eq!(headers.len(), 4);

            // Release back to front, merging as a release would.
            for &b in headers.iter().rev() {
                (*b).status = STATUS_FREE;
                coalesce_forward(b);
                coalesce_backward(b);
            }

            let first = arena::first_block(a);
            assert!((*first).is_free());
            assert!((*first).next.is_null());
            assert_eq!((*first).size, (*a).max_payload);
            assert!(integrity::check("test", a).is_ok());
            drop_arena(a);
        }
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(13, 8), 16);
        assert_eq!(round_up(16, 8), 16);
    }
}
