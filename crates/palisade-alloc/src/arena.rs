//! Arena manager.
//!
//! An arena is one anonymous shared mapping, headed by [`ArenaHeader`] and
//! carved into a doubly-linked chain of blocks that always covers the
//! payload end to end. Arenas themselves form a doubly-linked list hanging
//! off the shared record.
//!
//! Creation falls back once to a tenth of the requested size when the
//! kernel refuses the mapping; destruction requires the arena to be wholly
//! free again (a single spanning FREE block).

use crate::block::{BlockHeader, CHECK_BYTE, STATUS_FREE};
use crate::error::AllocError;
use crate::shared::{self, Shared};
use crate::sync::SharedMutex;

// ---------------------------------------------------------------------------
// ArenaHeader
// ---------------------------------------------------------------------------

/// In-band header at the start of every arena mapping.
///
/// In guard builds the header pads to exactly one page so the first block
/// header (and with it every protect region) starts page-aligned.
#[repr(C)]
#[cfg_attr(feature = "guard", repr(align(4096)))]
pub struct ArenaHeader {
    pub check_start: u8,
    /// Total mapping size in bytes, header included.
    pub size: usize,
    /// Largest single allocation this arena can hold.
    pub max_payload: usize,
    /// Number of live (BUSY) blocks inside.
    pub elements: usize,
    /// Guards this arena's block chain.
    pub mutex: SharedMutex,
    pub prev: *mut ArenaHeader,
    pub next: *mut ArenaHeader,
    pub check_end: u8,
}

#[cfg(feature = "guard")]
const _: () = assert!(std::mem::size_of::<ArenaHeader>() == crate::config::PAGE_SIZE);

impl ArenaHeader {
    /// Both check bytes intact.
    pub fn checks_ok(&self) -> bool {
        self.check_start == CHECK_BYTE && self.check_end == CHECK_BYTE
    }

    /// Bytes available for block headers plus payloads.
    pub fn payload_bytes(&self) -> usize {
        self.size - std::mem::size_of::<ArenaHeader>()
    }
}

/// Largest single allocation for an arena of `arena_bytes` total size.
pub fn max_payload_for(arena_bytes: usize) -> usize {
    arena_bytes - std::mem::size_of::<ArenaHeader>() - std::mem::size_of::<BlockHeader>()
}

/// First block header in the chain, immediately after the arena header.
pub unsafe fn first_block(arena: *mut ArenaHeader) -> *mut BlockHeader {
    (arena as *mut u8).add(std::mem::size_of::<ArenaHeader>()) as *mut BlockHeader
}

// ---------------------------------------------------------------------------
// Creation / destruction
// ---------------------------------------------------------------------------

/// Map and initialize a new arena of `bytes` total size, appended after
/// `tail` (which may be null for the first arena).
///
/// # Safety
///
/// Caller holds the global mutex; `tail` is the current list tail or null.
pub unsafe fn create(bytes: usize, tail: *mut ArenaHeader) -> Result<*mut ArenaHeader, AllocError> {
    let arena = shared::map_shared(bytes) as *mut ArenaHeader;
    if arena.is_null() {
        return Err(AllocError::OutOfMemory);
    }

    if let Err(e) = (*arena).mutex.init() {
        log::error!(target: "palisade::arena", "arena mutex init failed: {}", e);
        shared::unmap(arena as *mut u8, bytes);
        return Err(AllocError::Lock(e));
    }

    let guard = match (*arena).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::arena", "cannot lock fresh arena: {}", e);
            let _ = (*arena).mutex.destroy();
            shared::unmap(arena as *mut u8, bytes);
            return Err(AllocError::Lock(e));
        }
    };

    (*arena).size = bytes;
    (*arena).max_payload = max_payload_for(bytes);
    (*arena).elements = 0;
    (*arena).prev = tail;
    (*arena).next = std::ptr::null_mut();
    if !tail.is_null() {
        (*tail).next = arena;
    }
    (*arena).check_start = CHECK_BYTE;
    (*arena).check_end = CHECK_BYTE;

    // The initial chain is a single FREE block spanning the whole payload.
    let first = first_block(arena);
    (*first).size = (*arena).max_payload;
    (*first).status = STATUS_FREE;
    (*first).arena = arena;
    (*first).prev = std::ptr::null_mut();
    (*first).next = std::ptr::null_mut();
    (*first).check_start = CHECK_BYTE;
    (*first).check_end = CHECK_BYTE;
    #[cfg(feature = "stacktrace")]
    {
        (*first).trace_len = 0;
    }
    crate::guard::protect(first);

    drop(guard);

    log::debug!(
        target: "palisade::arena",
        "new arena at 0x{:012x} (size: {} KB)",
        arena as usize,
        bytes / 1024
    );
    Ok(arena)
}

/// [`create`] with the one-shot fallback to a tenth of the size.
///
/// # Safety
///
/// Same contract as [`create`].
pub unsafe fn create_with_fallback(
    bytes: usize,
    tail: *mut ArenaHeader,
) -> Result<*mut ArenaHeader, AllocError> {
    match create(bytes, tail) {
        Ok(arena) => Ok(arena),
        Err(AllocError::OutOfMemory) => {
            log::warn!(
                target: "palisade::arena",
                "arena mapping of {} bytes failed; retrying at a tenth",
                bytes
            );
            // Keep the retry page-aligned: block geometry (and the guard
            // offset rule) relies on page-multiple arena sizes.
            let fallback =
                (bytes / 10 / crate::config::PAGE_SIZE * crate::config::PAGE_SIZE)
                    .max(4 * crate::config::PAGE_SIZE);
            create(fallback, tail).map_err(|e| {
                log::error!(
                    target: "palisade::arena",
                    "cannot get enough memory for an arena: {}",
                    e
                );
                e
            })
        }
        Err(e) => Err(e),
    }
}

/// Unmap a wholly-free arena and drop it from the shared bookkeeping.
///
/// # Safety
///
/// Caller holds the global mutex, has already unlinked `arena` from its
/// neighbors, holds no lock on `arena` itself, and guarantees
/// `(*arena).elements == 0`.
pub unsafe fn destroy(shared: *mut Shared, arena: *mut ArenaHeader) {
    log::debug!(
        target: "palisade::arena",
        "unmapping arena at 0x{:012x} (size: {} KB)",
        arena as usize,
        (*arena).size / 1024
    );

    if let Err(e) = (*arena).mutex.destroy() {
        log::error!(target: "palisade::arena", "arena mutex destroy failed: {}", e);
    }

    (*shared).arena_count -= 1;
    if (*shared).arena_first == arena {
        (*shared).arena_first = (*arena).next;
    }

    let bytes = (*arena).size;
    shared::unmap(arena as *mut u8, bytes);
}

/// The arena whose address range contains `ptr`, or null.
///
/// # Safety
///
/// Caller holds the global mutex.
pub unsafe fn find_owner(shared: *mut Shared, ptr: *const u8) -> *mut ArenaHeader {
    let addr = ptr as usize;
    let mut arena = (*shared).arena_first;
    while !arena.is_null() {
        let start = arena as usize;
        if addr > start && addr < start + (*arena).size {
            return arena;
        }
        arena = (*arena).next;
    }
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;

    #[test]
    fn test_create_initializes_single_spanning_free_block() {
        unsafe {
            let arena = create(64 * 1024, std::ptr::null_mut()).expect("create");
            assert!((*arena).checks_ok());
            assert_eq!((*arena).elements, 0);
            assert_eq!((*arena).size, 64 * 1024);
            assert!((*arena).prev.is_null());
            assert!((*arena).next.is_null());

            let first = first_block(arena);
            assert!((*first).is_free());
            assert!((*first).checks_ok());
            assert_eq!((*first).size, (*arena).max_payload);
            assert!((*first).prev.is_null());
            assert!((*first).next.is_null());

            // Chain covers the payload exactly.
            assert_eq!(
                std::mem::size_of::<block::BlockHeader>() + (*first).size,
                (*arena).payload_bytes()
            );

            let _ = (*arena).mutex.destroy();
            crate::shared::unmap(arena as *mut u8, 64 * 1024);
        }
    }

    #[test]
    fn test_create_links_after_tail() {
        unsafe {
            let a = create(64 * 1024, std::ptr::null_mut()).expect("a");
            let b = create(64 * 1024, a).expect("b");
            assert_eq!((*a).next, b);
            assert_eq!((*b).prev, a);
            assert!((*b).next.is_null());

            let _ = (*a).mutex.destroy();
            let _ = (*b).mutex.destroy();
            crate::shared::unmap(a as *mut u8, 64 * 1024);
            crate::shared::unmap(b as *mut u8, 64 * 1024);
        }
    }

    #[test]
    fn test_max_payload_accounts_for_both_headers() {
        let bytes = 256 * 1024;
        assert_eq!(
            max_payload_for(bytes),
            bytes
                - std::mem::size_of::<ArenaHeader>()
                - std::mem::size_of::<block::BlockHeader>()
        );
    }
}
