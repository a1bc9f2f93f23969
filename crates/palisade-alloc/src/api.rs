//! Public allocator surface.
//!
//! The four classic primitives plus lifecycle and introspection, exposed
//! twice: as plain Rust functions and as `extern "C"` symbols for hosts
//! linking the staticlib. Failures never panic and never escape: they are
//! logged and converted to null returns (or no-ops), matching what a C
//! caller of a malloc family expects.

use crate::arena;
use crate::block::{self, WORD};
use crate::error::AllocError;
use crate::integrity;
use crate::shared::{self, Shared};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the allocator. Idempotent and cheap after the first call;
/// only required explicitly when the process plans to `fork()` before its
/// first allocation.
pub fn init() {
    shared::init();
}

/// Tear the allocator down. Only the creating process acts; leaked arenas
/// are reported with their block tables and allocation-site traces.
pub fn shutdown() {
    shared::shutdown();
}

// ---------------------------------------------------------------------------
// The four primitives
// ---------------------------------------------------------------------------

/// Allocate `size` bytes. Returns null when `size` is zero, the request
/// can never fit an arena, or the system is out of memory.
pub fn malloc(size: usize) -> *mut u8 {
    let shared = shared::init();
    if shared.is_null() {
        return std::ptr::null_mut();
    }
    unsafe { malloc_inner(shared, size) }
}

unsafe fn malloc_inner(shared: *mut Shared, mut size: usize) -> *mut u8 {
    if size == 0 {
        log::warn!(target: "palisade::api", "malloc: {}", AllocError::ZeroSize);
        return std::ptr::null_mut();
    }

    if !(*shared).guard_enabled && size % WORD != 0 {
        // Machine-word granularity when no page rounding will happen.
        size += WORD - size % WORD;
    }

    if size >= arena::max_payload_for((*shared).arena_bytes) {
        log::error!(
            target: "palisade::api",
            "malloc: {}",
            AllocError::RequestTooLarge(size)
        );
        return std::ptr::null_mut();
    }

    let _global = match (*shared).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::api", "malloc: cannot lock shared mutex: {}", e);
            return std::ptr::null_mut();
        }
    };

    if (*shared).arena_first.is_null() {
        match arena::create_with_fallback((*shared).arena_bytes, std::ptr::null_mut()) {
            Ok(first) => {
                (*shared).arena_first = first;
                (*shared).arena_count += 1;
            }
            Err(_) => return std::ptr::null_mut(),
        }
    }

    let mut tail = std::ptr::null_mut();
    let mut current = (*shared).arena_first;
    while !current.is_null() {
        if let Some(memory) = block::alloc_from_arena(current, size) {
            return memory;
        }
        tail = current;
        current = (*current).next;
    }

    // Every arena missed: append a fresh one and place there.
    let next = match arena::create_with_fallback((*shared).arena_bytes, tail) {
        Ok(next) => next,
        Err(_) => return std::ptr::null_mut(),
    };
    (*shared).arena_count += 1;
    block::alloc_from_arena(next, size).unwrap_or(std::ptr::null_mut())
}

/// Allocate a zero-initialized array of `nmemb` elements of `size` bytes.
/// A zero (or overflowing) total yields null.
pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            log::error!(
                target: "palisade::api",
                "calloc: element count {} times size {} overflows",
                nmemb,
                size
            );
            return std::ptr::null_mut();
        }
    };
    if total == 0 {
        log::warn!(target: "palisade::api", "calloc: {}", AllocError::ZeroSize);
        return std::ptr::null_mut();
    }
    let memory = malloc(total);
    if !memory.is_null() {
        unsafe { std::ptr::write_bytes(memory, 0, total) };
    }
    memory
}

/// Resize `ptr` to `size` bytes, preserving the prefix.
///
/// `realloc(null, n)` is `malloc(n)`; `realloc(p, 0)` is `free(p)` and
/// returns null. On failure the original block is left untouched. The new
/// block is always freshly placed; no in-place extension is attempted.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if size == 0 {
        if !ptr.is_null() {
            free(ptr);
        }
        return std::ptr::null_mut();
    }
    if ptr.is_null() {
        return malloc(size);
    }

    let shared = shared::init();
    if shared.is_null() {
        return std::ptr::null_mut();
    }

    // How many bytes are readable behind `ptr`? With guard pages on, the
    // user region is a suffix of the block payload, so clamp to what sits
    // between `ptr` and the block end or the copy would run into a guard.
    let available = unsafe {
        let _global = match (*shared).mutex.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::error!(target: "palisade::api", "realloc: cannot lock shared mutex: {}", e);
                return std::ptr::null_mut();
            }
        };
        let owner = arena::find_owner(shared, ptr);
        if owner.is_null() {
            log::error!(
                target: "palisade::api",
                "realloc: {}",
                AllocError::BadPointer(ptr as usize)
            );
            return std::ptr::null_mut();
        }
        let header = block::header_from_user(shared, ptr);
        if (header as usize) < arena::first_block(owner) as usize {
            log::error!(
                target: "palisade::api",
                "realloc: {}",
                AllocError::BadPointer(ptr as usize)
            );
            return std::ptr::null_mut();
        }
        if !(*header).checks_ok() {
            log::error!(
                target: "palisade::api",
                "realloc: wrong checksum at 0x{:012x}",
                ptr as usize
            );
            integrity::dump("realloc", owner, "block header checksum mismatch");
            return std::ptr::null_mut();
        }
        block::payload(header) as usize + (*header).size - ptr as usize
    };

    let fresh = malloc(size);
    if fresh.is_null() {
        return std::ptr::null_mut();
    }
    unsafe {
        std::ptr::copy_nonoverlapping(ptr, fresh, available.min(size));
    }
    free(ptr);
    fresh
}

/// Release `ptr`. Null is a no-op; pointers outside every arena and
/// double frees are reported and ignored.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        log::warn!(target: "palisade::api", "free: pointer is null");
        return;
    }
    let shared = shared::init();
    if shared.is_null() {
        return;
    }
    unsafe { block::release(shared, ptr) };
}

// ---------------------------------------------------------------------------
// Fork hooks
// ---------------------------------------------------------------------------

/// Attach the calling process to the guard propagation protocol. A forked
/// child must call this before its first allocation; without the
/// `propagate` feature it is a no-op kept for ABI parity.
pub fn start_child_guard() {
    #[cfg(feature = "propagate")]
    {
        let shared = shared::init();
        if !shared.is_null() && unsafe { (*shared).guard_enabled } {
            let _ = unsafe { crate::propagate::register_self(shared) };
        }
    }
}

/// Detach the calling process from the propagation protocol, stopping its
/// supervisor and clearing its registry slot.
pub fn stop_child_guard() {
    #[cfg(feature = "propagate")]
    {
        let shared = shared::ptr();
        if !shared.is_null() && unsafe { (*shared).guard_enabled } {
            unsafe { crate::propagate::unregister_self(shared) };
        }
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Number of live arenas.
pub fn arena_count() -> usize {
    let shared = shared::ptr();
    if shared.is_null() {
        return 0;
    }
    unsafe {
        match (*shared).mutex.lock() {
            Ok(_guard) => (*shared).arena_count,
            Err(_) => 0,
        }
    }
}

/// Byte size of a standard arena.
pub fn arena_size() -> usize {
    let shared = shared::init();
    if shared.is_null() {
        return 0;
    }
    unsafe { (*shared).arena_bytes }
}

/// Active guard back-end: "disabled", "classic" or "pkey".
pub fn guard_status() -> &'static str {
    crate::guard::status()
}

/// Render the block table of every arena, the same table the integrity
/// dumps print.
pub fn report() -> String {
    let shared = shared::ptr();
    if shared.is_null() {
        return String::new();
    }
    let mut out = String::new();
    unsafe {
        let _global = match (*shared).mutex.lock() {
            Ok(guard) => guard,
            Err(_) => return out,
        };
        let mut arena = (*shared).arena_first;
        while !arena.is_null() {
            match (*arena).mutex.lock() {
                Ok(_guard) => integrity::render(arena, &mut out),
                Err(e) => {
                    log::error!(target: "palisade::api", "report: cannot lock arena: {}", e);
                }
            }
            arena = (*arena).next;
        }
    }
    out
}

/// Run the integrity checker over every arena. `true` when every chain
/// holds its invariants (or no arena exists).
pub fn verify() -> bool {
    let shared = shared::ptr();
    if shared.is_null() {
        return true;
    }
    unsafe {
        let _global = match (*shared).mutex.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let mut arena = (*shared).arena_first;
        while !arena.is_null() {
            let ok = match (*arena).mutex.lock() {
                Ok(_guard) => integrity::check("verify", arena).is_ok(),
                Err(_) => false,
            };
            if !ok {
                return false;
            }
            arena = (*arena).next;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// C ABI
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn palisade_init() {
    init();
}

#[no_mangle]
pub extern "C" fn palisade_shutdown() {
    shutdown();
}

#[no_mangle]
pub extern "C" fn palisade_malloc(size: usize) -> *mut u8 {
    malloc(size)
}

#[no_mangle]
pub extern "C" fn palisade_calloc(nmemb: usize, size: usize) -> *mut u8 {
    calloc(nmemb, size)
}

#[no_mangle]
pub extern "C" fn palisade_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    realloc(ptr, size)
}

#[no_mangle]
pub extern "C" fn palisade_free(ptr: *mut u8) {
    free(ptr);
}

#[no_mangle]
pub extern "C" fn palisade_child_start() {
    start_child_guard();
}

#[no_mangle]
pub extern "C" fn palisade_child_stop() {
    stop_child_guard();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
