//! The process-wide shared record.
//!
//! A single `Shared` struct lives in its own `MAP_SHARED | MAP_ANONYMOUS`
//! mapping, created by the first process that touches the allocator and
//! inherited by every forked child at the same address. It anchors the
//! arena list, the global mutex, the size policy, and (in propagate builds)
//! the peer registry.
//!
//! ## Initialization
//!
//! `init()` is idempotent and race-free; the public entry points call it on
//! every use, so explicit initialization is only required before forking.
//! Teardown is the creator's job: children exiting leave the record alone.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Once;

use crate::arena::ArenaHeader;
use crate::config::{config, PAGE_SIZE};
use crate::diag;
use crate::sync::SharedMutex;

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Process-wide allocator state, one instance per machine-wide allocator
/// "family" (creator plus forked children).
#[repr(C)]
pub struct Shared {
    /// Pid of the creating process; teardown is restricted to it.
    pub pid: libc::pid_t,
    /// Global mutex: guards the arena list topology and the registry.
    pub mutex: SharedMutex,
    /// Runtime page size from `sysconf(_SC_PAGE_SIZE)`.
    pub page_size: usize,
    /// Head of the arena list, or null.
    pub arena_first: *mut ArenaHeader,
    /// Number of live arenas.
    pub arena_count: usize,
    /// Byte size of a standard arena (`arena_pages * page_size`).
    pub arena_bytes: usize,
    /// Guard-page protection active in this run.
    pub guard_enabled: bool,
    /// Capacity of the peer registry.
    #[cfg(feature = "propagate")]
    pub max_procs: usize,
    /// Set once a second process registers; the creator then also mirrors.
    #[cfg(feature = "propagate")]
    pub is_father: bool,
    /// Fixed-size peer slot array, in its own shared mapping.
    #[cfg(feature = "propagate")]
    pub peers: *mut crate::propagate::PeerSlot,
}

static SHARED: AtomicPtr<Shared> = AtomicPtr::new(std::ptr::null_mut());
static INIT: Once = Once::new();

/// The shared record, or null before `init` (or after a failed one).
pub fn ptr() -> *mut Shared {
    SHARED.load(Ordering::Acquire)
}

/// Whether guard pages are active in this run.
pub fn guard_active() -> bool {
    let shared = ptr();
    !shared.is_null() && unsafe { (*shared).guard_enabled }
}

// ---------------------------------------------------------------------------
// Anonymous shared mappings
// ---------------------------------------------------------------------------

/// Map `len` bytes of zeroed, read-write, anonymous shared memory.
///
/// Returns null on failure (with the errno logged); never panics.
pub fn map_shared(len: usize) -> *mut u8 {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        log::error!(
            target: "palisade::shared",
            "mmap of {} bytes failed: {}",
            len,
            std::io::Error::last_os_error()
        );
        return std::ptr::null_mut();
    }
    addr as *mut u8
}

/// Unmap a region obtained from [`map_shared`].
///
/// # Safety
///
/// `addr`/`len` must name exactly one live mapping, and nothing may touch
/// it afterwards.
pub unsafe fn unmap(addr: *mut u8, len: usize) {
    if libc::munmap(addr as *mut libc::c_void, len) == -1 {
        log::error!(
            target: "palisade::shared",
            "munmap of {} bytes at 0x{:012x} failed: {}",
            len,
            addr as usize,
            std::io::Error::last_os_error()
        );
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create the shared record if it does not exist yet. Returns the record,
/// or null if creation failed (the failure is permanent for this process
/// family and has been logged).
pub fn init() -> *mut Shared {
    INIT.call_once(|| {
        diag::init();
        let shared = create();
        SHARED.store(shared, Ordering::Release);
    });
    ptr()
}

fn create() -> *mut Shared {
    let shared = map_shared(std::mem::size_of::<Shared>()) as *mut Shared;
    if shared.is_null() {
        log::error!(
            target: "palisade::shared",
            "cannot create the shared record; allocator stays disabled"
        );
        return std::ptr::null_mut();
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    let page_size = if page_size > 0 { page_size as usize } else { PAGE_SIZE };

    unsafe {
        (*shared).pid = libc::getpid();
        (*shared).page_size = page_size;
        (*shared).arena_first = std::ptr::null_mut();
        (*shared).arena_count = 0;
        (*shared).arena_bytes = config().arena_pages * page_size;

        // Header layout reserves protect regions of exactly PAGE_SIZE; a
        // machine with a different page size cannot place its guards.
        (*shared).guard_enabled = cfg!(feature = "guard") && page_size == PAGE_SIZE;
        if cfg!(feature = "guard") && page_size != PAGE_SIZE {
            log::error!(
                target: "palisade::shared",
                "guard pages disabled: system page size {} != layout page size {}",
                page_size,
                PAGE_SIZE
            );
        }

        if let Err(e) = (*shared).mutex.init() {
            log::error!(target: "palisade::shared", "global mutex init failed: {}", e);
            unmap(shared as *mut u8, std::mem::size_of::<Shared>());
            return std::ptr::null_mut();
        }

        #[cfg(feature = "propagate")]
        {
            if (*shared).guard_enabled && !crate::propagate::startup(shared) {
                log::error!(
                    target: "palisade::shared",
                    "propagator startup failed; protection stays process-local"
                );
            }
        }
    }

    log::debug!(
        target: "palisade::shared",
        "shared record at 0x{:012x}, arena size {} KB",
        shared as usize,
        unsafe { (*shared).arena_bytes } / 1024
    );
    shared
}

/// Tear the allocator down. Only the creator process acts; everyone else
/// returns immediately. Arenas still alive are reported as leaks (with the
/// full block table) and left mapped for post-mortem inspection.
pub fn shutdown() {
    let shared = ptr();
    if shared.is_null() {
        return;
    }
    unsafe {
        if (*shared).pid != libc::getpid() {
            return;
        }

        if !(*shared).arena_first.is_null() {
            log::error!(
                target: "palisade::shared",
                "memory leak: {} arena(s) still hold live blocks",
                (*shared).arena_count
            );
            let mut arena = (*shared).arena_first;
            while !arena.is_null() {
                crate::integrity::dump("shutdown", arena, "arena not empty at teardown");
                arena = (*arena).next;
            }
        }

        #[cfg(feature = "propagate")]
        {
            if (*shared).guard_enabled {
                crate::propagate::shutdown(shared);
            }
        }

        if let Err(e) = (*shared).mutex.destroy() {
            log::error!(target: "palisade::shared", "global mutex destroy failed: {}", e);
        }

        SHARED.store(std::ptr::null_mut(), Ordering::Release);
        unmap(shared as *mut u8, std::mem::size_of::<Shared>());
    }
    log::debug!(target: "palisade::shared", "shared record destroyed");
}
