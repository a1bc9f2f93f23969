//! Guard-page protection layer.
//!
//! When guard pages are compiled in and active, every block header carries
//! a leading page that is kept inaccessible while the header exists, so an
//! out-of-bounds access on the neighboring payload faults deterministically.
//! [`protect`] and [`unprotect`] flip exactly that one page between
//! `PROT_NONE` and `PROT_READ | PROT_WRITE`.
//!
//! A failed flip is reported but does not invalidate allocator state: the
//! allocation simply proceeds without its guard.
//!
//! Back-ends: [`classic`] calls `mprotect(2)` per flip; [`pkey`] routes the
//! flip through a protection key, which sidesteps the kernel's
//! `vm.max_map_count` limit on distinct mappings at high allocation volume.

#[cfg(feature = "guard")]
pub mod classic;
#[cfg(feature = "guard-pkey")]
pub mod pkey;

use crate::block::BlockHeader;

/// Human-readable description of the active back-end.
pub fn status() -> &'static str {
    if !crate::shared::guard_active() {
        "disabled"
    } else if cfg!(feature = "guard-pkey") {
        "pkey"
    } else {
        "classic"
    }
}

/// Make the header's guard page inaccessible (and mirror the flip to
/// attached processes in propagate builds).
///
/// # Safety
///
/// `header` must point to a live block header inside an arena mapping.
#[allow(unused_variables)]
pub unsafe fn protect(header: *mut BlockHeader) -> bool {
    #[cfg(feature = "guard")]
    {
        if !crate::shared::guard_active() {
            return true;
        }
        let page = (*crate::shared::ptr()).page_size;
        if !apply(header, page, libc::PROT_NONE) {
            return false;
        }
        #[cfg(feature = "propagate")]
        {
            crate::propagate::distribute(crate::shared::ptr(), header, libc::PROT_NONE);
        }
        true
    }
    #[cfg(not(feature = "guard"))]
    {
        true
    }
}

/// Re-enable access to the header's guard page (mirrored like [`protect`]).
///
/// # Safety
///
/// `header` must point to a live block header inside an arena mapping.
#[allow(unused_variables)]
pub unsafe fn unprotect(header: *mut BlockHeader) -> bool {
    #[cfg(feature = "guard")]
    {
        if !crate::shared::guard_active() {
            return true;
        }
        let page = (*crate::shared::ptr()).page_size;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        if !apply(header, page, prot) {
            return false;
        }
        #[cfg(feature = "propagate")]
        {
            crate::propagate::distribute(crate::shared::ptr(), header, prot);
        }
        true
    }
    #[cfg(not(feature = "guard"))]
    {
        true
    }
}

/// Route one flip through the selected back-end. The protect region is the
/// first page of the header, so its address is the header address itself.
#[cfg(feature = "guard")]
unsafe fn apply(header: *mut BlockHeader, page: usize, prot: libc::c_int) -> bool {
    // No reference is formed here: the page may already be inaccessible.
    let addr = std::ptr::addr_of_mut!((*header).protect) as *mut libc::c_void;
    #[cfg(feature = "guard-pkey")]
    {
        pkey::set(header, addr, page, prot)
    }
    #[cfg(not(feature = "guard-pkey"))]
    {
        classic::set(addr, page, prot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names_a_known_backend() {
        assert!(matches!(status(), "disabled" | "classic" | "pkey"));
        // Without the feature the runtime flag can never switch it on.
        #[cfg(not(feature = "guard"))]
        assert_eq!(status(), "disabled");
    }

    #[test]
    fn test_protect_unprotect_cycle_succeeds() {
        unsafe {
            let a = crate::arena::create(64 * 1024, std::ptr::null_mut()).expect("arena");
            let block = crate::arena::first_block(a);
            assert!(protect(block));
            assert!(unprotect(block));
            let _ = (*a).mutex.destroy();
            crate::shared::unmap(a as *mut u8, 64 * 1024);
        }
    }
}
