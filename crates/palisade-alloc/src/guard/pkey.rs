//! Protection-key back-end.
//!
//! Protecting allocates a key with the disable-access right and applies it
//! to the guard page with `pkey_mprotect`; unprotecting restores access and
//! returns the key. Keys are a hard architectural resource (15 usable on
//! x86); when `pkey_alloc` fails the flip falls back to plain `mprotect`
//! so isolation degrades instead of disappearing.

use crate::block::BlockHeader;
use crate::guard::classic;

/// Apply `prot` to the guard page of `header` through a protection key.
///
/// # Safety
///
/// `addr` is the page-aligned guard page of `header`, which must be a live
/// block header.
pub unsafe fn set(
    header: *mut BlockHeader,
    addr: *mut libc::c_void,
    len: usize,
    prot: libc::c_int,
) -> bool {
    if prot == libc::PROT_NONE {
        let key = libc::pkey_alloc(0, libc::PKEY_DISABLE_ACCESS as libc::c_uint);
        if key == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                // ENOSPC: every key this process can hold is allocated.
                Some(libc::ENOSPC) | Some(libc::EINVAL) => {
                    log::error!(target: "palisade::guard", "pkey_alloc: {}", err);
                }
                _ => {
                    log::error!(target: "palisade::guard", "pkey_alloc unknown error: {}", err);
                }
            }
            return classic::set(addr, len, prot);
        }
        if libc::pkey_mprotect(addr, len, prot, key) == 0 {
            (*header).pkey = key;
            return true;
        }
        log::error!(
            target: "palisade::guard",
            "pkey_mprotect protecting returned: {}",
            std::io::Error::last_os_error()
        );
        let _ = libc::pkey_free(key);
        false
    } else {
        let key = (*header).pkey;
        if libc::pkey_mprotect(addr, len, prot, key) != 0 {
            log::error!(
                target: "palisade::guard",
                "pkey_mprotect unprotecting returned: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
        if key != 0 && libc::pkey_free(key) != 0 {
            log::error!(
                target: "palisade::guard",
                "pkey_free returned: {}",
                std::io::Error::last_os_error()
            );
        }
        (*header).pkey = 0;
        true
    }
}
