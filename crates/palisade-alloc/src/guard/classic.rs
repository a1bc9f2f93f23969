//! Classic `mprotect(2)` back-end.
//!
//! One syscall per flip. Note that every protected page splits its arena
//! mapping into more kernel VMAs; sustained high allocation volume can run
//! into `/proc/sys/vm/max_map_count`; that is what the pkey back-end is
//! for.

/// Set `prot` on `len` bytes at `addr`. Reports and returns `false` on
/// failure.
///
/// # Safety
///
/// `addr` must be page-aligned and inside a live mapping of this process.
pub unsafe fn set(addr: *mut libc::c_void, len: usize, prot: libc::c_int) -> bool {
    if libc::mprotect(addr, len, prot) == 0 {
        return true;
    }

    let doing = if prot == libc::PROT_NONE {
        "protecting"
    } else {
        "unprotecting"
    };
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        // EACCES: the mapping cannot be given this access at all.
        // EINVAL: addr is not page-aligned or prot is malformed.
        // ENOMEM: kernel bookkeeping exhausted, or the range is unmapped;
        //         with many live guards this is the max_map_count ceiling.
        Some(libc::EACCES) | Some(libc::EINVAL) | Some(libc::ENOMEM) => {
            log::error!(target: "palisade::guard", "{} returned: {}", doing, err);
        }
        _ => {
            log::error!(target: "palisade::guard", "{} unknown error: {}", doing, err);
        }
    }
    false
}
