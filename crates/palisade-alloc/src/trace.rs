//! Allocation-site stack traces.
//!
//! Each BUSY block header stores up to [`crate::config::TRACE_DEPTH`] raw
//! return addresses, captured at allocation time. Only the addresses go
//! into shared memory; symbolization happens lazily when a dump needs the
//! trace, with results cached per address and frames from system libraries
//! filtered out.

#[cfg(feature = "stacktrace")]
use std::fmt::Write as _;

use crate::block::BlockHeader;

/// Record the current call stack into `block`.
///
/// # Safety
///
/// `block` must point to a live block header.
#[allow(unused_variables)]
pub unsafe fn capture(block: *mut BlockHeader) {
    #[cfg(feature = "stacktrace")]
    {
        use crate::config::TRACE_DEPTH;

        let mut count = 0usize;
        let mut skipped = 0usize;
        let mut frames = [0usize; TRACE_DEPTH];
        backtrace::trace(|frame| {
            // The first frames are the capture machinery itself.
            if skipped < 2 {
                skipped += 1;
                return true;
            }
            frames[count] = frame.ip() as usize;
            count += 1;
            count < TRACE_DEPTH
        });
        (*block).trace = frames;
        (*block).trace_len = count;
    }
}

/// Append the symbolized trace of `block` to `out`, one frame per line.
///
/// # Safety
///
/// `block` must point to a live block header.
#[allow(unused_variables)]
pub unsafe fn render(block: *const BlockHeader, out: &mut String) {
    #[cfg(feature = "stacktrace")]
    {
        if (*block).trace_len == 0 {
            return;
        }
        for &ip in (&(*block).trace)[..(*block).trace_len].iter() {
            if let Some(frame) = resolve(ip) {
                let _ = writeln!(out, "    [bt] {}", frame);
            }
        }
    }
}

/// Symbolize one return address, consulting the cache first. Frames that
/// resolve into system library paths are dropped (`None`).
#[cfg(feature = "stacktrace")]
fn resolve(ip: usize) -> Option<String> {
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    static CACHE: Mutex<Option<FxHashMap<usize, Option<String>>>> = Mutex::new(None);

    let mut cache = CACHE.lock();
    let map = cache.get_or_insert_with(FxHashMap::default);
    if let Some(cached) = map.get(&ip) {
        return cached.clone();
    }

    let mut line: Option<String> = None;
    backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
        if line.is_some() {
            return;
        }
        let filename = symbol.filename().map(|p| p.to_path_buf());
        if let Some(path) = &filename {
            if path.starts_with("/usr/lib") || path.starts_with("/lib") {
                return;
            }
        }
        let name = match symbol.name() {
            Some(name) => name.to_string(),
            None => return,
        };
        let mut rendered = name;
        if let (Some(path), Some(lineno)) = (&filename, symbol.lineno()) {
            let _ = write!(rendered, " at {}:{}", path.display(), lineno);
        }
        line = Some(rendered);
    });

    map.insert(ip, line.clone());
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "stacktrace")]
    #[test]
    fn test_capture_records_bounded_trace() {
        use crate::arena;
        use crate::config::TRACE_DEPTH;

        unsafe {
            let a = arena::create(64 * 1024, std::ptr::null_mut()).expect("arena");
            let block = arena::first_block(a);
            capture(block);
            assert!((*block).trace_len > 0);
            assert!((*block).trace_len <= TRACE_DEPTH);
            for &ip in (&(*block).trace)[..(*block).trace_len].iter() {
                assert_ne!(ip, 0);
            }
            let _ = (*a).mutex.destroy();
            crate::shared::unmap(a as *mut u8, 64 * 1024);
        }
    }

    #[cfg(feature = "stacktrace")]
    #[test]
    fn test_render_does_not_panic() {
        use crate::arena;

        unsafe {
            let a = arena::create(64 * 1024, std::ptr::null_mut()).expect("arena");
            let block = arena::first_block(a);
            capture(block);
            let mut out = String::new();
            render(block, &mut out);
            // Every emitted line is a [bt] frame.
            for line in out.lines() {
                assert!(line.trim_start().starts_with("[bt]"));
            }
            let _ = (*a).mutex.destroy();
            crate::shared::unmap(a as *mut u8, 64 * 1024);
        }
    }

    #[cfg(feature = "stacktrace")]
    #[test]
    fn test_resolve_caches_results() {
        let ip = test_resolve_caches_results as usize;
        let first = resolve(ip);
        let second = resolve(ip);
        assert_eq!(first, second);
    }
}
