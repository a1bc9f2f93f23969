//! Leveled diagnostics.
//!
//! The allocator logs through the `log` facade with per-subsystem targets
//! (`palisade::arena`, `palisade::guard`, ...). Verbosity comes from the
//! numeric `MESSAGE_LEVEL` environment variable rather than `RUST_LOG`
//! syntax, so a C host linking the staticlib can drive it the same way it
//! drives everything else: 0 = errors only, 1 adds warnings, 2 info,
//! 3 debug, 4 and above trace.

use log::LevelFilter;

use crate::config::config;

/// Map the numeric verbosity onto the `log` filter levels.
fn level_filter(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the diagnostic sink. Idempotent: if a logger is already
/// installed (by us or by the host application), this quietly does nothing.
pub fn init() {
    let filter = level_filter(config().message_level);
    let _ = env_logger::Builder::new()
        .filter_level(filter)
        .format_timestamp(None)
        .try_init();
}
