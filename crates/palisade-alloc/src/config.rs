//! Startup configuration.
//!
//! Everything that can vary per run is read from the environment exactly
//! once, on first access. Layout-affecting choices (guard pages, protection
//! back-end, trace capture) are cargo features instead, because they change
//! `sizeof` of the in-band headers.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Page size the header layout is built around. `init()` cross-checks this
/// against the runtime `sysconf` value before enabling guard pages.
pub const PAGE_SIZE: usize = 4096;

/// Return addresses captured per allocation site.
pub const TRACE_DEPTH: usize = 10;

/// Default arena size, in system pages.
pub const DEFAULT_ARENA_PAGES: usize = 8000;

/// Default capacity of the propagator peer registry.
pub const DEFAULT_MAX_PROCS: usize = 10;

const DEFAULT_SOCKET_DIR: &str = "/tmp/palisade";

/// Run-time knobs, resolved from the environment once.
#[derive(Debug, Clone)]
pub struct Config {
    /// Numeric diagnostic verbosity (`MESSAGE_LEVEL`, 0 = errors only).
    pub message_level: u32,
    /// Arena size in system pages (`PALISADE_ARENA_PAGES`).
    pub arena_pages: usize,
    /// Peer registry capacity (`PALISADE_MAX_PROCS`).
    pub max_procs: usize,
    /// Directory for propagator sockets (`PALISADE_SOCKET_DIR`).
    pub socket_dir: PathBuf,
}

impl Config {
    fn from_env() -> Self {
        Config {
            message_level: env_number("MESSAGE_LEVEL", 1) as u32,
            // An arena must at least hold its own header, one block header
            // and some payload; four pages is the floor either way.
            arena_pages: env_number("PALISADE_ARENA_PAGES", DEFAULT_ARENA_PAGES as u64)
                .max(4) as usize,
            max_procs: env_number("PALISADE_MAX_PROCS", DEFAULT_MAX_PROCS as u64).max(1)
                as usize,
            socket_dir: std::env::var_os("PALISADE_SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR)),
        }
    }
}

/// Parse a numeric environment variable, falling back to `default` when the
/// variable is unset or not a number.
fn env_number(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// The process-wide configuration, resolved on first call.
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_number_unset_uses_default() {
        assert_eq!(env_number("PALISADE_TEST_UNSET_VAR", 42), 42);
    }

    #[test]
    fn test_env_number_parses_value() {
        std::env::set_var("PALISADE_TEST_NUM_VAR", "17");
        assert_eq!(env_number("PALISADE_TEST_NUM_VAR", 42), 17);
        std::env::remove_var("PALISADE_TEST_NUM_VAR");
    }

    #[test]
    fn test_env_number_garbage_uses_default() {
        std::env::set_var("PALISADE_TEST_BAD_VAR", "not-a-number");
        assert_eq!(env_number("PALISADE_TEST_BAD_VAR", 7), 7);
        std::env::remove_var("PALISADE_TEST_BAD_VAR");
    }

    #[test]
    fn test_config_defaults() {
        let cfg = Config {
            message_level: 1,
            arena_pages: DEFAULT_ARENA_PAGES,
            max_procs: DEFAULT_MAX_PROCS,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
        };
        assert_eq!(cfg.arena_pages, 8000);
        assert_eq!(cfg.max_procs, 10);
        assert_eq!(cfg.socket_dir, PathBuf::from("/tmp/palisade"));
    }
}
