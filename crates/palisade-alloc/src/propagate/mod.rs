//! Multi-process propagation of guard flips.
//!
//! When a process family shares guard-enabled arenas across `fork()`, a
//! protection flip performed by one process must be applied by all of them
//! because page protections are per-process even on shared mappings. Each
//! attached process therefore runs a supervisor thread listening on a unix
//! stream socket; every flip is broadcast to all peers, which re-apply it
//! locally and acknowledge.
//!
//! ## Registry
//!
//! The shared record holds a fixed-capacity array of [`PeerSlot`]s, one per
//! attached process. A slot with pid 0 is empty. Thread handles and file
//! descriptors stay process-local; only the pid and the socket path live in
//! shared memory.
//!
//! ## Fault model
//!
//! A peer that refuses connections or drops one mid-frame is dead: its slot
//! is cleared and its socket file unlinked. The local flip still counts as
//! successful.

pub mod supervisor;
pub mod wire;

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::block::BlockHeader;
use crate::config::config;
use crate::shared::{self, Shared};
use self::wire::{FlipFrame, ACK_LEN, FRAME_LEN};

/// Maximum socket path bytes stored per slot.
pub const SOCKET_NAME_MAX: usize = 100;

// ---------------------------------------------------------------------------
// PeerSlot
// ---------------------------------------------------------------------------

/// One attached process in the shared registry.
#[repr(C)]
pub struct PeerSlot {
    /// Owning process, 0 when the slot is empty.
    pub pid: libc::pid_t,
    pub path_len: usize,
    pub path: [u8; SOCKET_NAME_MAX],
}

impl PeerSlot {
    pub fn is_empty(&self) -> bool {
        self.pid == 0
    }

    pub fn clear(&mut self) {
        self.pid = 0;
        self.path_len = 0;
        self.path = [0; SOCKET_NAME_MAX];
    }

    pub fn set_path(&mut self, path: &Path) -> bool {
        let bytes = path.as_os_str().as_encoded_bytes();
        if bytes.len() > SOCKET_NAME_MAX {
            return false;
        }
        self.path[..bytes.len()].copy_from_slice(bytes);
        self.path_len = bytes.len();
        true
    }

    pub fn path(&self) -> Option<PathBuf> {
        if self.path_len == 0 {
            return None;
        }
        let bytes = &self.path[..self.path_len];
        std::str::from_utf8(bytes).ok().map(PathBuf::from)
    }
}

/// Socket path for a given process.
pub fn socket_path(pid: libc::pid_t) -> PathBuf {
    config().socket_dir.join(format!("malloc-{}.sock", pid))
}

// ---------------------------------------------------------------------------
// Slot management
// ---------------------------------------------------------------------------

/// Claim the first empty slot for `pid`. Returns `None` when `pid` is
/// already registered or the registry is full.
pub(crate) fn claim_slot(slots: &mut [PeerSlot], pid: libc::pid_t) -> Option<usize> {
    if slots.iter().any(|slot| slot.pid == pid) {
        return None;
    }
    for (pos, slot) in slots.iter_mut().enumerate() {
        if slot.is_empty() {
            slot.pid = pid;
            return Some(pos);
        }
    }
    None
}

pub(crate) fn count_peers(slots: &[PeerSlot]) -> usize {
    slots.iter().filter(|slot| !slot.is_empty()).count()
}

unsafe fn slots_mut<'a>(shared: *mut Shared) -> &'a mut [PeerSlot] {
    std::slice::from_raw_parts_mut((*shared).peers, (*shared).max_procs)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// One-time propagator startup in the creating process: map the registry,
/// prepare the socket directory, and register the creator itself.
///
/// # Safety
///
/// `shared` is the freshly created shared record; no locks held.
pub unsafe fn startup(shared: *mut Shared) -> bool {
    (*shared).max_procs = config().max_procs;
    (*shared).is_father = false;

    let bytes = (*shared).max_procs * std::mem::size_of::<PeerSlot>();
    let peers = shared::map_shared(bytes) as *mut PeerSlot;
    if peers.is_null() {
        return false;
    }
    (*shared).peers = peers;

    if !prepare_socket_dir() {
        return false;
    }

    register_self(shared)
}

/// Create the socket directory (0750) and scrub stale socket files.
fn prepare_socket_dir() -> bool {
    let dir = &config().socket_dir;
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::error!(target: "palisade::propagate", "mkdir {}: {}", dir.display(), e);
        return false;
    }
    if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)) {
        log::error!(target: "palisade::propagate", "chmod {}: {}", dir.display(), e);
        return false;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!(target: "palisade::propagate", "readdir {}: {}", dir.display(), e);
            return false;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sock") {
            log::debug!(
                target: "palisade::propagate",
                "removing stale socket file {}",
                path.display()
            );
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!(
                    target: "palisade::propagate",
                    "cannot remove {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
    true
}

/// Register the calling process: claim a slot and start its supervisor.
/// Invoked at startup by the creator and after `fork()` by every child.
///
/// # Safety
///
/// `shared` is the live shared record; caller holds no allocator locks.
pub unsafe fn register_self(shared: *mut Shared) -> bool {
    let pid = libc::getpid();
    let path = socket_path(pid);

    let _global = match (*shared).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::propagate", "cannot lock registry: {}", e);
            return false;
        }
    };

    let slots = slots_mut(shared);
    let pos = match claim_slot(slots, pid) {
        Some(pos) => pos,
        None => {
            log::warn!(
                target: "palisade::propagate",
                "no registry slot for pid {} (already registered or full)",
                pid
            );
            return false;
        }
    };
    if !slots[pos].set_path(&path) {
        log::error!(
            target: "palisade::propagate",
            "socket path too long: {}",
            path.display()
        );
        slots[pos].clear();
        return false;
    }

    if let Err(e) = supervisor::start(path.clone(), (*shared).page_size) {
        log::error!(
            target: "palisade::propagate",
            "cannot start supervisor on {}: {}",
            path.display(),
            e
        );
        slots[pos].clear();
        return false;
    }

    // The first registration after the creator's marks the family as
    // multi-process; the creator has been mirroring since startup.
    if count_peers(slots) > 1 && !(*shared).is_father {
        (*shared).is_father = true;
    }

    log::debug!(
        target: "palisade::propagate",
        "registered pid {} at {}",
        pid,
        path.display()
    );
    true
}

/// Drop the calling process from the registry and stop its supervisor.
///
/// # Safety
///
/// `shared` is the live shared record; caller holds no allocator locks.
pub unsafe fn unregister_self(shared: *mut Shared) {
    let pid = libc::getpid();

    let _global = match (*shared).mutex.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::error!(target: "palisade::propagate", "cannot lock registry: {}", e);
            return;
        }
    };

    supervisor::stop();
    let slots = slots_mut(shared);
    for slot in slots.iter_mut() {
        if slot.pid == pid {
            if let Some(path) = slot.path() {
                let _ = std::fs::remove_file(path);
            }
            slot.clear();
            break;
        }
    }
    log::debug!(target: "palisade::propagate", "unregistered pid {}", pid);
}

/// Tear the propagator down (creator only): stop the local supervisor,
/// clear every slot, and unmap the registry.
///
/// # Safety
///
/// `shared` is the live shared record, owned by the calling process.
pub unsafe fn shutdown(shared: *mut Shared) {
    supervisor::stop();
    if (*shared).peers.is_null() {
        return;
    }
    for slot in slots_mut(shared) {
        if !slot.is_empty() {
            if let Some(path) = slot.path() {
                let _ = std::fs::remove_file(path);
            }
            slot.clear();
        }
    }
    let bytes = (*shared).max_procs * std::mem::size_of::<PeerSlot>();
    shared::unmap((*shared).peers as *mut u8, bytes);
    (*shared).peers = std::ptr::null_mut();
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Mirror one flip to every registered peer. Called with the allocator
/// locks already held, so this must not take them again; unreachable peers
/// are reaped on the spot.
///
/// # Safety
///
/// `shared` is the live shared record; `header` is the flipping block.
pub unsafe fn distribute(shared: *mut Shared, header: *mut BlockHeader, prot: libc::c_int) {
    if (*shared).peers.is_null() {
        return;
    }
    let self_pid = libc::getpid();
    let frame = FlipFrame {
        header: header as usize,
        prot,
        source_pid: self_pid,
    };
    let encoded = frame.encode();

    for slot in slots_mut(shared) {
        if slot.is_empty() || slot.pid == self_pid {
            continue;
        }
        let path = match slot.path() {
            Some(path) => path,
            None => {
                slot.clear();
                continue;
            }
        };

        log::trace!(
            target: "palisade::propagate",
            "{}protect at 0x{:012x} - from pid {} to pid {}",
            if prot == libc::PROT_NONE { "" } else { "un" },
            frame.header,
            self_pid,
            slot.pid
        );

        let delivered = (|| -> std::io::Result<()> {
            let mut stream = UnixStream::connect(&path)?;
            stream.write_all(&encoded)?;
            let mut ack = [0u8; ACK_LEN];
            stream.read_exact(&mut ack)?;
            Ok(())
        })();

        if let Err(e) = delivered {
            log::warn!(
                target: "palisade::propagate",
                "peer {} unreachable ({}); removing it",
                slot.pid,
                e
            );
            let _ = std::fs::remove_file(&path);
            slot.clear();
        }
    }
}

const _: () = assert!(FRAME_LEN == 16 && ACK_LEN == 4);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_slots(n: usize) -> Vec<PeerSlot> {
        (0..n)
            .map(|_| PeerSlot {
                pid: 0,
                path_len: 0,
                path: [0; SOCKET_NAME_MAX],
            })
            .collect()
    }

    #[test]
    fn test_claim_slot_fills_first_empty() {
        let mut slots = empty_slots(3);
        assert_eq!(claim_slot(&mut slots, 100), Some(0));
        assert_eq!(claim_slot(&mut slots, 200), Some(1));
        assert_eq!(count_peers(&slots), 2);
    }

    #[test]
    fn test_claim_slot_rejects_duplicate_pid() {
        let mut slots = empty_slots(3);
        assert_eq!(claim_slot(&mut slots, 100), Some(0));
        assert_eq!(claim_slot(&mut slots, 100), None);
        assert_eq!(count_peers(&slots), 1);
    }

    #[test]
    fn test_claim_slot_rejects_when_full() {
        let mut slots = empty_slots(2);
        assert_eq!(claim_slot(&mut slots, 1), Some(0));
        assert_eq!(claim_slot(&mut slots, 2), Some(1));
        assert_eq!(claim_slot(&mut slots, 3), None);
    }

    #[test]
    fn test_slot_reuse_after_clear() {
        let mut slots = empty_slots(2);
        assert_eq!(claim_slot(&mut slots, 1), Some(0));
        assert_eq!(claim_slot(&mut slots, 2), Some(1));
        slots[0].clear();
        assert_eq!(claim_slot(&mut slots, 3), Some(0));
    }

    #[test]
    fn test_slot_path_roundtrip() {
        let mut slots = empty_slots(1);
        claim_slot(&mut slots, 77);
        let path = PathBuf::from("/tmp/palisade/malloc-77.sock");
        assert!(slots[0].set_path(&path));
        assert_eq!(slots[0].path(), Some(path));
    }

    #[test]
    fn test_slot_path_too_long_is_rejected() {
        let mut slots = empty_slots(1);
        claim_slot(&mut slots, 77);
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(SOCKET_NAME_MAX)));
        assert!(!slots[0].set_path(&long));
    }

    #[test]
    fn test_socket_path_shape() {
        let path = socket_path(1234);
        assert!(path.to_string_lossy().ends_with("malloc-1234.sock"));
    }
}
