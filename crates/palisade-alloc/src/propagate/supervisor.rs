//! Per-process supervisor thread.
//!
//! Each attached process listens on its own unix stream socket. Peers open
//! a fresh connection per flip, send one frame, and wait for the ack; the
//! supervisor applies the flip locally with plain `mprotect` (protection
//! keys are per-process, so the key-based back-end only runs on the
//! originating side) and acknowledges.
//!
//! Rust threads cannot be cancelled at an `accept(2)` boundary the way the
//! original pthread design was; shutdown instead raises a stop flag and
//! wakes the listener with a throwaway local connection, then joins.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::guard::classic;
use crate::propagate::wire::{self, FlipFrame, ACK_FAILED, ACK_OK, FRAME_LEN};

struct Supervisor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    path: PathBuf,
}

/// The calling process's supervisor, if one is running. Thread handles are
/// meaningless across `fork()`, so a child's `start` simply replaces the
/// inherited entry.
static CURRENT: Mutex<Option<Supervisor>> = Mutex::new(None);

/// Bind the socket and start the listener thread.
pub fn start(path: PathBuf, page_size: usize) -> std::io::Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let self_pid = unsafe { libc::getpid() };

    let handle = std::thread::Builder::new()
        .name(format!("palisade-guard-{}", self_pid))
        .spawn(move || serve(listener, thread_stop, self_pid, page_size))?;

    // After fork the inherited entry describes a thread that only exists
    // in the parent; dropping it detaches, never joins.
    *CURRENT.lock() = Some(Supervisor { stop, handle, path });
    Ok(())
}

/// Stop the calling process's supervisor, if any: raise the flag, wake the
/// accept loop, join, and unlink the socket.
pub fn stop() {
    let supervisor = CURRENT.lock().take();
    if let Some(supervisor) = supervisor {
        supervisor.stop.store(true, Ordering::Release);
        let _ = UnixStream::connect(&supervisor.path);
        if supervisor.handle.join().is_err() {
            log::error!(target: "palisade::propagate", "supervisor thread panicked");
        }
        let _ = std::fs::remove_file(&supervisor.path);
    }
}

fn serve(listener: UnixListener, stop: Arc<AtomicBool>, self_pid: libc::pid_t, page_size: usize) {
    for connection in listener.incoming() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match connection {
            Ok(stream) => handle_connection(stream, self_pid, page_size),
            Err(e) => {
                log::warn!(target: "palisade::propagate", "accept failed: {}", e);
            }
        }
    }
}

/// Read frames until the peer closes, applying each flip locally.
fn handle_connection(mut stream: UnixStream, self_pid: libc::pid_t, page_size: usize) {
    loop {
        let mut buf = [0u8; FRAME_LEN];
        if stream.read_exact(&mut buf).is_err() {
            break;
        }
        let frame = FlipFrame::decode(&buf);
        if frame.source_pid == self_pid {
            break;
        }

        log::trace!(
            target: "palisade::propagate",
            "{}protect at 0x{:012x} - pid {} from pid {}",
            if frame.prot == libc::PROT_NONE { "" } else { "un" },
            frame.header,
            self_pid,
            frame.source_pid
        );

        let applied =
            unsafe { classic::set(frame.header as *mut libc::c_void, page_size, frame.prot) };
        if !applied {
            log::error!(
                target: "palisade::propagate",
                "{}protecting at 0x{:012x} failed - pid {} from pid {}",
                if frame.prot == libc::PROT_NONE { "" } else { "un" },
                frame.header,
                self_pid,
                frame.source_pid
            );
            if frame.prot != libc::PROT_NONE {
                let _ = stream.write_all(&wire::encode_ack(ACK_FAILED));
            }
            break;
        }

        if stream.write_all(&wire::encode_ack(ACK_OK)).is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
