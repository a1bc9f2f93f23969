//! Arena chain integrity checking and reporting.
//!
//! The checker never mutates; it walks the block chain of one arena and
//! verifies, in order: block size within bounds, header inside the arena
//! range, coherent back-links, and finally that headers plus payloads add
//! up to the arena payload exactly. Callers must hold the arena mutex and
//! abort their mutating operation on failure.

use std::fmt;
use std::fmt::Write as _;

use crate::arena::{self, ArenaHeader};
use crate::block::BlockHeader;
use crate::trace;

// ---------------------------------------------------------------------------
// CorruptionKind
// ---------------------------------------------------------------------------

/// What the checker found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// A block claims more bytes than the arena can hold.
    OversizedBlock { at: usize },
    /// A header lies outside its arena's address range.
    PointerOutOfRange { at: usize },
    /// `block.next.prev != block`: something overwrote a header.
    BrokenBackLink { at: usize },
    /// Headers plus payloads no longer cover the arena payload.
    Accounting { expected: usize, actual: usize },
    /// The walk exceeded any possible chain length (cyclic links).
    RunawayChain,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::OversizedBlock { at } => {
                write!(f, "too big memory block in allocation at 0x{:012x}", at)
            }
            CorruptionKind::PointerOutOfRange { at } => write!(
                f,
                "memory pointer at 0x{:012x} points outside the arena",
                at
            ),
            CorruptionKind::BrokenBackLink { at } => {
                write!(f, "memory overwrite in allocation at 0x{:012x}", at)
            }
            CorruptionKind::Accounting { expected, actual } => write!(
                f,
                "inconsistent arena: {} payload bytes accounted, {} expected",
                actual, expected
            ),
            CorruptionKind::RunawayChain => write!(f, "block chain does not terminate"),
        }
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Verify the block chain of `arena`. Logs and dumps on the first
/// violation, then reports it.
///
/// # Safety
///
/// Caller holds the arena mutex.
pub unsafe fn check(tag: &str, arena: *mut ArenaHeader) -> Result<(), CorruptionKind> {
    let header_size = std::mem::size_of::<BlockHeader>();
    // Any intact chain has at most one header per header-size bytes of
    // payload; anything longer means the links cycle.
    let max_blocks = (*arena).payload_bytes() / header_size + 1;

    let arena_start = arena as usize;
    let arena_end = arena_start + (*arena).size;

    let mut busy = 0usize;
    let mut free = 0usize;
    let mut headers = 0usize;
    let mut steps = 0usize;

    let mut block = arena::first_block(arena);
    while !block.is_null() {
        steps += 1;
        if steps > max_blocks {
            return fail(tag, arena, CorruptionKind::RunawayChain);
        }

        headers += header_size;
        if (*block).is_free() {
            free += (*block).size;
        } else {
            busy += (*block).size;
        }

        let payload_addr = block as usize + header_size;
        if (*block).size > (*arena).max_payload {
            return fail(tag, arena, CorruptionKind::OversizedBlock { at: payload_addr });
        }

        if (block as usize) < arena_start || block as usize > arena_end {
            return fail(
                tag,
                arena,
                CorruptionKind::PointerOutOfRange { at: payload_addr },
            );
        }

        let next = (*block).next;
        if next.is_null() {
            break;
        }
        if (*next).prev != block {
            return fail(tag, arena, CorruptionKind::BrokenBackLink { at: payload_addr });
        }
        block = next;
    }

    let expected = (*arena).payload_bytes();
    let actual = busy + free + headers;
    if actual != expected {
        return fail(tag, arena, CorruptionKind::Accounting { expected, actual });
    }

    Ok(())
}

unsafe fn fail(
    tag: &str,
    arena: *mut ArenaHeader,
    kind: CorruptionKind,
) -> Result<(), CorruptionKind> {
    log::error!(target: "palisade::integrity", "{}: {}", tag, kind);
    dump(tag, arena, "arena failed its integrity check");
    Err(kind)
}

// ---------------------------------------------------------------------------
// Dump / report rendering
// ---------------------------------------------------------------------------

const DASHES: &str = "---------------------------------------------------------------------";

fn payload_addr_of(block: *const BlockHeader) -> usize {
    if block.is_null() {
        0
    } else {
        block as usize + std::mem::size_of::<BlockHeader>()
    }
}

/// Render the block table of `arena` into `out`.
///
/// # Safety
///
/// Caller holds the arena mutex (or knows no other thread can mutate).
pub unsafe fn render(arena: *mut ArenaHeader, out: &mut String) {
    let header_size = std::mem::size_of::<BlockHeader>();
    let max_blocks = (*arena).payload_bytes() / header_size + 1;

    let _ = writeln!(out, "arena at 0x{:012x}", arena as usize);
    let _ = writeln!(out, " ID memory         prev           next           status    size");
    let _ = writeln!(out, "{}", DASHES);

    let mut busy = 0usize;
    let mut free = 0usize;
    let mut headers = 0usize;

    let mut index = 0usize;
    let mut block = arena::first_block(arena);
    while !block.is_null() && index < max_blocks {
        headers += header_size;
        if (*block).is_free() {
            free += (*block).size;
        } else {
            busy += (*block).size;
        }

        let _ = writeln!(
            out,
            "{:3} 0x{:012x} 0x{:012x} 0x{:012x} {} {:9} bytes",
            index,
            payload_addr_of(block),
            payload_addr_of((*block).prev),
            payload_addr_of((*block).next),
            if (*block).is_free() { "FREE" } else { "BUSY" },
            (*block).size
        );

        if !(*block).is_free() {
            trace::render(block, out);
        }

        index += 1;
        block = (*block).next;
    }

    let max = (*arena).size - std::mem::size_of::<ArenaHeader>() - headers;
    let _ = writeln!(out, "{}", DASHES);
    let _ = writeln!(out, "size allocated.: {:9} bytes", (*arena).size);
    let _ = writeln!(out, "size busy......: {:9} bytes", busy);
    let _ = writeln!(out, "size free......: {:9} bytes", free);
    let _ = writeln!(out, "size total.....: {:9} bytes *", busy + free);
    let _ = writeln!(out, "size max.......: {:9} bytes *", max);
    let _ = writeln!(out, "{}", DASHES);
}

/// Emit the block table of `arena` on the error channel.
///
/// # Safety
///
/// Same contract as [`render`].
pub unsafe fn dump(tag: &str, arena: *mut ArenaHeader, reason: &str) {
    if arena.is_null() {
        return;
    }
    log::error!(target: "palisade::integrity", "{}: {}", tag, reason);
    let mut out = String::new();
    render(arena, &mut out);
    for line in out.lines() {
        log::error!(target: "palisade::integrity", "{}", line);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
