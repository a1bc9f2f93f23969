//! Allocator-level error types.
//!
//! Each subsystem defines its own narrow error enum next to the code that
//! raises it ([`crate::sync::LockError`], [`crate::integrity::CorruptionKind`]);
//! this module provides the umbrella type that public operations report
//! through before the API surface converts failures into null returns.

use std::fmt;

use crate::integrity::CorruptionKind;
use crate::sync::LockError;

/// Why an allocator operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The kernel refused to map a new arena, even at the fallback size.
    OutOfMemory,
    /// The request can never fit inside a single arena.
    RequestTooLarge(usize),
    /// A zero-byte request (or a zero product in `calloc`).
    ZeroSize,
    /// The pointer is not inside any arena this allocator owns.
    BadPointer(usize),
    /// The pointed-to block was already free.
    DoubleFree(usize),
    /// A header checksum or chain invariant is violated.
    Corrupted(CorruptionKind),
    /// A mutex operation returned an unexpected status.
    Lock(LockError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "no memory available for a new arena"),
            AllocError::RequestTooLarge(n) => {
                write!(f, "request of {} bytes exceeds the arena payload", n)
            }
            AllocError::ZeroSize => write!(f, "request of zero bytes"),
            AllocError::BadPointer(p) => {
                write!(f, "pointer 0x{:012x} is outside every arena", p)
            }
            AllocError::DoubleFree(p) => {
                write!(f, "block at 0x{:012x} is already free", p)
            }
            AllocError::Corrupted(kind) => write!(f, "corruption detected: {}", kind),
            AllocError::Lock(e) => write!(f, "lock failure: {}", e),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<LockError> for AllocError {
    fn from(e: LockError) -> Self {
        AllocError::Lock(e)
    }
}

impl From<CorruptionKind> for AllocError {
    fn from(kind: CorruptionKind) -> Self {
        AllocError::Corrupted(kind)
    }
}
