//! Flip frame wire format.
//!
//! One frame per protection flip, little-endian, fixed size:
//!
//! ```text
//! [u64 header address][i32 prot][i32 source pid]
//! ```
//!
//! The receiver answers each applied frame with a single little-endian
//! `i32` acknowledgment: 1 on success, 0 when an unprotect failed.

// ── Sizes and ack codes ──────────────────────────────────────────────────

pub const FRAME_LEN: usize = 16;
pub const ACK_LEN: usize = 4;

pub const ACK_OK: i32 = 1;
pub const ACK_FAILED: i32 = 0;

// ── FlipFrame ────────────────────────────────────────────────────────────

/// One protection flip, as sent to every peer supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipFrame {
    /// Address of the block header whose guard page flips. Valid in every
    /// attached process because all arenas live in shared mappings created
    /// before fork.
    pub header: usize,
    /// `PROT_NONE` or `PROT_READ | PROT_WRITE`.
    pub prot: i32,
    /// Originating process; receivers ignore their own frames.
    pub source_pid: i32,
}

impl FlipFrame {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..8].copy_from_slice(&(self.header as u64).to_le_bytes());
        buf[8..12].copy_from_slice(&self.prot.to_le_bytes());
        buf[12..16].copy_from_slice(&self.source_pid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> FlipFrame {
        FlipFrame {
            header: u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize,
            prot: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            source_pid: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

pub fn encode_ack(code: i32) -> [u8; ACK_LEN] {
    code.to_le_bytes()
}

pub fn decode_ack(buf: &[u8; ACK_LEN]) -> i32 {
    i32::from_le_bytes(*buf)
}

// ── Tests ────────────────────────────────────────────────────────────────
