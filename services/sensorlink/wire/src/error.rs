//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Record shorter than the 30-byte slot layout
    #[error("short record: {0} bytes")]
    ShortRecord(usize),

    /// Timestamp outside the plausible window (reject policy only)
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(u32),

    /// Packet is not exactly 240 bytes
    #[error("packet size mismatch: {0} bytes")]
    PacketSize(usize),

    /// Malformed hex text
    #[error("invalid hex: {0}")]
    Hex(String),
}
