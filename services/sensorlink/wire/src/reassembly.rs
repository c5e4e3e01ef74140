//! Fragment reassembly into fixed-size packets.
//!
//! The log-read characteristic returns fragments of whatever length the link
//! delivered. There is no length prefix, so fragments are concatenated until
//! a full packet is buffered. A 4-byte fragment arriving while the buffer is
//! empty is the device's timestamp acknowledgment and carries no data.

use crate::packet::{Packet, PACKET_SIZE};
use bytes::BytesMut;
use tracing::{debug, trace, warn};

/// Default fragment-read budget for one packet
pub const MAX_READS_PER_PACKET: u32 = 200;

/// Size of the handshake acknowledgment frame
pub const HANDSHAKE_FRAME_SIZE: usize = 4;

/// Result of feeding the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Need more fragments
    Pending,
    /// A full packet is ready
    Ready(Packet),
    /// Read budget exhausted before a full packet arrived
    Exhausted,
}

/// Accumulates fragments into packets under a per-packet read budget
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    reads: u32,
    max_reads: u32,
    handshakes_discarded: u64,
}

impl FrameReassembler {
    /// Create a reassembler with the default read budget
    pub fn new() -> Self {
        Self::with_max_reads(MAX_READS_PER_PACKET)
    }

    /// Create a reassembler with a custom read budget
    pub fn with_max_reads(max_reads: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(PACKET_SIZE * 2),
            reads: 0,
            max_reads: max_reads.max(1),
            handshakes_discarded: 0,
        }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reads counted toward the current packet
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Handshake frames discarded so far
    pub fn handshakes_discarded(&self) -> u64 {
        self.handshakes_discarded
    }

    /// Add one fragment
    pub fn push(&mut self, fragment: &[u8]) -> Assembly {
        self.reads += 1;
        self.absorb(fragment);
        self.poll()
    }

    /// Buffer a fragment without counting a read.
    ///
    /// Used for bytes that arrive outside the read loop, such as the
    /// response to the time handshake. Returns whether data was kept.
    pub fn absorb(&mut self, fragment: &[u8]) -> bool {
        if self.buffer.is_empty() && fragment.len() == HANDSHAKE_FRAME_SIZE {
            trace!("Discarding {}-byte handshake frame", fragment.len());
            self.handshakes_discarded += 1;
            return false;
        }

        self.buffer.extend_from_slice(fragment);
        trace!(
            "Read {} bytes, buffer now has {} bytes",
            fragment.len(),
            self.buffer.len()
        );
        !fragment.is_empty()
    }

    /// Count a failed read against the budget
    pub fn record_failed_read(&mut self) -> Assembly {
        self.reads += 1;
        self.poll()
    }

    /// Take a packet that is already fully buffered, without counting a read
    pub fn take_buffered(&mut self) -> Option<Packet> {
        match self.split_packet() {
            Some(packet) => {
                self.reads = 0;
                Some(packet)
            }
            None => None,
        }
    }

    /// Drop buffered bytes and the read count
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.reads = 0;
    }

    fn poll(&mut self) -> Assembly {
        if let Some(packet) = self.take_buffered() {
            return Assembly::Ready(packet);
        }

        if self.reads >= self.max_reads {
            warn!(
                "Read budget of {} exhausted with {} of {} bytes buffered",
                self.max_reads,
                self.buffer.len(),
                PACKET_SIZE
            );
            return Assembly::Exhausted;
        }

        Assembly::Pending
    }

    fn split_packet(&mut self) -> Option<Packet> {
        if self.buffer.len() < PACKET_SIZE {
            return None;
        }

        let bytes = self.buffer.split_to(PACKET_SIZE).freeze();
        debug!(
            "Packet assembled, {} bytes carried over",
            self.buffer.len()
        );
        Packet::new(bytes).ok()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}
