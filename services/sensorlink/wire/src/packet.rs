//! Packet slicing, terminal sentinel and duplicate detection.
//!
//! A packet is 240 bytes holding eight 30-byte slots. The device signals the
//! end of its historical log with a packet of all zeros.

use crate::field::{TimestampPolicy, RECORD_SIZE};
use crate::record::{decode_record, MeasurementRecord};
use crate::WireError;
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// Slots per packet
pub const SLOTS_PER_PACKET: usize = 8;

/// Packet size in bytes
pub const PACKET_SIZE: usize = RECORD_SIZE * SLOTS_PER_PACKET;

/// One reassembled 240-byte packet
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Bytes);

impl Packet {
    /// Wrap exactly [`PACKET_SIZE`] bytes
    pub fn new(bytes: Bytes) -> Result<Self, WireError> {
        if bytes.len() != PACKET_SIZE {
            return Err(WireError::PacketSize(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// The terminal sentinel: all zero bytes
    pub fn terminal() -> Self {
        Self(Bytes::from_static(&[0u8; PACKET_SIZE]))
    }

    /// Whether this packet marks the end of historical data
    pub fn is_terminal(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Slots in arrival order
    pub fn slots(&self) -> impl Iterator<Item = &[u8]> {
        self.0.chunks_exact(RECORD_SIZE)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Lowercase hex, 480 characters
    pub fn to_hex(&self) -> String {
        crate::hex::encode(&self.0)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.to_hex())
    }
}

/// Build a packet from up to eight records, padding the rest with zero slots
pub fn build_packet(records: &[MeasurementRecord]) -> Result<Packet, WireError> {
    if records.len() > SLOTS_PER_PACKET {
        return Err(WireError::PacketSize(records.len() * RECORD_SIZE));
    }
    let mut bytes = vec![0u8; PACKET_SIZE];
    for (slot, record) in bytes.chunks_exact_mut(RECORD_SIZE).zip(records) {
        slot.copy_from_slice(&record.encode());
    }
    Packet::new(Bytes::from(bytes))
}

/// Session-scoped duplicate tracking
#[derive(Debug, Default)]
pub struct DedupState {
    seen_timestamps: HashSet<u32>,
    last_packet: Option<Packet>,
}

impl DedupState {
    /// Create empty state for a new session
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct timestamps seen this session
    pub fn seen_count(&self) -> usize {
        self.seen_timestamps.len()
    }

    /// Whether the timestamp has already been emitted this session
    pub fn has_seen(&self, timestamp: u32) -> bool {
        self.seen_timestamps.contains(&timestamp)
    }
}

/// Records decoded from one packet plus per-slot bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketSummary {
    /// New records in slot order
    pub records: Vec<MeasurementRecord>,
    /// Padding slots
    pub empty_slots: usize,
    /// Slots whose timestamp was already seen this session
    pub duplicate_timestamps: usize,
    /// Slots rejected by the decoder
    pub rejected_slots: usize,
    /// Records emitted with a substituted timestamp
    pub substituted_slots: usize,
}

/// Result of processing one packet
#[derive(Debug, Clone, PartialEq)]
pub enum PacketOutcome {
    /// All-zero sentinel: historical data exhausted
    Terminal,
    /// Byte-identical to the previous packet
    Duplicate,
    /// Regular packet
    Records(PacketSummary),
}

/// Applies slot decoding and session dedup to reassembled packets
#[derive(Debug)]
pub struct PacketProcessor {
    dedup: DedupState,
    policy: TimestampPolicy,
}

impl PacketProcessor {
    /// Create a processor with fresh dedup state
    pub fn new(policy: TimestampPolicy) -> Self {
        Self {
            dedup: DedupState::new(),
            policy,
        }
    }

    /// Session dedup state
    pub fn dedup(&self) -> &DedupState {
        &self.dedup
    }

    /// Process one packet; `now` is wall-clock seconds
    pub fn process(&mut self, packet: &Packet, now: u32) -> PacketOutcome {
        if packet.is_terminal() {
            debug!("Terminal sentinel packet received");
            return PacketOutcome::Terminal;
        }

        if self.dedup.last_packet.as_ref() == Some(packet) {
            debug!("Packet identical to previous, skipping");
            return PacketOutcome::Duplicate;
        }
        self.dedup.last_packet = Some(packet.clone());

        let mut summary = PacketSummary::default();
        for (index, slot) in packet.slots().enumerate() {
            let record = match decode_record(slot, now, self.policy) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    summary.empty_slots += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Rejected slot {}: {}", index, e);
                    summary.rejected_slots += 1;
                    continue;
                }
            };

            // Substituted readings share `now`; keep each one and leave the
            // seen set to real device timestamps
            if record.timestamp_substituted {
                summary.substituted_slots += 1;
                summary.records.push(record);
                continue;
            }

            if !self.dedup.seen_timestamps.insert(record.timestamp) {
                debug!(
                    "Slot {} duplicates timestamp {}, skipping",
                    index, record.timestamp
                );
                summary.duplicate_timestamps += 1;
                continue;
            }

            summary.records.push(record);
        }

        debug!(
            "Packet decoded: {} records, {} empty, {} duplicate, {} rejected",
            summary.records.len(),
            summary.empty_slots,
            summary.duplicate_timestamps,
            summary.rejected_slots
        );
        PacketOutcome::Records(summary)
    }
}
