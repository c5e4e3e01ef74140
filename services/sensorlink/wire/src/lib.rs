//! Measurement record codec, fragment reassembly and packet processing for sensorlink.
//!
//! The sensor exposes its readings over a characteristic transport with no
//! framing of its own. This crate turns the raw byte fragments it delivers
//! into validated measurement records.
//!
//! ## Features
//!
//! - **Field Codec**: fixed-offset big-endian decoding of every record field
//! - **Record Decoder**: padding detection and timestamp plausibility policy
//! - **Frame Reassembly**: fragments to 240-byte packets under a read budget
//! - **Packet Processing**: slot slicing, terminal sentinel, session dedup
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+-----------+-----+-----------+
//! | slot 0    | slot 1    | ... | slot 7    |   packet = 240 bytes
//! | 30 bytes  | 30 bytes  |     | 30 bytes  |
//! +-----------+-----------+-----+-----------+
//!
//! +------+------+-------------+-------------+-------------+---------+
//! | ts   | temp | accel x,y,z | freq 1..4   | ampl 1..4   | voltage |
//! | u32  | i16  | 3 x i16     | 4 x u16     | 4 x u16     | u16     |
//! +------+------+-------------+-------------+-------------+---------+
//! ```
//!
//! All integers are big-endian. A packet of 240 zero bytes ends the
//! historical log.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod field;
pub mod hex;
pub mod packet;
pub mod reassembly;
pub mod record;

// Re-export main types
pub use error::WireError;
pub use field::{
    raw_record, Acceleration, RawRecord, TimestampField, TimestampPolicy, RECORD_SIZE,
};
pub use packet::{
    build_packet, DedupState, Packet, PacketOutcome, PacketProcessor, PacketSummary, PACKET_SIZE,
    SLOTS_PER_PACKET,
};
pub use reassembly::{Assembly, FrameReassembler, HANDSHAKE_FRAME_SIZE, MAX_READS_PER_PACKET};
pub use record::{decode_record, is_empty_slot, MeasurementRecord};
