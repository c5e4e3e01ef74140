//! Measurement record decoding.
//!
//! A slot becomes a [`MeasurementRecord`] only when it carries a reading: an
//! all-zero slot, or a slot whose timestamp field is zero, is padding.

use crate::field::{
    self, raw_record, Acceleration, RawRecord, TimestampPolicy, RECORD_SIZE,
};
use crate::WireError;
use serde::{Deserialize, Serialize};

/// One decoded sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Seconds since epoch
    pub timestamp: u32,
    /// Battery voltage in volts
    pub voltage: f32,
    /// Temperature in degrees C
    pub temperature: f32,
    /// Raw accelerometer axes
    pub acceleration: Acceleration,
    /// Dominant frequencies in Hz
    pub frequencies: [u16; 4],
    /// Amplitudes matching `frequencies`
    pub amplitudes: [u16; 4],
    /// Device timestamp was implausible and replaced with wall-clock time
    #[serde(default)]
    pub timestamp_substituted: bool,
}

impl MeasurementRecord {
    /// Encode into the 30-byte wire layout
    pub fn encode(&self) -> RawRecord {
        let mut record = [0u8; RECORD_SIZE];
        field::encode_timestamp(&mut record, self.timestamp);
        field::encode_temperature(&mut record, self.temperature);
        field::encode_accelerometer(&mut record, self.acceleration);
        field::encode_frequencies(&mut record, self.frequencies);
        field::encode_amplitudes(&mut record, self.amplitudes);
        field::encode_voltage(&mut record, self.voltage);
        record
    }
}

/// Whether a slot is padding rather than a reading
pub fn is_empty_slot(record: &RawRecord) -> bool {
    field::raw_timestamp(record) == 0 || record.iter().all(|b| *b == 0)
}

/// Decode one slot.
///
/// Returns `Ok(None)` for padding slots. `now` is the wall-clock time in
/// seconds used for the timestamp plausibility window.
pub fn decode_record(
    slot: &[u8],
    now: u32,
    policy: TimestampPolicy,
) -> Result<Option<MeasurementRecord>, WireError> {
    let record = raw_record(slot)?;
    if is_empty_slot(record) {
        return Ok(None);
    }

    let timestamp = field::decode_timestamp(record, now, policy)?;

    Ok(Some(MeasurementRecord {
        timestamp: timestamp.value,
        voltage: field::decode_voltage(record),
        temperature: field::decode_temperature(record),
        acceleration: field::decode_accelerometer(record),
        frequencies: field::decode_frequencies(record),
        amplitudes: field::decode_amplitudes(record),
        timestamp_substituted: timestamp.substituted,
    }))
}
