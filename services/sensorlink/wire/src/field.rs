//! Fixed-offset field codec for the 30-byte measurement record.
//!
//! ```text
//! +---------+------------------+--------------------------------------+
//! | offset  | field            | encoding                             |
//! +---------+------------------+--------------------------------------+
//! | [0,4)   | timestamp        | u32 BE, seconds since epoch          |
//! | [4,6)   | temperature      | i16 BE, tenths of a degree C         |
//! | [6,12)  | accel x, y, z    | i16 BE each, raw units               |
//! | [12,20) | freq 1..4        | u16 BE each, Hz                      |
//! | [20,28) | ampl 1..4        | u16 BE each, raw units               |
//! | [28,30) | voltage          | u16 BE, millivolts                   |
//! +---------+------------------+--------------------------------------+
//! ```
//!
//! Decoders never fail on field content. Suspicious values are logged and
//! passed through; only the timestamp has a substitution/rejection policy.

use crate::WireError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Size of one measurement record (one packet slot)
pub const RECORD_SIZE: usize = 30;

/// One raw record
pub type RawRecord = [u8; RECORD_SIZE];

/// Earliest timestamp accepted as plausible (2020-09-13)
pub const MIN_PLAUSIBLE_TIMESTAMP: u32 = 1_600_000_000;

/// How far into the future a device clock may run before it is considered wrong
pub const MAX_CLOCK_LEAD_SECS: u32 = 365 * 24 * 3600;

/// Plausible temperature range in degrees C
pub const TEMPERATURE_RANGE_C: (f32, f32) = (-40.0, 125.0);

/// Frequencies above this are logged as suspicious
pub const MAX_PLAUSIBLE_FREQUENCY_HZ: u16 = 20_000;

/// Amplitudes above this are logged as suspicious
pub const MAX_PLAUSIBLE_AMPLITUDE: u16 = 5_000;

const TIMESTAMP_OFFSET: usize = 0;
const TEMPERATURE_OFFSET: usize = 4;
const ACCEL_OFFSET: usize = 6;
const FREQUENCY_OFFSET: usize = 12;
const AMPLITUDE_OFFSET: usize = 20;
const VOLTAGE_OFFSET: usize = 28;

/// What to do with a timestamp outside the plausible window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    /// Replace with the current wall-clock time and flag the record
    #[default]
    Substitute,
    /// Reject the record
    Reject,
}

/// Decoded timestamp field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampField {
    /// Timestamp in seconds since epoch
    pub value: u32,
    /// Raw value was out of range and `value` is the wall-clock time instead
    pub substituted: bool,
}

/// Raw accelerometer sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acceleration {
    /// X axis
    pub x: i16,
    /// Y axis
    pub y: i16,
    /// Z axis
    pub z: i16,
}

/// View a slot as a raw record, rejecting anything shorter than 30 bytes.
///
/// Longer input is truncated to the first 30 bytes.
pub fn raw_record(bytes: &[u8]) -> Result<&RawRecord, WireError> {
    bytes
        .get(..RECORD_SIZE)
        .and_then(|head| head.try_into().ok())
        .ok_or(WireError::ShortRecord(bytes.len()))
}

fn read_u16(record: &RawRecord, offset: usize) -> u16 {
    u16::from_be_bytes([record[offset], record[offset + 1]])
}

fn read_i16(record: &RawRecord, offset: usize) -> i16 {
    i16::from_be_bytes([record[offset], record[offset + 1]])
}

fn write_u16(record: &mut RawRecord, offset: usize, value: u16) {
    record[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_i16(record: &mut RawRecord, offset: usize, value: i16) {
    record[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Raw timestamp bytes as stored, without any plausibility check
pub fn raw_timestamp(record: &RawRecord) -> u32 {
    u32::from_be_bytes([
        record[TIMESTAMP_OFFSET],
        record[TIMESTAMP_OFFSET + 1],
        record[TIMESTAMP_OFFSET + 2],
        record[TIMESTAMP_OFFSET + 3],
    ])
}

/// Whether a timestamp lies in `[MIN_PLAUSIBLE_TIMESTAMP, now + MAX_CLOCK_LEAD_SECS]`
pub fn is_plausible_timestamp(timestamp: u32, now: u32) -> bool {
    let upper = now.saturating_add(MAX_CLOCK_LEAD_SECS);
    (MIN_PLAUSIBLE_TIMESTAMP..=upper).contains(&timestamp)
}

/// Decode the timestamp, applying `policy` when it is out of range
pub fn decode_timestamp(
    record: &RawRecord,
    now: u32,
    policy: TimestampPolicy,
) -> Result<TimestampField, WireError> {
    let raw = raw_timestamp(record);
    if is_plausible_timestamp(raw, now) {
        return Ok(TimestampField {
            value: raw,
            substituted: false,
        });
    }

    match policy {
        TimestampPolicy::Substitute => {
            warn!(
                "Implausible device timestamp {} (now {}), substituting wall-clock time",
                raw, now
            );
            Ok(TimestampField {
                value: now,
                substituted: true,
            })
        }
        TimestampPolicy::Reject => Err(WireError::InvalidTimestamp(raw)),
    }
}

/// Battery voltage in volts
pub fn decode_voltage(record: &RawRecord) -> f32 {
    read_u16(record, VOLTAGE_OFFSET) as f32 / 1000.0
}

/// Temperature in degrees C
pub fn decode_temperature(record: &RawRecord) -> f32 {
    let celsius = read_i16(record, TEMPERATURE_OFFSET) as f32 / 10.0;
    let (low, high) = TEMPERATURE_RANGE_C;
    if !(low..=high).contains(&celsius) {
        warn!("Temperature {:.1}C outside sensor range", celsius);
    }
    celsius
}

/// Accelerometer axes
pub fn decode_accelerometer(record: &RawRecord) -> Acceleration {
    Acceleration {
        x: read_i16(record, ACCEL_OFFSET),
        y: read_i16(record, ACCEL_OFFSET + 2),
        z: read_i16(record, ACCEL_OFFSET + 4),
    }
}

/// The four dominant vibration frequencies in Hz
pub fn decode_frequencies(record: &RawRecord) -> [u16; 4] {
    let freqs = std::array::from_fn(|i| read_u16(record, FREQUENCY_OFFSET + 2 * i));
    for (i, freq) in freqs.iter().enumerate() {
        if *freq > MAX_PLAUSIBLE_FREQUENCY_HZ {
            warn!("Suspicious frequency {}: {} Hz", i + 1, freq);
        }
    }
    freqs
}

/// The four amplitudes matching [`decode_frequencies`]
pub fn decode_amplitudes(record: &RawRecord) -> [u16; 4] {
    let ampls = std::array::from_fn(|i| read_u16(record, AMPLITUDE_OFFSET + 2 * i));
    for (i, ampl) in ampls.iter().enumerate() {
        if *ampl > MAX_PLAUSIBLE_AMPLITUDE {
            warn!("Suspicious amplitude {}: {}", i + 1, ampl);
        }
    }
    ampls
}

/// Write a timestamp
pub fn encode_timestamp(record: &mut RawRecord, timestamp: u32) {
    record[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&timestamp.to_be_bytes());
}

/// Write a voltage, rounded to the nearest millivolt
pub fn encode_voltage(record: &mut RawRecord, volts: f32) {
    write_u16(record, VOLTAGE_OFFSET, (volts * 1000.0).round() as u16);
}

/// Write a temperature, rounded to the nearest tenth of a degree
pub fn encode_temperature(record: &mut RawRecord, celsius: f32) {
    write_i16(record, TEMPERATURE_OFFSET, (celsius * 10.0).round() as i16);
}

/// Write accelerometer axes
pub fn encode_accelerometer(record: &mut RawRecord, accel: Acceleration) {
    write_i16(record, ACCEL_OFFSET, accel.x);
    write_i16(record, ACCEL_OFFSET + 2, accel.y);
    write_i16(record, ACCEL_OFFSET + 4, accel.z);
}

/// Write frequencies
pub fn encode_frequencies(record: &mut RawRecord, freqs: [u16; 4]) {
    for (i, freq) in freqs.into_iter().enumerate() {
        write_u16(record, FREQUENCY_OFFSET + 2 * i, freq);
    }
}

/// Write amplitudes
pub fn encode_amplitudes(record: &mut RawRecord, ampls: [u16; 4]) {
    for (i, ampl) in ampls.into_iter().enumerate() {
        write_u16(record, AMPLITUDE_OFFSET + 2 * i, ampl);
    }
}
