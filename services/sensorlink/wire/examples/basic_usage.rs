//! Basic usage example for the sensorlink wire format.

use sensorlink_wire::{
    build_packet, decode_record, Acceleration, Assembly, FrameReassembler, MeasurementRecord,
    Packet, PacketOutcome, PacketProcessor, TimestampPolicy,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Sensorlink Wire Format Example ===\n");

    let now = 1_700_100_000;
    let reading = MeasurementRecord {
        timestamp: 1_700_000_000,
        voltage: 3.7,
        temperature: 25.0,
        acceleration: Acceleration { x: 12, y: -7, z: 1024 },
        frequencies: [120, 240, 360, 480],
        amplitudes: [300, 150, 75, 30],
        timestamp_substituted: false,
    };

    // 1. Encode and decode a single record
    println!("1. Encoding one 30-byte record...");
    let raw = reading.encode();
    println!("   Raw record: {}", sensorlink_wire::hex::encode(&raw));
    let decoded = decode_record(&raw, now, TimestampPolicy::Substitute)?;
    println!("   Decoded: {:?}", decoded);

    // 2. Build a packet and feed it as uneven fragments
    println!("\n2. Reassembling a packet from fragments...");
    let packet = build_packet(&[reading.clone(), reading])?;
    let bytes = packet.as_bytes().clone();
    let mut reassembler = FrameReassembler::new();

    // The 4-byte time sync echo is discarded
    reassembler.push(&[0x65, 0x53, 0xf1, 0x00]);
    let mut assembled = None;
    for fragment in bytes.chunks(100) {
        if let Assembly::Ready(packet) = reassembler.push(fragment) {
            assembled = Some(packet);
        }
    }
    let assembled = assembled.ok_or("packet did not assemble")?;
    println!("   Assembled {} bytes", assembled.as_bytes().len());

    // 3. Process packets with session dedup
    println!("\n3. Processing packets...");
    let mut processor = PacketProcessor::new(TimestampPolicy::Substitute);
    for candidate in [assembled.clone(), assembled, Packet::terminal()] {
        match processor.process(&candidate, now) {
            PacketOutcome::Records(summary) => println!(
                "   {} new records, {} duplicate timestamps, {} empty slots",
                summary.records.len(),
                summary.duplicate_timestamps,
                summary.empty_slots
            ),
            PacketOutcome::Duplicate => println!("   Duplicate packet skipped"),
            PacketOutcome::Terminal => println!("   Terminal sentinel: end of log"),
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
