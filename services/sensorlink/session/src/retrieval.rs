//! Historical log retrieval.
//!
//! ```text
//! Idle -> Handshake -> ReadLoop -> StreamingHandoff -> Done
//!                         |
//!                         +-------> Done            (packet budget reached)
//!                         +-------> Aborted(reason) (read budget, link loss)
//! ```
//!
//! All state for one retrieval lives in a [`RetrievalContext`] that is
//! created when [`Retrieval::run`] starts and dropped when it returns. A new
//! retrieval always starts from `Idle` with an empty dedup set.

use crate::error::SessionError;
use crate::handshake::{is_fatal, send_time_sync, wall_clock_secs, write_device_time};
use crate::session::SessionConfig;
use crate::transport::{require_characteristics, Characteristic, GattTransport, TransportError};
use bytes::Bytes;
use sensorlink_storage::{DeviceId, Sink};
use sensorlink_wire::{
    decode_record, Assembly, FrameReassembler, MeasurementRecord, Packet, PacketOutcome,
    PacketProcessor,
};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default packet budget for one retrieval
pub const MAX_PACKETS: u32 = 8;

/// Characteristics a retrieval needs before it touches the device
pub const REQUIRED_CHARACTERISTICS: [Characteristic; 3] = [
    Characteristic::LogRead,
    Characteristic::Measurement,
    Characteristic::SetTime,
];

/// Why a retrieval stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Read budget exhausted before a full packet arrived
    FrameTimeout,
    /// Link dropped
    Disconnected,
    /// Characteristic disappeared mid-session
    CharacteristicLost(Characteristic),
}

impl AbortReason {
    /// Map a fatal transport error to an abort reason
    pub fn from_transport(error: &TransportError) -> Self {
        match error {
            TransportError::CharacteristicUnavailable(c) => AbortReason::CharacteristicLost(*c),
            // Only fatal errors reach here
            _ => AbortReason::Disconnected,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FrameTimeout => write!(f, "frame timeout"),
            AbortReason::Disconnected => write!(f, "disconnected"),
            AbortReason::CharacteristicLost(c) => write!(f, "{} characteristic lost", c),
        }
    }
}

/// Retrieval state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    /// Not started
    Idle,
    /// Time sync with the device
    Handshake,
    /// Reading packets under the packet budget
    ReadLoop,
    /// Terminal sentinel seen, switching the device to live mode
    StreamingHandoff,
    /// Stopped early
    Aborted(AbortReason),
    /// Finished
    Done,
}

impl RetrievalState {
    /// Whether the state machine has stopped
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetrievalState::Done | RetrievalState::Aborted(_))
    }
}

impl fmt::Display for RetrievalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalState::Idle => write!(f, "idle"),
            RetrievalState::Handshake => write!(f, "handshake"),
            RetrievalState::ReadLoop => write!(f, "read-loop"),
            RetrievalState::StreamingHandoff => write!(f, "streaming-handoff"),
            RetrievalState::Aborted(reason) => write!(f, "aborted ({})", reason),
            RetrievalState::Done => write!(f, "done"),
        }
    }
}

/// Retrieval counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrievalStats {
    /// Packets counted against the budget
    pub packets: u64,
    /// Packets identical to their predecessor
    pub duplicate_packets: u64,
    /// Records handed to the sink successfully
    pub records_emitted: u64,
    /// Slots skipped because their timestamp was already seen
    pub duplicate_timestamps: u64,
    /// Padding slots
    pub empty_slots: u64,
    /// Slots the decoder rejected
    pub rejected_slots: u64,
    /// Records whose implausible timestamp was replaced
    pub substituted_timestamps: u64,
    /// Successful fragment reads
    pub fragment_reads: u64,
    /// Fragment reads that failed without dropping the link
    pub failed_reads: u64,
    /// 4-byte acknowledgment frames discarded
    pub handshake_frames_discarded: u64,
    /// Records the sink failed to store
    pub sink_failures: u64,
}

/// Session-scoped retrieval state
#[derive(Debug)]
pub struct RetrievalContext {
    state: RetrievalState,
    reassembler: FrameReassembler,
    processor: PacketProcessor,
    stats: RetrievalStats,
    handoff: Option<MeasurementRecord>,
}

impl RetrievalContext {
    /// Fresh context in the `Idle` state
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: RetrievalState::Idle,
            reassembler: FrameReassembler::with_max_reads(config.max_reads_per_packet),
            processor: PacketProcessor::new(config.timestamp_policy),
            stats: RetrievalStats::default(),
            handoff: None,
        }
    }

    /// Current state
    pub fn state(&self) -> RetrievalState {
        self.state
    }

    /// Counters so far
    pub fn stats(&self) -> &RetrievalStats {
        &self.stats
    }

    fn transition(&mut self, next: RetrievalState) {
        info!("Retrieval {} -> {}", self.state, next);
        self.state = next;
    }

    fn into_report(mut self) -> RetrievalReport {
        self.stats.handshake_frames_discarded = self.reassembler.handshakes_discarded();
        RetrievalReport {
            final_state: self.state,
            stats: self.stats,
            handoff: self.handoff,
        }
    }
}

/// Outcome of one retrieval
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalReport {
    /// `Done` or `Aborted`
    pub final_state: RetrievalState,
    /// Counters
    pub stats: RetrievalStats,
    /// Record decoded during the streaming handoff, if any
    pub handoff: Option<MeasurementRecord>,
}

impl RetrievalReport {
    /// Whether the retrieval stopped early
    pub fn is_aborted(&self) -> bool {
        matches!(self.final_state, RetrievalState::Aborted(_))
    }
}

/// Historical log retrieval against one device
#[derive(Debug, Clone)]
pub struct Retrieval {
    config: SessionConfig,
}

impl Retrieval {
    /// Create a retrieval for a configured device
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Run the state machine to completion.
    ///
    /// Records are emitted to `sink` as soon as their packet is decoded, so
    /// an aborted retrieval keeps what it already emitted. Errors are
    /// returned only when the device lacks a required characteristic.
    pub async fn run<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        sink: &dyn Sink,
    ) -> Result<RetrievalReport, SessionError> {
        require_characteristics(transport, &REQUIRED_CHARACTERISTICS).map_err(|e| match e {
            TransportError::CharacteristicUnavailable(c) => {
                SessionError::CharacteristicUnavailable(c)
            }
            other => SessionError::Transport(other),
        })?;

        let mut ctx = RetrievalContext::new(&self.config);
        info!(
            "Starting retrieval from {} (packet budget {}, read budget {})",
            self.config.device_id, self.config.max_packets, self.config.max_reads_per_packet
        );

        ctx.transition(RetrievalState::Handshake);
        let next = match self.handshake(transport, &mut ctx).await {
            Ok(()) => RetrievalState::ReadLoop,
            Err(e) => RetrievalState::Aborted(AbortReason::from_transport(&e)),
        };
        ctx.transition(next);

        if ctx.state == RetrievalState::ReadLoop {
            let next = self.read_loop(transport, sink, &mut ctx).await;
            ctx.transition(next);
        }

        if ctx.state == RetrievalState::StreamingHandoff {
            let next = match self.streaming_handoff(transport, &mut ctx).await {
                Ok(()) => RetrievalState::Done,
                Err(e) => RetrievalState::Aborted(AbortReason::from_transport(&e)),
            };
            ctx.transition(next);
        }

        if let Err(e) = sink.flush().await {
            error!("Failed to flush sink for {}: {}", self.config.device_id, e);
            ctx.stats.sink_failures += 1;
        }

        let report = ctx.into_report();
        info!(
            "Retrieval from {} finished {}: {} records from {} packets ({} duplicate packets, {} duplicate timestamps)",
            self.config.device_id,
            report.final_state,
            report.stats.records_emitted,
            report.stats.packets,
            report.stats.duplicate_packets,
            report.stats.duplicate_timestamps
        );
        Ok(report)
    }

    async fn handshake<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        ctx: &mut RetrievalContext,
    ) -> Result<(), TransportError> {
        match send_time_sync(transport, wall_clock_secs()).await? {
            Some(ack) => {
                ctx.stats.fragment_reads += 1;
                if ctx.reassembler.absorb(&ack) {
                    debug!("Acknowledgment carried {} bytes of log data", ack.len());
                }
            }
            None => ctx.stats.failed_reads += 1,
        }
        Ok(())
    }

    async fn read_loop<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        sink: &dyn Sink,
        ctx: &mut RetrievalContext,
    ) -> RetrievalState {
        let mut budget_used = 0;

        while budget_used < self.config.max_packets {
            let packet = match self.next_packet(transport, ctx).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return RetrievalState::Aborted(AbortReason::FrameTimeout),
                Err(e) => {
                    warn!("Transport lost during read loop: {}", e);
                    return RetrievalState::Aborted(AbortReason::from_transport(&e));
                }
            };

            match ctx.processor.process(&packet, wall_clock_secs()) {
                PacketOutcome::Terminal => {
                    info!(
                        "End of historical log after {} packets",
                        ctx.stats.packets
                    );
                    return RetrievalState::StreamingHandoff;
                }
                PacketOutcome::Duplicate => {
                    budget_used += 1;
                    ctx.stats.packets += 1;
                    ctx.stats.duplicate_packets += 1;
                }
                PacketOutcome::Records(summary) => {
                    budget_used += 1;
                    ctx.stats.packets += 1;
                    ctx.stats.empty_slots += summary.empty_slots as u64;
                    ctx.stats.duplicate_timestamps += summary.duplicate_timestamps as u64;
                    ctx.stats.rejected_slots += summary.rejected_slots as u64;
                    ctx.stats.substituted_timestamps += summary.substituted_slots as u64;

                    for record in &summary.records {
                        if emit(sink, &self.config.device_id, record).await {
                            ctx.stats.records_emitted += 1;
                        } else {
                            ctx.stats.sink_failures += 1;
                        }
                    }
                }
            }
        }

        info!("Packet budget of {} reached", self.config.max_packets);
        RetrievalState::Done
    }

    /// Read fragments until a packet is ready. `Ok(None)` means the read
    /// budget ran out.
    async fn next_packet<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        ctx: &mut RetrievalContext,
    ) -> Result<Option<Packet>, TransportError> {
        if let Some(packet) = ctx.reassembler.take_buffered() {
            debug!("Using packet already buffered");
            return Ok(Some(packet));
        }

        loop {
            let assembly = match transport.read(Characteristic::LogRead).await {
                Ok(fragment) => {
                    ctx.stats.fragment_reads += 1;
                    ctx.reassembler.push(&fragment)
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!("Fragment read failed: {}", e);
                    ctx.stats.failed_reads += 1;
                    ctx.reassembler.record_failed_read()
                }
            };

            match assembly {
                Assembly::Ready(packet) => return Ok(Some(packet)),
                Assembly::Exhausted => return Ok(None),
                Assembly::Pending => {}
            }
        }
    }

    async fn streaming_handoff<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        ctx: &mut RetrievalContext,
    ) -> Result<(), TransportError> {
        let mut notifications = match transport.subscribe(Characteristic::Measurement).await {
            Ok(rx) => rx,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("Could not subscribe for handoff: {}", e);
                return Ok(());
            }
        };

        if let Some(payload) = self.await_handoff(&mut notifications).await {
            match decode_record(&payload, wall_clock_secs(), self.config.timestamp_policy) {
                Ok(Some(record)) => {
                    write_device_time(transport, record.timestamp).await?;
                    info!("Device switched to live mode at {}", record.timestamp);
                    ctx.handoff = Some(record);
                }
                Ok(None) => warn!("Handoff notification carried no reading"),
                Err(e) => warn!("Handoff notification rejected: {}", e),
            }
        }
        drop(notifications);

        match transport.unsubscribe(Characteristic::Measurement).await {
            Ok(()) => Ok(()),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!("Unsubscribe after handoff failed: {}", e);
                Ok(())
            }
        }
    }

    async fn await_handoff(&self, notifications: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
        match tokio::time::timeout(self.config.handoff_timeout, notifications.recv()).await {
            Ok(Some(payload)) => Some(payload),
            Ok(None) => {
                warn!("Notification source closed before the handoff record");
                None
            }
            Err(_) => {
                warn!(
                    "No handoff notification within {:?}",
                    self.config.handoff_timeout
                );
                None
            }
        }
    }
}

/// Hand one record to the sink; failures are logged and reported as `false`
pub(crate) async fn emit(sink: &dyn Sink, device: &DeviceId, record: &MeasurementRecord) -> bool {
    match sink.store(device, record).await {
        Ok(()) => {
            debug!("Stored record {} for {}", record.timestamp, device);
            true
        }
        Err(e) => {
            error!(
                "Sink failed to store record {} for {}: {}",
                record.timestamp, device, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use async_trait::async_trait;
    use sensorlink_storage::{MemorySink, SinkError};
    use sensorlink_wire::{build_packet, Acceleration};

    fn reading(timestamp: u32) -> MeasurementRecord {
        MeasurementRecord {
            timestamp,
            voltage: 3.7,
            temperature: 25.0,
            acceleration: Acceleration { x: 0, y: 0, z: 0 },
            frequencies: [0; 4],
            amplitudes: [0; 4],
            timestamp_substituted: false,
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn store(&self, _device: &DeviceId, _record: &MeasurementRecord) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RetrievalState::ReadLoop.to_string(), "read-loop");
        assert_eq!(
            RetrievalState::Aborted(AbortReason::FrameTimeout).to_string(),
            "aborted (frame timeout)"
        );
        assert!(RetrievalState::Done.is_terminal());
        assert!(!RetrievalState::StreamingHandoff.is_terminal());
    }

    #[test]
    fn test_abort_reason_from_transport() {
        assert_eq!(
            AbortReason::from_transport(&TransportError::Disconnected),
            AbortReason::Disconnected
        );
        assert_eq!(
            AbortReason::from_transport(&TransportError::CharacteristicUnavailable(
                Characteristic::SetTime
            )),
            AbortReason::CharacteristicLost(Characteristic::SetTime)
        );
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_fatal() {
        let mut transport = ScriptedTransport::new();
        transport.push_fragment(build_packet(&[reading(1_700_000_000)]).unwrap().as_bytes().clone());

        let config = SessionConfig {
            max_packets: 1,
            ..SessionConfig::default()
        };
        let report = Retrieval::new(config)
            .run(&mut transport, &FailingSink)
            .await
            .unwrap();

        assert_eq!(report.final_state, RetrievalState::Done);
        assert_eq!(report.stats.sink_failures, 1);
        assert_eq!(report.stats.records_emitted, 0);
    }

    #[tokio::test]
    async fn test_ack_with_log_data_is_kept() {
        let packet = build_packet(&[reading(1_700_000_000)]).unwrap();
        let mut transport = ScriptedTransport::new();
        // Acknowledgment read already returns a whole packet
        transport.push_fragment(packet.as_bytes().clone());

        let config = SessionConfig {
            max_packets: 1,
            ..SessionConfig::default()
        };
        let sink = MemorySink::new();
        let report = Retrieval::new(config).run(&mut transport, &sink).await.unwrap();

        assert_eq!(report.final_state, RetrievalState::Done);
        assert_eq!(report.stats.records_emitted, 1);
        assert_eq!(report.stats.fragment_reads, 1);
    }
}
