//! Device session driver.
//!
//! Runs one historical retrieval and, when enabled, keeps the same transport
//! in live streaming mode until stopped.

use crate::error::SessionError;
use crate::retrieval::{Retrieval, RetrievalReport, MAX_PACKETS};
use crate::streaming::{LiveStream, StreamReport};
use crate::transport::GattTransport;
use sensorlink_storage::{DeviceId, Sink};
use sensorlink_wire::{TimestampPolicy, MAX_READS_PER_PACKET};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Default wait for the notification that completes the streaming handoff
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a device session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Device records are stored under
    pub device_id: DeviceId,
    /// Packets read per retrieval, terminal sentinel excluded
    pub max_packets: u32,
    /// Fragment reads allowed per packet
    pub max_reads_per_packet: u32,
    /// Wait for the handoff notification
    pub handoff_timeout: Duration,
    /// What to do with implausible device timestamps
    pub timestamp_policy: TimestampPolicy,
    /// Stream live measurements after the retrieval
    pub live_streaming: bool,
    /// Go straight to live streaming
    pub skip_history: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::new("sensor"),
            max_packets: MAX_PACKETS,
            max_reads_per_packet: MAX_READS_PER_PACKET,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            timestamp_policy: TimestampPolicy::default(),
            live_streaming: false,
            skip_history: false,
        }
    }
}

/// Outcome of a device session
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSessionReport {
    /// Historical retrieval, unless skipped
    pub retrieval: Option<RetrievalReport>,
    /// Live stream, if one ran
    pub stream: Option<StreamReport>,
}

impl DeviceSessionReport {
    /// Records emitted across both modes
    pub fn records_emitted(&self) -> u64 {
        let historical = self
            .retrieval
            .as_ref()
            .map_or(0, |r| r.stats.records_emitted);
        let live = self.stream.as_ref().map_or(0, |s| s.stats.records_emitted);
        historical + live
    }
}

/// Drives one connected device through retrieval and live streaming
pub struct DeviceSession;

impl DeviceSession {
    /// Run a session on an already connected transport
    pub async fn run<T: GattTransport + ?Sized>(
        transport: &mut T,
        sink: &dyn Sink,
        config: SessionConfig,
        stop: watch::Receiver<bool>,
    ) -> Result<DeviceSessionReport, SessionError> {
        info!("Starting session for {}", config.device_id);

        let retrieval = if config.skip_history {
            info!("Skipping historical log for {}", config.device_id);
            None
        } else {
            Some(Retrieval::new(config.clone()).run(transport, sink).await?)
        };

        let aborted = retrieval.as_ref().is_some_and(|r| r.is_aborted());
        let stream = if config.live_streaming && !aborted {
            let live = LiveStream::new(config.device_id.clone(), config.timestamp_policy);
            Some(live.run(transport, sink, stop).await?)
        } else {
            None
        };

        let report = DeviceSessionReport { retrieval, stream };
        info!(
            "Session for {} ended with {} records",
            config.device_id,
            report.records_emitted()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{AbortReason, RetrievalState};
    use crate::streaming::StreamEnd;
    use crate::transport::{Characteristic, ScriptedRead, ScriptedTransport, TransportError};
    use bytes::Bytes;
    use sensorlink_storage::MemorySink;
    use sensorlink_wire::{Acceleration, MeasurementRecord, Packet};

    fn notification(timestamp: u32) -> Bytes {
        let record = MeasurementRecord {
            timestamp,
            voltage: 3.3,
            temperature: 19.0,
            acceleration: Acceleration { x: 0, y: 0, z: 1 },
            frequencies: [1, 2, 3, 4],
            amplitudes: [4, 3, 2, 1],
            timestamp_substituted: false,
        };
        Bytes::copy_from_slice(&record.encode())
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.max_packets, 8);
        assert_eq!(config.max_reads_per_packet, 200);
        assert_eq!(config.handoff_timeout, Duration::from_secs(10));
        assert!(!config.live_streaming);
    }

    #[tokio::test]
    async fn test_retrieval_then_live_stream() {
        let mut transport = ScriptedTransport::new();
        transport.push_fragment(vec![0u8; 4]);
        transport.push_fragment(Packet::terminal().as_bytes().clone());
        transport.push_burst(vec![notification(1_700_000_100)]);
        transport.push_burst(vec![notification(1_700_000_200), notification(1_700_000_260)]);

        let config = SessionConfig {
            live_streaming: true,
            ..SessionConfig::default()
        };
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = DeviceSession::run(&mut transport, &sink, config, stop_rx)
            .await
            .unwrap();

        let retrieval = report.retrieval.as_ref().unwrap();
        assert_eq!(retrieval.final_state, RetrievalState::Done);
        assert_eq!(retrieval.handoff.as_ref().unwrap().timestamp, 1_700_000_100);

        let stream = report.stream.as_ref().unwrap();
        assert_eq!(stream.end, StreamEnd::SourceClosed);
        assert_eq!(report.records_emitted(), 2);
        assert_eq!(transport.subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_aborted_retrieval_skips_live_stream() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(ScriptedRead::Disconnect);

        let config = SessionConfig {
            live_streaming: true,
            ..SessionConfig::default()
        };
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = DeviceSession::run(&mut transport, &sink, config, stop_rx)
            .await
            .unwrap();
        assert_eq!(
            report.retrieval.unwrap().final_state,
            RetrievalState::Aborted(AbortReason::Disconnected)
        );
        assert!(report.stream.is_none());
    }

    #[tokio::test]
    async fn test_live_subscribe_failure_keeps_retrieval_report() {
        let mut transport = ScriptedTransport::new();
        transport.push_fragment(vec![0u8; 4]);
        transport.push_fragment(
            sensorlink_wire::build_packet(&[MeasurementRecord {
                timestamp: 1_700_000_000,
                voltage: 3.3,
                temperature: 19.0,
                acceleration: Acceleration::default(),
                frequencies: [0; 4],
                amplitudes: [0; 4],
                timestamp_substituted: false,
            }])
            .unwrap()
            .as_bytes()
            .clone(),
        );
        transport.fail_subscribe(TransportError::Disconnected);

        let config = SessionConfig {
            max_packets: 1,
            live_streaming: true,
            ..SessionConfig::default()
        };
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = DeviceSession::run(&mut transport, &sink, config, stop_rx)
            .await
            .unwrap();

        let retrieval = report.retrieval.as_ref().unwrap();
        assert_eq!(retrieval.final_state, RetrievalState::Done);
        assert_eq!(retrieval.stats.records_emitted, 1);
        assert_eq!(
            report.stream.as_ref().unwrap().end,
            StreamEnd::Lost(AbortReason::Disconnected)
        );
        assert_eq!(report.records_emitted(), 1);
    }

    #[tokio::test]
    async fn test_skip_history() {
        let mut transport = ScriptedTransport::new();
        transport.push_burst(vec![notification(1_700_000_000)]);

        let config = SessionConfig {
            live_streaming: true,
            skip_history: true,
            ..SessionConfig::default()
        };
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = DeviceSession::run(&mut transport, &sink, config, stop_rx)
            .await
            .unwrap();
        assert!(report.retrieval.is_none());
        assert_eq!(report.records_emitted(), 1);
        assert!(transport.writes_to(Characteristic::LogRead).is_empty());
    }
}
