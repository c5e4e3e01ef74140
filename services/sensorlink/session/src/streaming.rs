//! Live measurement streaming.
//!
//! In live mode every notification carries a single record. There is no
//! packet framing, no read budget and no dedup: each decoded record is
//! acknowledged by writing its timestamp to the set-time characteristic and
//! then emitted.

use crate::error::SessionError;
use crate::handshake::{is_fatal, wall_clock_secs, write_device_time};
use crate::retrieval::{emit, AbortReason};
use crate::transport::{Characteristic, GattTransport, TransportError};
use sensorlink_storage::{DeviceId, Sink};
use sensorlink_wire::{decode_record, TimestampPolicy, WireError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a live stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Stop signal fired
    Stopped,
    /// Notification channel closed
    SourceClosed,
    /// Notification subscription refused while the link stayed up
    SubscribeFailed,
    /// Link or characteristic lost
    Lost(AbortReason),
}

/// Live stream counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Notifications received
    pub notifications: u64,
    /// Records handed to the sink successfully
    pub records_emitted: u64,
    /// Notifications too short or decoding to padding
    pub skipped: u64,
    /// Notifications the decoder rejected
    pub rejected: u64,
    /// Set-time writes that failed without dropping the link
    pub time_writes_failed: u64,
    /// Records the sink failed to store
    pub sink_failures: u64,
}

/// Outcome of a live stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamReport {
    /// Why the stream ended
    pub end: StreamEnd,
    /// Counters
    pub stats: StreamStats,
}

/// Live measurement handler for one device
#[derive(Debug, Clone)]
pub struct LiveStream {
    device_id: DeviceId,
    policy: TimestampPolicy,
}

impl LiveStream {
    /// Create a handler emitting records for `device_id`
    pub fn new(device_id: DeviceId, policy: TimestampPolicy) -> Self {
        Self { device_id, policy }
    }

    /// Stream until `stop` fires or the notification source closes.
    ///
    /// Fails only if the device lacks the measurement characteristic.
    /// Transport failures once streaming starts, subscription included, end
    /// the stream and are reported in [`StreamReport::end`]. Dropping the
    /// stop sender counts as a stop signal.
    pub async fn run<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        sink: &dyn Sink,
        mut stop: watch::Receiver<bool>,
    ) -> Result<StreamReport, SessionError> {
        if !transport.has_characteristic(Characteristic::Measurement) {
            return Err(SessionError::CharacteristicUnavailable(
                Characteristic::Measurement,
            ));
        }

        let mut stats = StreamStats::default();
        let mut notifications = match transport.subscribe(Characteristic::Measurement).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Live stream from {} could not subscribe: {}", self.device_id, e);
                let end = if is_fatal(&e) {
                    StreamEnd::Lost(AbortReason::from_transport(&e))
                } else {
                    StreamEnd::SubscribeFailed
                };
                return Ok(StreamReport { end, stats });
            }
        };
        info!("Live streaming from {}", self.device_id);

        let mut end = if *stop.borrow() {
            Some(StreamEnd::Stopped)
        } else {
            None
        };

        while end.is_none() {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        end = Some(StreamEnd::Stopped);
                    }
                }

                notification = notifications.recv() => {
                    let Some(payload) = notification else {
                        end = Some(StreamEnd::SourceClosed);
                        break;
                    };
                    stats.notifications += 1;
                    if let Err(e) = self.handle(transport, sink, &payload, &mut stats).await {
                        warn!("Live stream from {} lost: {}", self.device_id, e);
                        end = Some(StreamEnd::Lost(AbortReason::from_transport(&e)));
                    }
                }
            }
        }
        drop(notifications);

        let mut end = end.unwrap_or(StreamEnd::SourceClosed);
        if !matches!(end, StreamEnd::Lost(_)) {
            match transport.unsubscribe(Characteristic::Measurement).await {
                Ok(()) => {}
                // A source that closed because the link dropped is a loss
                Err(e) if is_fatal(&e) && end == StreamEnd::SourceClosed => {
                    debug!("Notification source closed with the link: {}", e);
                    end = StreamEnd::Lost(AbortReason::from_transport(&e));
                }
                Err(e) if is_fatal(&e) => debug!("Unsubscribe skipped: {}", e),
                Err(e) => warn!("Unsubscribe failed: {}", e),
            }
        }
        if let Err(e) = sink.flush().await {
            warn!("Failed to flush sink after live stream: {}", e);
            stats.sink_failures += 1;
        }

        info!(
            "Live stream from {} ended ({:?}): {} records from {} notifications",
            self.device_id, end, stats.records_emitted, stats.notifications
        );
        Ok(StreamReport { end, stats })
    }

    async fn handle<T: GattTransport + ?Sized>(
        &self,
        transport: &mut T,
        sink: &dyn Sink,
        payload: &[u8],
        stats: &mut StreamStats,
    ) -> Result<(), TransportError> {
        let record = match decode_record(payload, wall_clock_secs(), self.policy) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Notification carried no reading");
                stats.skipped += 1;
                return Ok(());
            }
            Err(WireError::ShortRecord(len)) => {
                debug!("Skipping {}-byte notification", len);
                stats.skipped += 1;
                return Ok(());
            }
            Err(e) => {
                warn!("Notification rejected: {}", e);
                stats.rejected += 1;
                return Ok(());
            }
        };

        if !write_device_time(transport, record.timestamp).await? {
            stats.time_writes_failed += 1;
        }

        if emit(sink, &self.device_id, &record).await {
            stats.records_emitted += 1;
        } else {
            stats.sink_failures += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedTransport, ScriptedWrite};
    use bytes::Bytes;
    use sensorlink_storage::MemorySink;
    use sensorlink_wire::{Acceleration, MeasurementRecord};
    use std::time::Duration;

    fn notification(timestamp: u32) -> Bytes {
        let record = MeasurementRecord {
            timestamp,
            voltage: 3.6,
            temperature: 21.5,
            acceleration: Acceleration { x: 3, y: 2, z: 1 },
            frequencies: [50, 60, 70, 80],
            amplitudes: [5, 6, 7, 8],
            timestamp_substituted: false,
        };
        Bytes::copy_from_slice(&record.encode())
    }

    #[tokio::test]
    async fn test_stream_until_source_closes() {
        let mut transport = ScriptedTransport::new();
        transport.push_burst(vec![
            notification(1_700_000_000),
            Bytes::from_static(&[1, 2, 3]),
            notification(1_700_000_000),
            Bytes::from(vec![0u8; 30]),
        ]);
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();

        assert_eq!(report.end, StreamEnd::SourceClosed);
        assert_eq!(report.stats.notifications, 4);
        assert_eq!(report.stats.records_emitted, 2);
        assert_eq!(report.stats.skipped, 2);
        assert_eq!(sink.records(&DeviceId::new("vib-01")).len(), 2);
        assert_eq!(transport.writes_to(Characteristic::SetTime).len(), 2);
    }

    #[tokio::test]
    async fn test_stop_signal_unsubscribes() {
        let mut transport = ScriptedTransport::new().hold_open(true);
        let sink = MemorySink::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = stop_tx.send(true);
        });

        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();
        assert_eq!(report.end, StreamEnd::Stopped);
        assert!(!transport.is_subscribed());
    }

    #[tokio::test]
    async fn test_failed_time_write_still_emits() {
        let mut transport = ScriptedTransport::new();
        transport.push_burst(vec![notification(1_700_000_000), notification(1_700_000_060)]);
        transport.push_write(Characteristic::SetTime, ScriptedWrite::Failure);
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();

        assert_eq!(report.end, StreamEnd::SourceClosed);
        assert_eq!(report.stats.records_emitted, 2);
        assert_eq!(report.stats.time_writes_failed, 1);
        assert_eq!(transport.writes_to(Characteristic::SetTime).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_on_time_write_loses_stream() {
        let mut transport = ScriptedTransport::new();
        transport.push_burst(vec![notification(1_700_000_000), notification(1_700_000_060)]);
        transport.push_write(Characteristic::SetTime, ScriptedWrite::Disconnect);
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();

        assert_eq!(report.end, StreamEnd::Lost(AbortReason::Disconnected));
        assert_eq!(report.stats.notifications, 1);
        assert_eq!(report.stats.records_emitted, 0);
        assert!(sink.records(&DeviceId::new("vib-01")).is_empty());
    }

    #[tokio::test]
    async fn test_link_drop_closes_source_as_loss() {
        let mut transport = ScriptedTransport::new();
        transport.push_burst(Vec::new());
        transport.drop_link_after_burst();
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();

        assert_eq!(report.end, StreamEnd::Lost(AbortReason::Disconnected));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let mut transport = ScriptedTransport::new();
        transport.fail_subscribe(TransportError::Io("busy".into()));
        transport.fail_subscribe(TransportError::Disconnected);
        let sink = MemorySink::new();
        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();
        assert_eq!(report.end, StreamEnd::SubscribeFailed);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();
        assert_eq!(report.end, StreamEnd::Lost(AbortReason::Disconnected));
    }

    #[tokio::test]
    async fn test_missing_measurement_characteristic() {
        let mut transport = ScriptedTransport::new().without(Characteristic::Measurement);
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        assert_eq!(
            stream.run(&mut transport, &sink, stop_rx).await,
            Err(SessionError::CharacteristicUnavailable(Characteristic::Measurement))
        );
    }

    #[tokio::test]
    async fn test_already_stopped() {
        let mut transport = ScriptedTransport::new().hold_open(true);
        transport.push_burst(vec![notification(1_700_000_000)]);
        let sink = MemorySink::new();
        let (_stop_tx, stop_rx) = watch::channel(true);

        let stream = LiveStream::new(DeviceId::new("vib-01"), TimestampPolicy::default());
        let report = stream.run(&mut transport, &sink, stop_rx).await.unwrap();
        assert_eq!(report.end, StreamEnd::Stopped);
        assert_eq!(report.stats.notifications, 0);
    }
}
