//! Channel sink forwarding records to an in-process consumer

use crate::{DeviceId, Sink, SinkError};
use async_trait::async_trait;
use sensorlink_wire::MeasurementRecord;
use tokio::sync::mpsc;
use tracing::trace;

/// Item carried by a [`ChannelSink`]
pub type SinkItem = (DeviceId, MeasurementRecord);

/// Forwards every record over a bounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkItem>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn store(&self, device: &DeviceId, record: &MeasurementRecord) -> Result<(), SinkError> {
        trace!("Forwarding record device={} ts={}", device, record.timestamp);
        self.tx
            .send((device.clone(), record.clone()))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
