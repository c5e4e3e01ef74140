//! In-memory sink for development and testing

use crate::{DeviceId, Sink, SinkError};
use async_trait::async_trait;
use dashmap::DashMap;
use sensorlink_wire::MeasurementRecord;
use std::sync::Arc;
use tracing::debug;

/// In-memory sink keeping every record per device
#[derive(Clone, Default)]
pub struct MemorySink {
    /// Per-device records in arrival order
    records: Arc<DashMap<DeviceId, Vec<MeasurementRecord>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Records stored for a device, in arrival order
    pub fn records(&self, device: &DeviceId) -> Vec<MeasurementRecord> {
        self.records
            .get(device)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Total records across all devices
    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices with at least one record
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.records.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn store(&self, device: &DeviceId, record: &MeasurementRecord) -> Result<(), SinkError> {
        debug!("Memory sink store device={} ts={}", device, record.timestamp);
        self.records
            .entry(device.clone())
            .or_insert_with(Vec::new)
            .push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        // Nothing buffered
        Ok(())
    }
}
