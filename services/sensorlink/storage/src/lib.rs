//! Measurement sinks for sensorlink: in-memory, JSON-lines file and channel backends.
//!
//! The decoder hands every validated record to a [`Sink`] together with the
//! id of the device it came from. Delivery is at-least-once from the
//! decoder's side; duplicate suppression happens before the sink is called,
//! so backends store what they are given.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use sensorlink_wire::MeasurementRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Device identifier as known to the sink
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Downstream consumer went away
    #[error("Sink closed")]
    Closed,
}

/// Receiver of decoded measurements
#[async_trait]
pub trait Sink: Send + Sync {
    /// Persist or forward one record
    async fn store(&self, device: &DeviceId, record: &MeasurementRecord) -> Result<(), SinkError>;

    /// Flush buffered records
    async fn flush(&self) -> Result<(), SinkError>;
}

/// Sink backend configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkMode {
    /// Keep records in memory (dev/tests only)
    InMemory,
    /// One JSON-lines file per device
    File {
        /// Data directory path
        data_dir: PathBuf,
    },
}

impl Default for SinkMode {
    fn default() -> Self {
        SinkMode::InMemory
    }
}

// Re-export backend implementations
pub use backend::channel::{ChannelSink, SinkItem};
pub use backend::file::{read_records, FileSink};
pub use backend::mem::MemorySink;

/// Create a sink from configuration
pub async fn open_sink(mode: SinkMode) -> Result<Box<dyn Sink>, SinkError> {
    match mode {
        SinkMode::InMemory => Ok(Box::new(MemorySink::new())),
        SinkMode::File { data_dir } => Ok(Box::new(FileSink::new(data_dir).await?)),
    }
}
