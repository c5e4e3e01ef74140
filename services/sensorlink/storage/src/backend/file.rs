//! File-based sink writing one JSON-lines file per device

use crate::{DeviceId, Sink, SinkError};
use async_trait::async_trait;
use sensorlink_wire::MeasurementRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Extension of per-device record files
const RECORD_FILE_EXT: &str = "jsonl";

/// Appends records to `<data_dir>/<device>.jsonl`
pub struct FileSink {
    data_dir: PathBuf,
    /// Open writers per device
    writers: Mutex<HashMap<DeviceId, BufWriter<File>>>,
}

impl FileSink {
    /// Create a file sink, creating the data directory if needed
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        info!("File sink writing to {:?}", data_dir);

        Ok(Self {
            data_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the record file for a device
    pub fn device_path(&self, device: &DeviceId) -> PathBuf {
        device_path(&self.data_dir, device)
    }
}

fn device_path(data_dir: &Path, device: &DeviceId) -> PathBuf {
    let name: String = device
        .0
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    data_dir.join(format!("{}.{}", name, RECORD_FILE_EXT))
}

/// Read back every record stored for a device
pub async fn read_records(
    data_dir: &Path,
    device: &DeviceId,
) -> Result<Vec<MeasurementRecord>, SinkError> {
    let path = device_path(data_dir, device);
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[async_trait]
impl Sink for FileSink {
    async fn store(&self, device: &DeviceId, record: &MeasurementRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writers = self.writers.lock().await;
        if !writers.contains_key(device) {
            let path = self.device_path(device);
            debug!("Opening record file {:?}", path);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            writers.insert(device.clone(), BufWriter::new(file));
        }

        if let Some(writer) = writers.get_mut(device) {
            writer.write_all(&line).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut writers = self.writers.lock().await;
        for (device, writer) in writers.iter_mut() {
            debug!("Flushing record file for {}", device);
            writer.flush().await?;
        }
        Ok(())
    }
}
