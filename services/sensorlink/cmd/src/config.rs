//! Configuration handling for the sensorlink binary.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags, each layer overriding the previous one.

use anyhow::{Context, Result};
use sensorlink_session::{SessionConfig, MAX_PACKETS};
use sensorlink_storage::{DeviceId, SinkMode};
use sensorlink_wire::{TimestampPolicy, MAX_READS_PER_PACKET};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Sensorlink configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorLinkConfig {
    /// Device identity
    pub device: DeviceConfig,
    /// Historical log retrieval
    pub retrieval: RetrievalConfig,
    /// Live streaming
    pub streaming: StreamingConfig,
    /// Record sink
    pub sink: SinkConfig,
}

/// Device identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Id records are stored under
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "sensor".to_string(),
        }
    }
}

/// Retrieval budgets and policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Packets per retrieval
    pub max_packets: u32,
    /// Fragment reads per packet
    pub max_reads_per_packet: u32,
    /// Wait for the handoff notification, e.g. "10s"
    pub handoff_timeout: String,
    /// substitute or reject
    pub timestamp_policy: TimestampPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_packets: MAX_PACKETS,
            max_reads_per_packet: MAX_READS_PER_PACKET,
            handoff_timeout: "10s".to_string(),
            timestamp_policy: TimestampPolicy::default(),
        }
    }
}

/// Live streaming settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Stream after the retrieval
    pub enabled: bool,
    /// Notification channel capacity
    pub notification_buffer: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notification_buffer: 32,
        }
    }
}

/// Sink backend name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Keep records in memory and print them at exit
    #[default]
    Memory,
    /// JSON-lines file per device
    File,
}

impl std::str::FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(SinkKind::Memory),
            "file" => Ok(SinkKind::File),
            other => anyhow::bail!("Unknown sink mode: {}", other),
        }
    }
}

/// Sink settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Backend
    pub mode: SinkKind,
    /// Directory for the file backend
    pub data_dir: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: SinkKind::Memory,
            data_dir: PathBuf::from("./sensordata"),
        }
    }
}

impl SinkConfig {
    /// Backend selection for the storage crate
    pub fn sink_mode(&self) -> SinkMode {
        match self.mode {
            SinkKind::Memory => SinkMode::InMemory,
            SinkKind::File => SinkMode::File {
                data_dir: self.data_dir.clone(),
            },
        }
    }
}

impl SensorLinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<SensorLinkConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: device={}, max_packets={}, max_reads={}, sink={:?}",
            config.device.device_id,
            config.retrieval.max_packets,
            config.retrieval.max_reads_per_packet,
            config.sink.mode
        );
        config
    }

    /// Apply `SENSORLINK_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device_id) = lookup("SENSORLINK_DEVICE_ID") {
            info!("Device id overridden by environment: {}", device_id);
            self.device.device_id = device_id;
        }

        if let Some(max_packets) = lookup("SENSORLINK_MAX_PACKETS") {
            match max_packets.parse::<u32>() {
                Ok(value) => {
                    self.retrieval.max_packets = value;
                    info!("Packet budget overridden by environment: {}", value);
                }
                Err(_) => warn!("Ignoring invalid SENSORLINK_MAX_PACKETS={}", max_packets),
            }
        }

        if let Some(mode) = lookup("SENSORLINK_SINK_MODE") {
            match mode.parse::<SinkKind>() {
                Ok(kind) => {
                    self.sink.mode = kind;
                    info!("Sink mode overridden by environment: {:?}", kind);
                }
                Err(e) => warn!("Ignoring SENSORLINK_SINK_MODE: {}", e),
            }
        }

        if let Some(data_dir) = lookup("SENSORLINK_DATA_DIR") {
            self.sink.data_dir = PathBuf::from(data_dir);
            info!("Data directory overridden by environment: {:?}", self.sink.data_dir);
        }
    }

    /// Session settings for the session crate
    pub fn session_config(&self) -> Result<SessionConfig> {
        let handoff_timeout = humantime::parse_duration(&self.retrieval.handoff_timeout)
            .with_context(|| {
                format!(
                    "Invalid retrieval.handoff_timeout '{}'",
                    self.retrieval.handoff_timeout
                )
            })?;

        Ok(SessionConfig {
            device_id: DeviceId::new(self.device.device_id.clone()),
            max_packets: self.retrieval.max_packets,
            max_reads_per_packet: self.retrieval.max_reads_per_packet,
            handoff_timeout,
            timestamp_policy: self.retrieval.timestamp_policy,
            live_streaming: self.streaming.enabled,
            skip_history: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SensorLinkConfig::default();
        assert_eq!(config.device.device_id, "sensor");
        assert_eq!(config.retrieval.max_packets, 8);
        assert_eq!(config.retrieval.max_reads_per_packet, 200);
        assert_eq!(config.sink.sink_mode(), SinkMode::InMemory);

        let session = config.session_config().unwrap();
        assert_eq!(session.handoff_timeout, Duration::from_secs(10));
        assert_eq!(session.timestamp_policy, TimestampPolicy::Substitute);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
device:
  device_id: vib-07
retrieval:
  max_packets: 4
  handoff_timeout: 2s 500ms
  timestamp_policy: reject
streaming:
  enabled: true
sink:
  mode: file
  data_dir: /var/lib/sensorlink
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = SensorLinkConfig::load_from_file(temp_file.path());

        assert_eq!(config.device.device_id, "vib-07");
        assert_eq!(config.retrieval.max_packets, 4);
        assert_eq!(config.retrieval.max_reads_per_packet, 200);
        assert_eq!(
            config.sink.sink_mode(),
            SinkMode::File {
                data_dir: PathBuf::from("/var/lib/sensorlink")
            }
        );

        let session = config.session_config().unwrap();
        assert_eq!(session.handoff_timeout, Duration::from_millis(2500));
        assert_eq!(session.timestamp_policy, TimestampPolicy::Reject);
        assert!(session.live_streaming);
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let config = SensorLinkConfig::load_from_file("/nonexistent/sensorlink.yaml");
        assert_eq!(config.retrieval.max_packets, MAX_PACKETS);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"retrieval: [not, a, map]").unwrap();
        let config = SensorLinkConfig::load_from_file(temp_file.path());
        assert_eq!(config.retrieval, RetrievalConfig::default());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SENSORLINK_DEVICE_ID", "vib-09"),
            ("SENSORLINK_MAX_PACKETS", "not-a-number"),
            ("SENSORLINK_SINK_MODE", "FILE"),
            ("SENSORLINK_DATA_DIR", "/tmp/records"),
        ]
        .into_iter()
        .collect();

        let mut config = SensorLinkConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.device.device_id, "vib-09");
        assert_eq!(config.retrieval.max_packets, MAX_PACKETS);
        assert_eq!(config.sink.mode, SinkKind::File);
        assert_eq!(config.sink.data_dir, PathBuf::from("/tmp/records"));
    }

    #[test]
    fn test_bad_handoff_timeout() {
        let mut config = SensorLinkConfig::default();
        config.retrieval.handoff_timeout = "soon".to_string();
        assert!(config.session_config().is_err());
    }
}
