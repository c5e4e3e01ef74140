//! Retrieval state machine, live streaming and transport contract for sensorlink.
//!
//! This crate drives a connected sensor over an abstract characteristic
//! transport: it reads the device's historical log packet by packet, hands
//! the device over to live mode when the log ends, and streams live
//! measurements until stopped.
//!
//! ## Features
//!
//! - **Transport Contract**: [`GattTransport`] with a scripted in-process implementation
//! - **Time Handshake**: wall-clock sync and set-time write-back
//! - **Historical Retrieval**: bounded read loop with packet and read budgets
//! - **Live Streaming**: one record per notification until stopped
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensorlink_session::{DeviceSession, ScriptedTransport, SessionConfig};
//! use sensorlink_storage::{DeviceId, MemorySink};
//! use tokio::sync::watch;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut transport = ScriptedTransport::new();
//! let sink = MemorySink::new();
//! let config = SessionConfig {
//!     device_id: DeviceId::new("vib-01"),
//!     live_streaming: true,
//!     ..SessionConfig::default()
//! };
//!
//! let (stop_tx, stop_rx) = watch::channel(false);
//! let report = DeviceSession::run(&mut transport, &sink, config, stop_rx).await?;
//! println!("{} records", report.records_emitted());
//! drop(stop_tx);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod error;
pub mod handshake;
pub mod retrieval;
pub mod session;
pub mod streaming;
pub mod transport;

// Re-export main types
pub use capture::{load_capture, parse_capture, CaptureError};
pub use error::SessionError;
pub use handshake::{parse_ack, send_time_sync, timestamp_frame, wall_clock_secs, write_device_time};
pub use retrieval::{
    AbortReason, Retrieval, RetrievalContext, RetrievalReport, RetrievalState, RetrievalStats,
    MAX_PACKETS, REQUIRED_CHARACTERISTICS,
};
pub use session::{DeviceSession, DeviceSessionReport, SessionConfig, DEFAULT_HANDOFF_TIMEOUT};
pub use streaming::{LiveStream, StreamEnd, StreamReport, StreamStats};
pub use transport::{
    require_characteristics, Characteristic, GattTransport, ScriptedRead, ScriptedTransport,
    ScriptedWrite, TransportError,
};
