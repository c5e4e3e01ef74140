//! Capture files for offline replay.
//!
//! A capture is line-oriented text:
//!
//! ```text
//! # handshake echo, then one packet in two fragments
//! log 6553f100
//! log 6553f100010a...
//! fail
//! notify 6553f13c00d2...
//! resubscribe
//! notify 6553f17800d2...
//! disconnect
//! ```
//!
//! `log` lines become log-read fragments in order, `fail` a failed read and
//! `disconnect` a dropped link. `notify` lines are delivered to the current
//! measurement subscription; `resubscribe` moves later ones to the next.

use crate::transport::{ScriptedRead, ScriptedTransport};
use bytes::Bytes;
use sensorlink_wire::hex;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Capture loading errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Malformed line
    #[error("line {line}: {message}")]
    Line {
        /// 1-based line number
        line: usize,
        /// What was wrong
        message: String,
    },
    /// File could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a scripted transport from capture text
pub fn parse_capture(text: &str) -> Result<ScriptedTransport, CaptureError> {
    let mut transport = ScriptedTransport::new();
    let mut bursts: Vec<Vec<Bytes>> = vec![Vec::new()];

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };
        let payload = |rest: &str| -> Result<Bytes, CaptureError> {
            let compact: String = rest.split_whitespace().collect();
            hex::decode(&compact)
                .map(Bytes::from)
                .map_err(|e| CaptureError::Line {
                    line: index + 1,
                    message: e.to_string(),
                })
        };

        match keyword {
            "log" => transport.push_fragment(payload(rest)?),
            "notify" => {
                let bytes = payload(rest)?;
                if let Some(burst) = bursts.last_mut() {
                    burst.push(bytes);
                }
            }
            "fail" => transport.push_read(ScriptedRead::Failure),
            "disconnect" => transport.push_read(ScriptedRead::Disconnect),
            "resubscribe" => bursts.push(Vec::new()),
            other => {
                return Err(CaptureError::Line {
                    line: index + 1,
                    message: format!("unknown event '{}'", other),
                })
            }
        }
    }

    for burst in bursts {
        transport.push_burst(burst);
    }
    debug!(
        "Capture loaded: {} reads queued",
        transport.pending_reads()
    );
    Ok(transport)
}

/// Read and parse a capture file
pub async fn load_capture(path: impl AsRef<Path>) -> Result<ScriptedTransport, CaptureError> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_capture(&text)
}
