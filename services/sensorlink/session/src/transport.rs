//! Characteristic transport contract.
//!
//! The device exposes three characteristics: measurement (notify), log-read
//! (read/write) and set-time (write). Any stack offering GATT-style
//! read/write/notify can drive the session by implementing
//! [`GattTransport`]. Every method takes `&mut self`, so at most one
//! operation is in flight on a connection at a time.
//!
//! [`ScriptedTransport`] plays back a prepared sequence of fragments and
//! notifications and records every write. It backs the tests and the
//! capture replay command.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Device characteristics used by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Live measurement notifications
    Measurement,
    /// Historical log read and time handshake
    LogRead,
    /// Device clock
    SetTime,
}

impl Characteristic {
    /// All characteristics the protocol knows about
    pub const ALL: [Characteristic; 3] = [
        Characteristic::Measurement,
        Characteristic::LogRead,
        Characteristic::SetTime,
    ];
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Characteristic::Measurement => "measurement",
            Characteristic::LogRead => "log-read",
            Characteristic::SetTime => "set-time",
        };
        f.write_str(name)
    }
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Characteristic not exposed by the device
    #[error("characteristic unavailable: {0}")]
    CharacteristicUnavailable(Characteristic),
    /// Link dropped
    #[error("transport disconnected")]
    Disconnected,
    /// Operation failed but the link is still up
    #[error("transport I/O error: {0}")]
    Io(String),
    /// Operation timed out; stacks with per-operation deadlines report
    /// this instead of blocking
    #[error("transport operation timed out")]
    Timeout,
}

/// GATT-style transport against a single connected device
#[async_trait]
pub trait GattTransport: Send {
    /// Read the current value of a characteristic
    async fn read(&mut self, characteristic: Characteristic) -> Result<Bytes, TransportError>;

    /// Write a value to a characteristic
    async fn write(
        &mut self,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to notifications; the channel closes when the link drops
    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError>;

    /// Stop notifications for a characteristic
    async fn unsubscribe(&mut self, characteristic: Characteristic) -> Result<(), TransportError>;

    /// Whether the device exposes a characteristic
    fn has_characteristic(&self, characteristic: Characteristic) -> bool;
}

/// Fail fast unless every listed characteristic is available
pub fn require_characteristics<T: GattTransport + ?Sized>(
    transport: &T,
    required: &[Characteristic],
) -> Result<(), TransportError> {
    match required.iter().find(|c| !transport.has_characteristic(**c)) {
        Some(missing) => Err(TransportError::CharacteristicUnavailable(*missing)),
        None => Ok(()),
    }
}

/// One scripted response to a log-read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Fragment returned by the read
    Fragment(Bytes),
    /// Read fails, link stays up
    Failure,
    /// Read times out, link stays up
    Timeout,
    /// Link drops at this read
    Disconnect,
}

/// One scripted outcome of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedWrite {
    /// Write goes through
    Ok,
    /// Write fails, link stays up
    Failure,
    /// Write times out, link stays up
    Timeout,
    /// Link drops at this write
    Disconnect,
}

/// In-process transport replaying a prepared script
#[derive(Debug)]
pub struct ScriptedTransport {
    characteristics: HashSet<Characteristic>,
    reads: VecDeque<ScriptedRead>,
    /// Notification bursts, one per subscription
    bursts: VecDeque<Vec<Bytes>>,
    /// Write outcomes per characteristic; writes succeed once drained
    write_outcomes: HashMap<Characteristic, VecDeque<ScriptedWrite>>,
    subscribe_failures: VecDeque<TransportError>,
    drop_link_after_burst: bool,
    writes: Vec<(Characteristic, Vec<u8>)>,
    subscriber: Option<mpsc::Sender<Bytes>>,
    subscriptions: u32,
    notify_capacity: usize,
    hold_open: bool,
    connected: bool,
}

impl ScriptedTransport {
    /// Create a connected transport exposing all characteristics
    pub fn new() -> Self {
        Self {
            characteristics: Characteristic::ALL.into_iter().collect(),
            reads: VecDeque::new(),
            bursts: VecDeque::new(),
            write_outcomes: HashMap::new(),
            subscribe_failures: VecDeque::new(),
            drop_link_after_burst: false,
            writes: Vec::new(),
            subscriber: None,
            subscriptions: 0,
            notify_capacity: 32,
            hold_open: false,
            connected: true,
        }
    }

    /// Remove a characteristic from the device
    pub fn without(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.remove(&characteristic);
        self
    }

    /// Keep notification channels open after their burst is delivered.
    ///
    /// Without this the channel closes once the burst is drained, which a
    /// subscriber observes as the end of the notification source.
    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }

    /// Minimum notification channel capacity
    pub fn notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity.max(1);
        self
    }

    /// Queue a log-read fragment
    pub fn push_fragment(&mut self, fragment: impl Into<Bytes>) {
        self.reads.push_back(ScriptedRead::Fragment(fragment.into()));
    }

    /// Queue a scripted read response
    pub fn push_read(&mut self, read: ScriptedRead) {
        self.reads.push_back(read);
    }

    /// Queue a notification burst delivered to the next subscription
    pub fn push_burst(&mut self, notifications: Vec<Bytes>) {
        self.bursts.push_back(notifications);
    }

    /// Queue the outcome of the next unscripted write to a characteristic
    pub fn push_write(&mut self, characteristic: Characteristic, outcome: ScriptedWrite) {
        self.write_outcomes
            .entry(characteristic)
            .or_default()
            .push_back(outcome);
    }

    /// Fail the next subscription attempt with `error`
    pub fn fail_subscribe(&mut self, error: TransportError) {
        self.subscribe_failures.push_back(error);
    }

    /// Drop the link once the next subscription's burst is queued
    pub fn drop_link_after_burst(&mut self) {
        self.drop_link_after_burst = true;
    }

    /// Writes that went through so far, in order
    pub fn writes(&self) -> &[(Characteristic, Vec<u8>)] {
        &self.writes
    }

    /// Writes issued to one characteristic
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Reads still queued
    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    /// Total subscriptions made
    pub fn subscriptions(&self) -> u32 {
        self.subscriptions
    }

    /// Whether a notification subscription is active
    pub fn is_subscribed(&self) -> bool {
        self.subscriber.is_some()
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drop the link; open notification channels close
    pub fn disconnect(&mut self) {
        debug!("Scripted transport disconnected");
        self.connected = false;
        self.subscriber = None;
    }

    fn check(&self, characteristic: Characteristic) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        if !self.characteristics.contains(&characteristic) {
            return Err(TransportError::CharacteristicUnavailable(characteristic));
        }
        Ok(())
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GattTransport for ScriptedTransport {
    async fn read(&mut self, characteristic: Characteristic) -> Result<Bytes, TransportError> {
        self.check(characteristic)?;
        if characteristic != Characteristic::LogRead {
            return Err(TransportError::Io(format!("{} is not readable", characteristic)));
        }

        // An exhausted script behaves like a device with nothing to say
        match self.reads.pop_front() {
            Some(ScriptedRead::Fragment(bytes)) => {
                trace!("Scripted read returned {} bytes", bytes.len());
                Ok(bytes)
            }
            Some(ScriptedRead::Failure) => Err(TransportError::Io("scripted read failure".into())),
            Some(ScriptedRead::Timeout) => Err(TransportError::Timeout),
            Some(ScriptedRead::Disconnect) => {
                self.disconnect();
                Err(TransportError::Disconnected)
            }
            None => Ok(Bytes::new()),
        }
    }

    async fn write(
        &mut self,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.check(characteristic)?;
        let outcome = self
            .write_outcomes
            .get_mut(&characteristic)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedWrite::Ok);

        match outcome {
            ScriptedWrite::Ok => {
                trace!("Scripted write of {} bytes to {}", value.len(), characteristic);
                self.writes.push((characteristic, value.to_vec()));
                Ok(())
            }
            ScriptedWrite::Failure => Err(TransportError::Io(format!(
                "scripted write failure on {}",
                characteristic
            ))),
            ScriptedWrite::Timeout => Err(TransportError::Timeout),
            ScriptedWrite::Disconnect => {
                self.disconnect();
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        self.check(characteristic)?;
        if characteristic != Characteristic::Measurement {
            return Err(TransportError::Io(format!("{} does not notify", characteristic)));
        }
        if let Some(error) = self.subscribe_failures.pop_front() {
            if error == TransportError::Disconnected {
                self.disconnect();
            }
            return Err(error);
        }

        let burst = self.bursts.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(self.notify_capacity.max(burst.len()));
        for payload in burst {
            tx.try_send(payload)
                .map_err(|e| TransportError::Io(format!("notification queue: {}", e)))?;
        }

        self.subscriptions += 1;
        self.subscriber = if self.hold_open { Some(tx) } else { None };
        debug!("Subscribed to {} (subscription {})", characteristic, self.subscriptions);
        if std::mem::take(&mut self.drop_link_after_burst) {
            self.disconnect();
        }
        Ok(rx)
    }

    async fn unsubscribe(&mut self, characteristic: Characteristic) -> Result<(), TransportError> {
        self.check(characteristic)?;
        self.subscriber = None;
        debug!("Unsubscribed from {}", characteristic);
        Ok(())
    }

    fn has_characteristic(&self, characteristic: Characteristic) -> bool {
        self.characteristics.contains(&characteristic)
    }
}
