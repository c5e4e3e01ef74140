//! Session error types

use crate::transport::{Characteristic, TransportError};
use thiserror::Error;

/// Errors that stop a session before or outside the state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Required characteristic missing; nothing was sent to the device
    #[error("characteristic unavailable: {0}")]
    CharacteristicUnavailable(Characteristic),
    /// Transport failure outside the retrieval loop
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
