//! Time synchronisation with the device.
//!
//! Retrieval opens by writing the host's wall-clock time to the log-read
//! characteristic; the device answers with a 4-byte echo. After the
//! historical log ends, and for every live notification, the host writes the
//! record's timestamp to the set-time characteristic.
//!
//! Only a dropped link is fatal here. Everything else is logged and the
//! protocol carries on.

use crate::transport::{Characteristic, GattTransport, TransportError};
use bytes::Bytes;
use chrono::Utc;
use sensorlink_wire::HANDSHAKE_FRAME_SIZE;
use tracing::{debug, warn};

/// Current wall-clock time as protocol seconds
pub fn wall_clock_secs() -> u32 {
    u32::try_from(Utc::now().timestamp().max(0)).unwrap_or(u32::MAX)
}

/// Encode a timestamp as a 4-byte big-endian frame
pub fn timestamp_frame(timestamp: u32) -> [u8; HANDSHAKE_FRAME_SIZE] {
    timestamp.to_be_bytes()
}

/// Parse a 4-byte acknowledgment frame
pub fn parse_ack(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; HANDSHAKE_FRAME_SIZE] = frame.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Send the time sync and read the device's acknowledgment.
///
/// Returns the bytes of the acknowledgment read, or `None` if it failed.
/// Only a disconnect or a vanished characteristic is returned as an error.
pub async fn send_time_sync<T: GattTransport + ?Sized>(
    transport: &mut T,
    now: u32,
) -> Result<Option<Bytes>, TransportError> {
    match transport
        .write(Characteristic::LogRead, &timestamp_frame(now))
        .await
    {
        Ok(()) => debug!("Sent time sync {}", now),
        Err(e) if is_fatal(&e) => return Err(e),
        Err(e) => warn!("Time sync write failed: {}", e),
    }

    match transport.read(Characteristic::LogRead).await {
        Ok(ack) => {
            match parse_ack(&ack) {
                Some(echo) if echo == now => debug!("Device acknowledged time sync"),
                Some(echo) => debug!("Device acknowledged with {} (sent {})", echo, now),
                None => debug!("Acknowledgment read returned {} bytes", ack.len()),
            }
            Ok(Some(ack))
        }
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!("Time sync acknowledgment read failed: {}", e);
            Ok(None)
        }
    }
}

/// Write a timestamp to the device clock.
///
/// Returns whether the write went through. Only fatal errors propagate.
pub async fn write_device_time<T: GattTransport + ?Sized>(
    transport: &mut T,
    timestamp: u32,
) -> Result<bool, TransportError> {
    match transport
        .write(Characteristic::SetTime, &timestamp_frame(timestamp))
        .await
    {
        Ok(()) => {
            debug!("Device clock set to {}", timestamp);
            Ok(true)
        }
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!("Set-time write failed: {}", e);
            Ok(false)
        }
    }
}

/// Errors that end the running mode
pub(crate) fn is_fatal(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Disconnected | TransportError::CharacteristicUnavailable(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedRead, ScriptedTransport, ScriptedWrite};

    #[test]
    fn test_timestamp_frame_big_endian() {
        assert_eq!(timestamp_frame(1_700_000_000), [0x65, 0x53, 0xf1, 0x00]);
        assert_eq!(parse_ack(&[0x65, 0x53, 0xf1, 0x00]), Some(1_700_000_000));
        assert_eq!(parse_ack(&[1, 2, 3]), None);
    }

    #[test]
    fn test_wall_clock_is_plausible() {
        assert!(wall_clock_secs() > sensorlink_wire::field::MIN_PLAUSIBLE_TIMESTAMP);
    }

    #[tokio::test]
    async fn test_time_sync_writes_and_reads_ack() {
        let mut transport = ScriptedTransport::new();
        transport.push_fragment(timestamp_frame(1_700_000_000).to_vec());

        let ack = send_time_sync(&mut transport, 1_700_000_000).await.unwrap();
        assert_eq!(ack.unwrap().as_ref(), &[0x65, 0x53, 0xf1, 0x00]);
        assert_eq!(
            transport.writes_to(Characteristic::LogRead),
            vec![vec![0x65, 0x53, 0xf1, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_failed_ack_is_not_fatal() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(ScriptedRead::Failure);
        assert_eq!(send_time_sync(&mut transport, 1_700_000_000).await, Ok(None));
    }

    #[tokio::test]
    async fn test_failed_sync_write_still_reads_ack() {
        let mut transport = ScriptedTransport::new();
        transport.push_write(Characteristic::LogRead, ScriptedWrite::Failure);
        transport.push_fragment(timestamp_frame(1_700_000_000).to_vec());

        let ack = send_time_sync(&mut transport, 1_700_000_000).await.unwrap();
        assert!(ack.is_some());
        assert!(transport.writes_to(Characteristic::LogRead).is_empty());
    }

    #[tokio::test]
    async fn test_failed_time_write_is_not_fatal() {
        let mut transport = ScriptedTransport::new();
        transport.push_write(Characteristic::SetTime, ScriptedWrite::Timeout);
        assert_eq!(write_device_time(&mut transport, 1_700_000_000).await, Ok(false));
        assert_eq!(write_device_time(&mut transport, 1_700_000_000).await, Ok(true));
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(ScriptedRead::Disconnect);
        assert_eq!(
            send_time_sync(&mut transport, 1_700_000_000).await,
            Err(TransportError::Disconnected)
        );
        assert_eq!(
            write_device_time(&mut transport, 1).await,
            Err(TransportError::Disconnected)
        );
    }
}
