//! Keepalive message codec.
//!
//! ```text
//!  0               1                               5                               9
//! +---------------+-------------------------------+-------------------------------+
//! |   priority    |     interval (u32, BE, ms)    |  dead interval (u32, BE, ms)  |
//! +---------------+-------------------------------+-------------------------------+
//! ```

use thiserror::Error;

/// Encoded size of a keepalive message in bytes.
pub const KEEPALIVE_MESSAGE_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid keepalive length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Keepalive message exchanged between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Keepalive {
    /// Sender priority
    pub priority: u8,
    /// Transmit interval in milliseconds
    pub interval: u32,
    /// Silence in milliseconds after which the sender considers a peer down
    pub dead_interval: u32,
}

impl Keepalive {
    pub fn new(priority: u8, interval: u32, dead_interval: u32) -> Self {
        Self {
            priority,
            interval,
            dead_interval,
        }
    }

    /// Serialize to the 9-byte wire form.
    pub fn encode(&self) -> [u8; KEEPALIVE_MESSAGE_LEN] {
        let mut buf = [0u8; KEEPALIVE_MESSAGE_LEN];
        buf[0] = self.priority;
        buf[1..5].copy_from_slice(&self.interval.to_be_bytes());
        buf[5..9].copy_from_slice(&self.dead_interval.to_be_bytes());
        buf
    }

    /// Parse the wire form.
    ///
    /// Only the length is checked; any field value, including zero, is accepted.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let bytes: &[u8; KEEPALIVE_MESSAGE_LEN] =
            data.try_into().map_err(|_| CodecError::InvalidLength {
                expected: KEEPALIVE_MESSAGE_LEN,
                actual: data.len(),
            })?;

        Ok(Self {
            priority: bytes[0],
            interval: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            dead_interval: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        })
    }
}
