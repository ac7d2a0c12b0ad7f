//! Wire protocol for keepalive probes.
//!
//! A keepalive is a fixed 9-byte UDP payload with no version tag, checksum or
//! authentication. Integrity is left to the UDP/IP layer.

pub mod keepalive;

pub use keepalive::{CodecError, Keepalive, KEEPALIVE_MESSAGE_LEN};
