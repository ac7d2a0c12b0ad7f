//! keepalive-core: UDP keepalive liveness detection between peers.
//!
//! This crate provides:
//! - The 9-byte keepalive wire codec
//! - Peer address validation (IP literal with optional prefix length)
//! - A per-peer session that sends, receives and tracks liveness
//! - A monitor that runs one session per remote peer and fans in their events

pub mod address;
pub mod events;
pub mod liveness;
pub mod monitor;
pub mod protocol;
pub mod session;

pub use address::{AddressError, AddressFamily, PeerAddress};
pub use events::{PeerState, SessionState};
pub use liveness::{KeepaliveStats, Liveness};
pub use monitor::{Monitor, MonitorConfig, MonitorError};
pub use protocol::{CodecError, Keepalive, KEEPALIVE_MESSAGE_LEN};
pub use session::{PeerSession, ReceiveError, SessionConfig, SessionError};
