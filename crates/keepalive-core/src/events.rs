//! State-change events emitted by peer sessions.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Liveness of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerState {
    Up,
    Down,
}

impl Display for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("UP"),
            Self::Down => f.write_str("DOWN"),
        }
    }
}

/// A transition of one remote peer to UP or DOWN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Remote peer identity (`ip:port` of the dialed endpoint)
    pub remote_peer: String,
    pub state: PeerState,
}

impl SessionState {
    pub fn new(remote_peer: impl Into<String>, state: PeerState) -> Self {
        Self {
            remote_peer: remote_peer.into(),
            state,
        }
    }
}
