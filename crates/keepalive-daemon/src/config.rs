//! Daemon configuration.
//!
//! A JSON file (same shape as [`MonitorConfig`]) provides the base settings;
//! command-line flags override individual fields. Without a file, the flags
//! must name at least the local address, port and one remote peer.

use anyhow::{bail, Context, Result};
use keepalive_core::{MonitorConfig, SessionConfig};
use std::fs;
use std::path::Path;

/// Read a monitor configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Settings given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub local: Option<String>,
    pub port: Option<u32>,
    /// Replaces the file's peer list when non-empty
    pub peers: Vec<String>,
    pub priority: Option<u8>,
    pub interval_ms: Option<u32>,
    pub dead_interval_ms: Option<u32>,
}

impl ConfigOverrides {
    /// Layer these overrides on top of `base`.
    pub fn apply(self, base: Option<MonitorConfig>) -> Result<MonitorConfig> {
        let (local_address, port, remote_peers, session) = match base {
            Some(base) => (
                self.local.unwrap_or(base.local_address),
                self.port.unwrap_or(base.port),
                if self.peers.is_empty() {
                    base.remote_peers
                } else {
                    self.peers
                },
                base.session,
            ),
            None => {
                let Some(local) = self.local else {
                    bail!("--local is required without --config");
                };
                let Some(port) = self.port else {
                    bail!("--port is required without --config");
                };
                (local, port, self.peers, SessionConfig::default())
            }
        };

        let session = SessionConfig {
            priority: self.priority.unwrap_or(session.priority),
            interval_ms: self.interval_ms.unwrap_or(session.interval_ms),
            dead_interval_ms: self.dead_interval_ms.unwrap_or(session.dead_interval_ms),
        };

        Ok(MonitorConfig {
            local_address,
            port,
            remote_peers,
            session,
        })
    }
}
