//! Keepalive monitor for a set of remote peers.
//!
//! The monitor validates its configuration up front, then creates and starts
//! one [`PeerSession`] per remote. All sessions report into one inbound
//! channel drained by the monitor's control task, which logs every
//! transition and forwards it to subscribers (if any have asked).
//!
//! Configuration errors fail construction before any socket is opened.
//! Socket errors for a single remote only skip that remote.

use crate::address::{AddressError, PeerAddress};
use crate::events::SessionState;
use crate::session::{PeerSession, SessionConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("No remote peers specified")]
    NoRemotePeers,

    #[error("Invalid port {0}")]
    InvalidPort(u32),

    #[error("Invalid local address {address}: {source}")]
    InvalidLocalAddress {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("Remote peer {remote} and local address {local} belong to different address families")]
    MixedAddressFamily { local: String, remote: String },

    #[error("Invalid session config: {0}")]
    InvalidSessionConfig(String),

    #[error("Monitor is closed")]
    Closed,
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Local IP (optionally with prefix length) to receive keepalives on
    pub local_address: String,
    /// UDP port used both locally and on every remote
    pub port: u32,
    /// Remote peer IPs (optionally with prefix length)
    pub remote_peers: Vec<String>,
    /// Timers shared by every session
    #[serde(default)]
    pub session: SessionConfig,
}

impl MonitorConfig {
    pub fn new(
        local_address: impl Into<String>,
        port: u32,
        remote_peers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            port,
            remote_peers: remote_peers.into_iter().map(Into::into).collect(),
            session: SessionConfig::default(),
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

/// Local address, port and the remotes that passed validation.
#[derive(Debug)]
struct ValidatedConfig {
    local: PeerAddress,
    port: u16,
    remotes: Vec<PeerAddress>,
}

/// Check everything that can be checked without touching the network.
///
/// Malformed remotes are skipped; a remote of the wrong address family fails
/// the whole configuration.
fn validate(config: &MonitorConfig) -> Result<ValidatedConfig, MonitorError> {
    if config.remote_peers.is_empty() {
        return Err(MonitorError::NoRemotePeers);
    }

    let port =
        u16::try_from(config.port).map_err(|_| MonitorError::InvalidPort(config.port))?;

    let local: PeerAddress =
        config
            .local_address
            .parse()
            .map_err(|source| MonitorError::InvalidLocalAddress {
                address: config.local_address.clone(),
                source,
            })?;

    config
        .session
        .validate()
        .map_err(|e| MonitorError::InvalidSessionConfig(e.to_string()))?;

    let mut remotes = Vec::with_capacity(config.remote_peers.len());
    for raw in &config.remote_peers {
        let remote: PeerAddress = match raw.parse() {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Skipping remote peer {}: {}", raw, e);
                continue;
            }
        };
        if remote.family() != local.family() {
            return Err(MonitorError::MixedAddressFamily {
                local: config.local_address.clone(),
                remote: raw.clone(),
            });
        }
        remotes.push(remote);
    }

    Ok(ValidatedConfig {
        local,
        port,
        remotes,
    })
}

/// Requests from the monitor handle to its control task.
enum MonitorCommand {
    Subscribe(mpsc::UnboundedSender<SessionState>),
    PeerAlive {
        remote: String,
        reply: oneshot::Sender<Option<bool>>,
    },
    Stop(oneshot::Sender<()>),
}

/// Handle to a running keepalive monitor.
pub struct Monitor {
    /// Identities of the sessions that were created
    peers: Vec<String>,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    control: Option<JoinHandle<()>>,
    subscribed: bool,
}

impl Monitor {
    /// Monitor `remote_peers` from `local_address` on `port` with default timers.
    pub async fn new(
        local_address: impl Into<String>,
        port: u32,
        remote_peers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, MonitorError> {
        Self::start(MonitorConfig::new(local_address, port, remote_peers)).await
    }

    /// Validate `config`, create a session per remote and start them all.
    pub async fn start(config: MonitorConfig) -> Result<Self, MonitorError> {
        let validated = validate(&config)?;
        let local_ip = validated.local.ip();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut sessions: HashMap<String, PeerSession> = HashMap::new();
        let mut peers = Vec::new();

        for remote in validated.remotes {
            let id = SocketAddr::new(remote.ip(), validated.port).to_string();
            if sessions.contains_key(&id) {
                warn!("Remote peer {} listed more than once, ignoring duplicate", id);
                continue;
            }

            match PeerSession::create(
                local_ip,
                validated.port,
                remote.ip(),
                config.session,
                inbound_tx.clone(),
            )
            .await
            {
                Ok(session) => {
                    peers.push(id.clone());
                    sessions.insert(id, session);
                }
                Err(e) => {
                    error!("Failed creating remote peer {}: {}", id, e);
                }
            }
        }

        // Only sessions hold the inbound sender from here on.
        drop(inbound_tx);

        for (id, session) in sessions.iter_mut() {
            if let Err(e) = session.start() {
                error!("Failed starting keepalive session with {}: {}", id, e);
            }
        }

        info!(
            "Monitoring {} remote peer(s) from {} port {}",
            peers.len(),
            local_ip,
            validated.port
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let control = MonitorControl {
            sessions,
            inbound: inbound_rx,
            commands: commands_rx,
            subscribers: Vec::new(),
        };
        let handle = tokio::spawn(control.run());

        Ok(Self {
            peers,
            commands: commands_tx,
            control: Some(handle),
            subscribed: false,
        })
    }

    /// Identities of the monitored remote peers.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Whether any caller has subscribed to state changes.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Subscribe to UP/DOWN transitions of every monitored peer.
    ///
    /// Transitions are only forwarded once the first subscription exists;
    /// earlier ones are logged and dropped.
    pub fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<SessionState>, MonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(MonitorCommand::Subscribe(tx))
            .map_err(|_| MonitorError::Closed)?;
        self.subscribed = true;
        Ok(rx)
    }

    /// Liveness of one monitored peer, `None` if it is not monitored.
    pub async fn peer_alive(&self, remote: &str) -> Result<Option<bool>, MonitorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::PeerAlive {
                remote: remote.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| MonitorError::Closed)?;
        reply_rx.await.map_err(|_| MonitorError::Closed)
    }

    /// Stop every session, then the control task.
    ///
    /// Returns once all sockets are released.
    pub async fn stop(&mut self) -> Result<(), MonitorError> {
        let control = self.control.take().ok_or(MonitorError::Closed)?;

        info!("Closing monitor...");
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(MonitorCommand::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = control.await {
            error!("Monitor control task failed: {}", e);
        }
        info!("Monitor closed");
        Ok(())
    }
}

/// State owned by the monitor control task.
struct MonitorControl {
    sessions: HashMap<String, PeerSession>,
    inbound: mpsc::UnboundedReceiver<SessionState>,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    subscribers: Vec<mpsc::UnboundedSender<SessionState>>,
}

impl MonitorControl {
    async fn run(mut self) {
        let mut stop_ack = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Subscribe(tx)) => {
                        if self.subscribers.is_empty() {
                            debug!("State change subscription active");
                        }
                        self.subscribers.push(tx);
                    }
                    Some(MonitorCommand::PeerAlive { remote, reply }) => {
                        let alive = match self.sessions.get(&remote) {
                            Some(session) => session.is_alive().await.ok(),
                            None => None,
                        };
                        let _ = reply.send(alive);
                    }
                    Some(MonitorCommand::Stop(ack)) => {
                        stop_ack = Some(ack);
                        break;
                    }
                    None => {
                        debug!("Monitor handle dropped");
                        break;
                    }
                },
                Some(event) = self.inbound.recv() => {
                    info!("Peer: {} state changed to {}", event.remote_peer, event.state);
                    self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
                }
            }
        }

        for (id, mut session) in self.sessions.drain() {
            info!("Closing keepalive session with {}", id);
            if let Err(e) = session.stop().await {
                warn!("Keepalive session with {} did not stop cleanly: {}", id, e);
            }
        }

        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }
}
