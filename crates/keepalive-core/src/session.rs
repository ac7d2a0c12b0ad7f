//! Keepalive session with a single remote peer.
//!
//! A session owns two UDP sockets: a receive socket bound to the local
//! endpoint and a transmit socket dialed to the remote endpoint. Once started
//! it runs three tasks:
//! - **transmit**: sends the encoded keepalive every interval
//! - **receive**: reads with a deadline of 1.25 × interval and forwards
//!   keepalives or failures
//! - **control**: the only owner of the [`Liveness`] state; applies reports
//!   in arrival order, answers queries, emits UP/DOWN events
//!
//! Callers talk to the control task through [`PeerSession`] only.

use crate::events::SessionState;
use crate::liveness::{KeepaliveStats, Liveness};
use crate::protocol::{CodecError, Keepalive};
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Room for oversized datagrams so they fail decoding instead of being truncated.
const RECV_BUFFER_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Invalid session config: {0}")]
    InvalidConfig(String),

    #[error("Keepalive session is not started")]
    NotStarted,

    #[error("Keepalive session is already started")]
    AlreadyStarted,

    #[error("Keepalive session is closed")]
    Closed,
}

/// Why a receive attempt counted as a miss.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no keepalive within {0:?}")]
    Timeout(Duration),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed keepalive: {0}")]
    Format(#[from] CodecError),
}

/// Timer configuration carried in every keepalive a session sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Priority advertised to the peer (default: 0)
    pub priority: u8,
    /// Transmit interval in milliseconds (default: 1000)
    pub interval_ms: u32,
    /// Silence before the peer is declared down, in milliseconds (default: 3000)
    pub dead_interval_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            interval_ms: 1000,
            dead_interval_ms: 3000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.interval_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "interval must be greater than zero".into(),
            ));
        }
        if self.dead_interval_ms <= self.interval_ms {
            warn!(
                "Dead interval {}ms does not exceed interval {}ms, a single miss will take peers down",
                self.dead_interval_ms, self.interval_ms
            );
        }
        Ok(())
    }

    /// The message this session transmits.
    pub fn keepalive(&self) -> Keepalive {
        Keepalive::new(self.priority, self.interval_ms, self.dead_interval_ms)
    }

    pub fn miss_threshold(&self) -> u32 {
        Liveness::threshold_for(self.interval_ms, self.dead_interval_ms)
    }

    pub fn transmit_period(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64)
    }

    /// Interval plus 25% so scheduling jitter does not register as a miss.
    pub fn receive_deadline(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64 * 5 / 4)
    }
}

/// Input to the control task from the transmit and receive tasks.
#[derive(Debug)]
enum Report {
    Keepalive(Keepalive),
    ReceiveFailed(ReceiveError),
    TransmitFailed(io::Error),
}

/// Requests from the session handle to the control task.
#[derive(Debug)]
enum Command {
    Alive(oneshot::Sender<bool>),
    Stats(oneshot::Sender<KeepaliveStats>),
    Stop(oneshot::Sender<()>),
}

enum Lifecycle {
    /// Sockets bound, tasks not spawned yet
    Bound { rx: UdpSocket, tx: UdpSocket },
    Running {
        commands: mpsc::UnboundedSender<Command>,
        control: JoinHandle<()>,
    },
    Stopped,
}

/// Handle to a keepalive session with one remote peer.
pub struct PeerSession {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionState>,
    lifecycle: Lifecycle,
}

impl PeerSession {
    /// Bind `local_ip:port` for receiving and dial `remote_ip:port` for sending.
    ///
    /// State changes are sent to `events`. The session is idle until
    /// [`start`](Self::start) is called.
    pub async fn create(
        local_ip: IpAddr,
        port: u16,
        remote_ip: IpAddr,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionState>,
    ) -> Result<Self, SessionError> {
        Self::bind(
            SocketAddr::new(local_ip, port),
            SocketAddr::new(remote_ip, port),
            config,
            events,
        )
        .await
    }

    /// Like [`create`](Self::create), returning the receiving end of a fresh
    /// event channel for standalone use.
    pub async fn create_standalone(
        local_ip: IpAddr,
        port: u16,
        remote_ip: IpAddr,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionState>), SessionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self::create(local_ip, port, remote_ip, config, events_tx).await?;
        Ok((session, events_rx))
    }

    /// Bind and dial explicit endpoints.
    ///
    /// The transmit socket binds the local IP on an ephemeral port.
    pub async fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionState>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let rx = UdpSocket::bind(local)
            .await
            .map_err(|source| SessionError::Bind { addr: local, source })?;
        let local_addr = rx
            .local_addr()
            .map_err(|source| SessionError::Bind { addr: local, source })?;

        let tx_local = SocketAddr::new(local.ip(), 0);
        let tx = UdpSocket::bind(tx_local)
            .await
            .map_err(|source| SessionError::Bind {
                addr: tx_local,
                source,
            })?;
        tx.connect(remote)
            .await
            .map_err(|source| SessionError::Dial {
                addr: remote,
                source,
            })?;

        debug!(
            "Bound keepalive session {} -> {} (tx from {:?})",
            local_addr,
            remote,
            tx.local_addr().ok()
        );

        Ok(Self {
            local_addr,
            remote_addr: remote,
            config,
            events,
            lifecycle: Lifecycle::Bound { rx, tx },
        })
    }

    /// Remote peer identity (`ip:port`).
    pub fn remote_address(&self) -> String {
        self.remote_addr.to_string()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address the receive socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// Spawn the transmit, receive and control tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let (rx, tx) = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Bound { rx, tx } => (rx, tx),
            running @ Lifecycle::Running { .. } => {
                self.lifecycle = running;
                return Err(SessionError::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(SessionError::Closed),
        };

        info!("Starting keepalive session with {}", self.remote_addr);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let control = Control {
            remote: self.remote_addr.to_string(),
            config: self.config,
            rx_socket: Arc::new(rx),
            tx_socket: Arc::new(tx),
            events: self.events.clone(),
            commands: commands_rx,
        };
        let handle = tokio::spawn(control.run());

        self.lifecycle = Lifecycle::Running {
            commands: commands_tx,
            control: handle,
        };
        Ok(())
    }

    /// Whether the remote peer is currently UP.
    ///
    /// Answered by the control task, so the value is never a torn read.
    pub async fn is_alive(&self) -> Result<bool, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Alive(reply_tx))?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current keepalive counters.
    pub async fn stats(&self) -> Result<KeepaliveStats, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Stats(reply_tx))?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop all tasks and release both sockets.
    ///
    /// Returns once the control task has observed both child tasks exit and
    /// dropped the sockets. A never-started session just drops its sockets.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Bound { .. } => {
                debug!("Closing unstarted keepalive session with {}", self.remote_addr);
                Ok(())
            }
            Lifecycle::Running { commands, control } => {
                info!("Stopping keepalive session with {}", self.remote_addr);
                let (ack_tx, ack_rx) = oneshot::channel();
                if commands.send(Command::Stop(ack_tx)).is_ok() {
                    let _ = ack_rx.await;
                }
                if let Err(e) = control.await {
                    error!("Keepalive control task for {} failed: {}", self.remote_addr, e);
                }
                Ok(())
            }
            Lifecycle::Stopped => Err(SessionError::Closed),
        }
    }

    fn send_command(&self, command: Command) -> Result<(), SessionError> {
        match &self.lifecycle {
            Lifecycle::Running { commands, .. } => {
                commands.send(command).map_err(|_| SessionError::Closed)
            }
            Lifecycle::Bound { .. } => Err(SessionError::NotStarted),
            Lifecycle::Stopped => Err(SessionError::Closed),
        }
    }
}

/// State owned by the control task.
struct Control {
    remote: String,
    config: SessionConfig,
    rx_socket: Arc<UdpSocket>,
    tx_socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Control {
    async fn run(mut self) {
        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let receiver = tokio::spawn(receive_loop(
            self.remote.clone(),
            Arc::clone(&self.rx_socket),
            self.config.receive_deadline(),
            reports_tx.clone(),
            stop_rx.clone(),
        ));
        let transmitter = tokio::spawn(transmit_loop(
            self.remote.clone(),
            Arc::clone(&self.tx_socket),
            self.config.keepalive(),
            self.config.transmit_period(),
            reports_tx,
            stop_rx,
        ));

        let mut liveness = Liveness::new(self.config.miss_threshold());
        let mut stop_ack = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Alive(reply)) => {
                        let _ = reply.send(liveness.is_alive());
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(liveness.stats());
                    }
                    Some(Command::Stop(ack)) => {
                        debug!("Keepalive control for {} received stop", self.remote);
                        stop_ack = Some(ack);
                        break;
                    }
                    None => {
                        debug!("Keepalive session handle for {} dropped", self.remote);
                        break;
                    }
                },
                Some(report) = reports.recv() => {
                    self.apply(&mut liveness, report);
                }
            }
        }

        let _ = stop_tx.send(true);
        for (name, task) in [("receive", receiver), ("transmit", transmitter)] {
            if let Err(e) = task.await {
                error!("Keepalive {} task for {} failed: {}", name, self.remote, e);
            }
        }

        // Children have exited; ours are the last references.
        drop(self.rx_socket);
        drop(self.tx_socket);
        info!("Keepalive session with {} stopped", self.remote);

        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn apply(&self, liveness: &mut Liveness, report: Report) {
        let now = now_ms();
        let transition = match report {
            Report::Keepalive(msg) => {
                trace!("Keepalive from {}: {:?}", self.remote, msg);
                liveness.on_keepalive(now)
            }
            Report::ReceiveFailed(e) => {
                let was_alive = liveness.is_alive();
                let transition = liveness.on_receive_failure(now);
                if was_alive {
                    warn!(
                        "Missed keepalive from {} ({}), consecutive misses: {}",
                        self.remote,
                        e,
                        liveness.stats().consecutive_misses
                    );
                }
                transition
            }
            Report::TransmitFailed(e) => {
                if liveness.is_alive() {
                    error!(
                        "Keepalive session with {} lost due to transmit error: {}",
                        self.remote, e
                    );
                } else {
                    debug!("Keepalive transmit to {} failed: {}", self.remote, e);
                }
                liveness.on_transmit_failure(now)
            }
        };

        if let Some(state) = transition {
            info!("Keepalive session with {} is {}", self.remote, state);
            if self
                .events
                .send(SessionState::new(self.remote.clone(), state))
                .is_err()
            {
                debug!("No listener for {} state changes", self.remote);
            }
        }
    }
}

/// Read keepalives until stopped, reporting each outcome.
///
/// An undecodable datagram counts as one miss and reading continues.
async fn receive_loop(
    remote: String,
    socket: Arc<UdpSocket>,
    deadline: Duration,
    reports: mpsc::UnboundedSender<Report>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.changed() => break,
            read = timeout(deadline, socket.recv_from(&mut buf)) => read,
        };

        let report = match read {
            Err(_) => Report::ReceiveFailed(ReceiveError::Timeout(deadline)),
            Ok(Err(e)) => Report::ReceiveFailed(ReceiveError::Io(e)),
            Ok(Ok((len, from))) => match Keepalive::decode(&buf[..len]) {
                Ok(msg) => Report::Keepalive(msg),
                Err(e) => {
                    warn!("Dropping malformed keepalive from {} for {}: {}", from, remote, e);
                    Report::ReceiveFailed(ReceiveError::Format(e))
                }
            },
        };

        if reports.send(report).is_err() {
            break;
        }
    }
    debug!("Keepalive receive for {} stopped", remote);
}

/// Send the encoded keepalive every `period` until stopped.
async fn transmit_loop(
    remote: String,
    socket: Arc<UdpSocket>,
    keepalive: Keepalive,
    period: Duration,
    reports: mpsc::UnboundedSender<Report>,
    mut stop: watch::Receiver<bool>,
) {
    let frame = keepalive.encode();

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let result = match timeout(period, socket.send(&frame)).await {
                    Ok(result) => result.map(|_| ()),
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "keepalive send timed out")),
                };
                if let Err(e) = result {
                    if reports.send(Report::TransmitFailed(e)).is_err() {
                        break;
                    }
                } else {
                    trace!("Sent keepalive to {}", remote);
                }
            }
        }
    }
    debug!("Keepalive transmit for {} stopped", remote);
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
