//! End-to-end tests for keepalive sessions and monitors.
//!
//! Runs real UDP sockets on loopback with short timers: two sessions (or two
//! monitors) pointed at each other should come up, and go down once one side
//! stops.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use keepalive_core::{
    Monitor, MonitorConfig, PeerSession, PeerState, SessionConfig, SessionState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ============================================================================
// Helpers
// ============================================================================

fn fast_config() -> SessionConfig {
    SessionConfig {
        priority: 0,
        interval_ms: 50,
        dead_interval_ms: 150,
    }
}

/// Reserve a loopback address with a free UDP port.
fn free_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind((LOCALHOST, 0)).expect("Failed to bind");
    socket.local_addr().expect("Failed to get local addr")
}

/// Two bound, unstarted sessions pointed at each other.
async fn session_pair() -> (
    (PeerSession, mpsc::UnboundedReceiver<SessionState>),
    (PeerSession, mpsc::UnboundedReceiver<SessionState>),
) {
    let (a_addr, b_addr) = {
        // Hold both reservations so the OS cannot hand out the same port twice
        let a = std::net::UdpSocket::bind((LOCALHOST, 0)).expect("Failed to bind");
        let b = std::net::UdpSocket::bind((LOCALHOST, 0)).expect("Failed to bind");
        (a.local_addr().unwrap(), b.local_addr().unwrap())
    };

    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let a = PeerSession::bind(a_addr, b_addr, fast_config(), a_tx)
        .await
        .expect("Failed to bind session A");

    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let b = PeerSession::bind(b_addr, a_addr, fast_config(), b_tx)
        .await
        .expect("Failed to bind session B");

    ((a, a_rx), (b, b_rx))
}

async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<SessionState>,
    duration: Duration,
) -> SessionState {
    timeout(duration, events.recv())
        .await
        .expect("Timed out waiting for state change")
        .expect("Event channel closed")
}

/// Collect everything that arrives within `duration`.
async fn drain_for(
    events: &mut mpsc::UnboundedReceiver<SessionState>,
    duration: Duration,
) -> Vec<SessionState> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + duration;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

// ============================================================================
// Session pair
// ============================================================================

#[tokio::test]
async fn test_sessions_come_up() {
    let ((mut a, mut a_events), (mut b, mut b_events)) = session_pair().await;
    a.start().unwrap();
    b.start().unwrap();

    let a_up = expect_event(&mut a_events, Duration::from_secs(2)).await;
    let b_up = expect_event(&mut b_events, Duration::from_secs(2)).await;

    assert_eq!(a_up, SessionState::new(b.local_addr().to_string(), PeerState::Up));
    assert_eq!(b_up, SessionState::new(a.local_addr().to_string(), PeerState::Up));
    assert!(a.is_alive().await.unwrap());
    assert!(b.is_alive().await.unwrap());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_steady_state_emits_no_duplicate_up() {
    let ((mut a, mut a_events), (mut b, _b_events)) = session_pair().await;
    a.start().unwrap();
    b.start().unwrap();

    assert_eq!(
        expect_event(&mut a_events, Duration::from_secs(2)).await.state,
        PeerState::Up
    );

    // Many more keepalives arrive, none of them produce an event
    let extra = drain_for(&mut a_events, Duration::from_millis(500)).await;
    assert!(extra.is_empty(), "unexpected events: {:?}", extra);
    assert_eq!(a.stats().await.unwrap().consecutive_misses, 0);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_peer_goes_down_once() {
    let ((mut a, mut a_events), (mut b, _b_events)) = session_pair().await;
    a.start().unwrap();
    b.start().unwrap();

    assert_eq!(
        expect_event(&mut a_events, Duration::from_secs(2)).await.state,
        PeerState::Up
    );

    b.stop().await.unwrap();

    let down = expect_event(&mut a_events, Duration::from_secs(2)).await;
    assert_eq!(down.state, PeerState::Down);
    assert!(!a.is_alive().await.unwrap());

    // Failures keep accumulating while down, without further events
    let before = a.stats().await.unwrap().total_misses;
    let extra = drain_for(&mut a_events, Duration::from_millis(400)).await;
    assert!(extra.is_empty(), "unexpected events: {:?}", extra);
    assert!(a.stats().await.unwrap().total_misses > before);

    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_restarted_peer_comes_back_up() {
    let ((mut a, mut a_events), (mut b, _b_events)) = session_pair().await;
    let (a_addr, b_addr) = (a.local_addr(), b.local_addr());
    a.start().unwrap();
    b.start().unwrap();

    assert_eq!(
        expect_event(&mut a_events, Duration::from_secs(2)).await.state,
        PeerState::Up
    );
    b.stop().await.unwrap();
    assert_eq!(
        expect_event(&mut a_events, Duration::from_secs(2)).await.state,
        PeerState::Down
    );

    // Same endpoint again: B's sockets were released by stop()
    let (b_tx, _b_rx) = mpsc::unbounded_channel();
    let mut b = PeerSession::bind(b_addr, a_addr, fast_config(), b_tx)
        .await
        .expect("Endpoint should be free after stop");
    b.start().unwrap();

    assert_eq!(
        expect_event(&mut a_events, Duration::from_secs(2)).await.state,
        PeerState::Up
    );
    let stats = a.stats().await.unwrap();
    assert!(stats.last_change_up >= stats.last_change_down);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ============================================================================
// Monitor pair
// ============================================================================

#[tokio::test]
async fn test_monitors_see_each_other() {
    let port = free_addr().port() as u32;
    let first = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let second = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));

    let mut m1 = Monitor::start(
        MonitorConfig::new(first.to_string(), port, [second.to_string()])
            .with_session(fast_config()),
    )
    .await
    .unwrap();
    let mut m2 = Monitor::start(
        MonitorConfig::new(second.to_string(), port, [first.to_string()])
            .with_session(fast_config()),
    )
    .await
    .unwrap();

    assert_eq!(m1.peers(), &[format!("{}:{}", second, port)]);
    assert_eq!(m2.peers(), &[format!("{}:{}", first, port)]);

    let mut m1_events = m1.subscribe().unwrap();
    let up = expect_event(&mut m1_events, Duration::from_secs(2)).await;
    assert_eq!(up, SessionState::new(format!("{}:{}", second, port), PeerState::Up));

    m2.stop().await.unwrap();

    let down = expect_event(&mut m1_events, Duration::from_secs(2)).await;
    assert_eq!(down.state, PeerState::Down);
    assert_eq!(
        m1.peer_alive(&format!("{}:{}", second, port)).await.unwrap(),
        Some(false)
    );

    m1.stop().await.unwrap();
}
