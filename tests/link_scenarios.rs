//! Two nodes on loopback: one-sided discovery and simultaneous mutual discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use hampter_link_lib::config::SessionConfig;
use hampter_link_lib::discovery::BeaconSettings;
use hampter_link_lib::identity::IdentityStore;
use hampter_link_lib::node::{Node, NodeSettings};
use hampter_link_lib::state::LinkState;
use hampter_link_lib::supervisor::{Snapshot, SupervisorHandle, UiEvent};
use hampter_link_lib::transport::Role;
use tokio::sync::broadcast;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEAD_PORT: u16 = 9;

/// Ports for one node: beacon socket and session endpoint.
struct Ports {
    discovery: u16,
    session: u16,
}

fn free_ports() -> Ports {
    let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let quic = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    Ports {
        discovery: udp.local_addr().unwrap().port(),
        session: quic.local_addr().unwrap().port(),
    }
}

fn settings(hostname: &str, own: &Ports, announce_port: u16, peer_session_port: u16) -> NodeSettings {
    NodeSettings {
        beacon: BeaconSettings {
            hostname: hostname.to_string(),
            bind: SocketAddr::new(LOOPBACK, own.discovery),
            announce_to: SocketAddr::new(LOOPBACK, announce_port),
            interval: Duration::from_millis(100),
        },
        session_bind: SocketAddr::new(LOOPBACK, own.session),
        peer_port: peer_session_port,
        session: SessionConfig {
            port: own.session,
            heartbeat_interval_ms: 200,
            heartbeat_timeout_ms: 2000,
            handshake_timeout_ms: 2000,
            idle_timeout_ms: 3000,
        },
    }
}

async fn start(dir: &Path, settings: NodeSettings) -> (Node, broadcast::Receiver<UiEvent>) {
    let hostname = settings.beacon.hostname.clone();
    let identity = IdentityStore::at(&dir.join(&hostname), hostname)
        .ensure_identity()
        .unwrap();
    let node = Node::start(settings, &identity).await.unwrap();
    let events = node.subscribe();
    (node, events)
}

async fn wait_for<F>(handle: &SupervisorHandle, what: &str, mut done: F) -> Snapshot
where
    F: FnMut(&Snapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.snapshot().await.expect("supervisor stopped");
        if done(&snapshot) {
            return snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}: {snapshot:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn next_message(events: &mut broadcast::Receiver<UiEvent>) -> (IpAddr, String) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(UiEvent::MessageReceived { sender, text }) => return (sender, text),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("ui channel closed: {e}"),
            }
        }
    })
    .await
    .expect("no message received")
}

fn connected(s: &Snapshot) -> bool {
    s.state == LinkState::Connected && s.session.is_some()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_sided_discovery_connects_and_delivers_message() {
    // Arrange: only A's beacons reach B, so B dials and A accepts.
    let dir = tempfile::tempdir().unwrap();
    let a_ports = free_ports();
    let b_ports = free_ports();
    let (mut node_a, mut a_events) = start(
        dir.path(),
        settings("nodeA", &a_ports, b_ports.discovery, DEAD_PORT),
    )
    .await;
    let (mut node_b, _b_events) = start(
        dir.path(),
        settings("nodeB", &b_ports, DEAD_PORT, a_ports.session),
    )
    .await;
    let a = node_a.handle();
    let b = node_b.handle();

    // Act
    let b_view = wait_for(&b, "B connected", connected).await;
    wait_for(&a, "A connected", connected).await;
    b.send("hello").await.unwrap();

    // Assert
    let b_session = b_view.session.unwrap();
    assert_eq!(b_session.role, Role::Client);
    assert_eq!(b_session.remote, SocketAddr::new(LOOPBACK, a_ports.session));
    assert_eq!(b_view.peer.unwrap().hostname, "nodeA");
    assert_eq!(next_message(&mut a_events).await, (LOOPBACK, "hello".to_string()));

    node_b.shutdown().await;
    node_a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutual_discovery_converges_on_one_session() {
    // Arrange: both nodes hear each other and dial at once.
    let dir = tempfile::tempdir().unwrap();
    let a_ports = free_ports();
    let b_ports = free_ports();
    let (mut node_a, mut a_events) = start(
        dir.path(),
        settings("nodeA", &a_ports, b_ports.discovery, b_ports.session),
    )
    .await;
    let (mut node_b, mut b_events) = start(
        dir.path(),
        settings("nodeB", &b_ports, a_ports.discovery, a_ports.session),
    )
    .await;
    let a = node_a.handle();
    let b = node_b.handle();

    // Act: wait until each side sees the other as the opposite role on one connection.
    let agree = |a: &Snapshot, b: &Snapshot| match (&a.session, &b.session) {
        (Some(sa), Some(sb)) => connected(a) && connected(b) && sa.role != sb.role,
        _ => false,
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let sa = a.snapshot().await.unwrap();
        let sb = b.snapshot().await.unwrap();
        if agree(&sa, &sb) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no agreement: {sa:?} / {sb:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Assert: the agreement is stable and the surviving session carries traffic both ways.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let sa = a.snapshot().await.unwrap();
    let sb = b.snapshot().await.unwrap();
    assert!(agree(&sa, &sb), "diverged: {sa:?} / {sb:?}");

    a.send("from A").await.unwrap();
    b.send("from B").await.unwrap();
    assert_eq!(next_message(&mut b_events).await, (LOOPBACK, "from A".to_string()));
    assert_eq!(next_message(&mut a_events).await, (LOOPBACK, "from B".to_string()));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_shutdown_returns_survivor_to_searching() {
    let dir = tempfile::tempdir().unwrap();
    let a_ports = free_ports();
    let b_ports = free_ports();
    let (mut node_a, _a_events) = start(
        dir.path(),
        settings("nodeA", &a_ports, b_ports.discovery, DEAD_PORT),
    )
    .await;
    let (mut node_b, _b_events) = start(
        dir.path(),
        settings("nodeB", &b_ports, DEAD_PORT, a_ports.session),
    )
    .await;
    let b = node_b.handle();
    wait_for(&b, "B connected", connected).await;

    node_a.shutdown().await;

    let after = wait_for(&b, "B back to searching", |s| s.state != LinkState::Connected).await;
    assert!(after.session.is_none());
    node_b.shutdown().await;
}
