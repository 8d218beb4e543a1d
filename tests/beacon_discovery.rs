//! Beacon discovery over real loopback UDP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hampter_link_lib::discovery::{BeaconSettings, Discovery, PeerDiscovered};
use hampter_link_lib::protocol::{BeaconMessage, STATUS_READY};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn settings(hostname: &str, announce_to: std::net::SocketAddr) -> BeaconSettings {
    BeaconSettings {
        hostname: hostname.to_string(),
        bind: "127.0.0.1:0".parse().unwrap(),
        announce_to,
        interval: Duration::from_millis(50),
    }
}

async fn expect_quiet(rx: &mut mpsc::Receiver<PeerDiscovered>) {
    let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(got.is_err(), "unexpected event {got:?}");
}

#[tokio::test]
async fn test_listener_survives_noise_and_reports_valid_beacon() {
    // Arrange
    let (_tracked_tx, tracked_rx) = watch::channel(None);
    let (tx, mut rx) = mpsc::channel(8);
    let mut discovery = Discovery::start(settings("nodeB", "127.0.0.1:9".parse().unwrap()), tracked_rx, tx)
        .await
        .unwrap();
    let target = discovery.local_addr();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut truncated = BeaconMessage::ready("nodeA").encode();
    truncated.truncate(truncated.len() - 3);
    let noise: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"HAMPTER_BEACO".to_vec(),
        b"hampter_beacon{\"hostname\":\"nodeA\",\"status\":\"READY\"}".to_vec(),
        b"HAMPTER_BEACON[1,2,3]".to_vec(),
        truncated,
        vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0xff],
    ];

    // Act
    for datagram in &noise {
        sender.send_to(datagram, target).await.unwrap();
    }
    sender
        .send_to(&BeaconMessage::ready("nodeA").encode(), target)
        .await
        .unwrap();

    // Assert
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("valid beacon after noise must be reported")
        .unwrap();
    assert_eq!(
        event,
        PeerDiscovered {
            hostname: "nodeA".to_string(),
            ip: LOOPBACK,
        }
    );
    expect_quiet(&mut rx).await;

    discovery.stop().await;
}

#[tokio::test]
async fn test_listener_drops_own_and_tracked_beacons() {
    let (tracked_tx, tracked_rx) = watch::channel(None);
    let (tx, mut rx) = mpsc::channel(8);
    let mut discovery = Discovery::start(settings("nodeB", "127.0.0.1:9".parse().unwrap()), tracked_rx, tx)
        .await
        .unwrap();
    let target = discovery.local_addr();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sender
        .send_to(&BeaconMessage::ready("nodeB").encode(), target)
        .await
        .unwrap();
    expect_quiet(&mut rx).await;

    tracked_tx.send_replace(Some(LOOPBACK));
    sender
        .send_to(&BeaconMessage::ready("nodeA").encode(), target)
        .await
        .unwrap();
    expect_quiet(&mut rx).await;

    tracked_tx.send_replace(None);
    sender
        .send_to(&BeaconMessage::ready("nodeA").encode(), target)
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.hostname, "nodeA");

    discovery.stop().await;
}

#[tokio::test]
async fn test_broadcaster_announces_ready_beacon() {
    // Arrange
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (_tracked_tx, tracked_rx) = watch::channel(None);
    let (tx, _rx) = mpsc::channel(8);
    let mut discovery = Discovery::start(settings("nodeA", receiver.local_addr().unwrap()), tracked_rx, tx)
        .await
        .unwrap();

    // Act
    let mut buf = [0u8; 512];
    let (len, src) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
        .await
        .expect("no beacon received")
        .unwrap();

    // Assert
    let beacon = BeaconMessage::decode(&buf[..len]).unwrap();
    assert_eq!(beacon.hostname, "nodeA");
    assert_eq!(beacon.status, STATUS_READY);
    assert_eq!(src, discovery.local_addr());

    discovery.stop().await;
}
