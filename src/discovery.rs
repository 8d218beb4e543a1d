//! UDP beacon discovery.
//!
//! One broadcast-enabled socket is shared by two tasks: the broadcaster
//! announces `{hostname, "READY"}` every interval, and the listener turns
//! valid beacons from other hosts into [`PeerDiscovered`] events. Anything on
//! the port that is not a well-formed beacon is dropped silently; the medium
//! is shared and noisy.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::DiscoveryError;
use crate::protocol::BeaconMessage;

const RECV_BUFFER: usize = 2048;
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDiscovered {
    pub hostname: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone)]
pub struct BeaconSettings {
    pub hostname: String,
    pub bind: SocketAddr,
    pub announce_to: SocketAddr,
    pub interval: Duration,
}

impl BeaconSettings {
    pub fn from_config(config: &Config, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            bind: config.discovery.bind_addr(),
            announce_to: config.discovery.announce_addr(),
            interval: config.discovery.interval(),
        }
    }
}

/// Decides whether a received datagram is a beacon worth reporting.
///
/// Drops protocol noise, our own beacons, and beacons from the address the
/// supervisor is already tracking.
pub fn accept_beacon(
    datagram: &[u8],
    src: IpAddr,
    local_hostname: &str,
    tracked: Option<IpAddr>,
) -> Option<PeerDiscovered> {
    let beacon = match BeaconMessage::decode(datagram) {
        Ok(b) => b,
        Err(e) => {
            tracing::trace!("Dropping datagram from {}: {}", src, e);
            return None;
        }
    };

    if beacon.hostname == local_hostname {
        return None;
    }

    if tracked == Some(src) {
        return None;
    }

    Some(PeerDiscovered {
        hostname: beacon.hostname,
        ip: src,
    })
}

pub struct Discovery {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Binds the beacon socket and starts the broadcaster and listener.
    ///
    /// `tracked` carries the supervisor's current peer address; it is only read.
    pub async fn start(
        settings: BeaconSettings,
        tracked: watch::Receiver<Option<IpAddr>>,
        events: mpsc::Sender<PeerDiscovered>,
    ) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(settings.bind)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: settings.bind,
                source,
            })?;
        socket
            .set_broadcast(true)
            .map_err(DiscoveryError::Broadcast)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let cancel = CancellationToken::new();

        let broadcaster = tokio::spawn(broadcast_loop(
            Arc::clone(&socket),
            settings.clone(),
            cancel.clone(),
        ));
        let listener = tokio::spawn(listen_loop(
            socket,
            settings.hostname.clone(),
            tracked,
            events,
            cancel.clone(),
        ));

        tracing::info!(
            "Discovery listening on {} (announcing to {} every {:?})",
            local_addr,
            settings.announce_to,
            settings.interval
        );

        Ok(Self {
            local_addr,
            cancel,
            tasks: vec![broadcaster, listener],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Stops both loops and releases the socket. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Discovery task ended abnormally: {}", e);
            }
        }
        tracing::info!("Discovery stopped");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn broadcast_loop(socket: Arc<UdpSocket>, settings: BeaconSettings, cancel: CancellationToken) {
    let datagram = BeaconMessage::ready(&settings.hostname).encode();
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&datagram, settings.announce_to).await {
                    tracing::warn!("Beacon send to {} failed: {}", settings.announce_to, e);
                }
            }
        }
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    local_hostname: String,
    tracked: watch::Receiver<Option<IpAddr>>,
    events: mpsc::Sender<PeerDiscovered>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Beacon receive failed: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let current = *tracked.borrow();
        let Some(event) = accept_beacon(&buf[..len], src.ip(), &local_hostname, current) else {
            continue;
        };

        tracing::debug!("Beacon from {} ({})", event.hostname, event.ip);
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                // The next beacon from this host will be reported again.
                tracing::debug!("Discovery queue full, dropping beacon from {}", ev.ip);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_accept_beacon_emits_for_foreign_host() {
        let datagram = BeaconMessage::ready("nodeA").encode();

        let event = accept_beacon(&datagram, ip("10.0.0.1"), "nodeB", None);

        assert_eq!(
            event,
            Some(PeerDiscovered {
                hostname: "nodeA".to_string(),
                ip: ip("10.0.0.1"),
            })
        );
    }

    #[test]
    fn test_accept_beacon_suppresses_own_hostname() {
        let datagram = BeaconMessage::ready("nodeB").encode();

        assert_eq!(accept_beacon(&datagram, ip("10.0.0.2"), "nodeB", None), None);
    }

    #[test]
    fn test_accept_beacon_dedupes_tracked_address() {
        let datagram = BeaconMessage::ready("nodeA").encode();

        let event = accept_beacon(&datagram, ip("10.0.0.1"), "nodeB", Some(ip("10.0.0.1")));

        assert_eq!(event, None);
    }

    #[test]
    fn test_accept_beacon_reports_other_address_while_tracking() {
        // Filtering non-bound peers is the supervisor's call, not discovery's.
        let datagram = BeaconMessage::ready("nodeC").encode();

        let event = accept_beacon(&datagram, ip("10.0.0.3"), "nodeB", Some(ip("10.0.0.1")));

        assert!(event.is_some());
    }

    #[test]
    fn test_accept_beacon_ignores_noise() {
        let noise: [&[u8]; 5] = [
            b"",
            b"HAMPTER",
            b"HAMPTER_BEACON",
            b"HAMPTER_BEACON{\"hostname\":",
            &[0xff, 0x00, 0x13, 0x37],
        ];

        for datagram in noise {
            assert_eq!(accept_beacon(datagram, ip("10.0.0.1"), "nodeB", None), None);
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        // Arrange
        let settings = BeaconSettings {
            hostname: "nodeB".to_string(),
            bind: "127.0.0.1:0".parse().unwrap(),
            announce_to: "127.0.0.1:9".parse().unwrap(),
            interval: Duration::from_millis(50),
        };
        let (_tracked_tx, tracked_rx) = watch::channel(None);
        let (tx, _rx) = mpsc::channel(8);
        let mut discovery = Discovery::start(settings, tracked_rx, tx).await.unwrap();

        // Act
        discovery.stop().await;
        discovery.stop().await;

        // Assert
        assert!(!discovery.is_running());
    }

    #[tokio::test]
    async fn test_stop_releases_the_port() {
        let settings = BeaconSettings {
            hostname: "nodeB".to_string(),
            bind: "127.0.0.1:0".parse().unwrap(),
            announce_to: "127.0.0.1:9".parse().unwrap(),
            interval: Duration::from_millis(50),
        };
        let (_tracked_tx, tracked_rx) = watch::channel(None);
        let (tx, _rx) = mpsc::channel(8);
        let mut discovery = Discovery::start(settings, tracked_rx, tx).await.unwrap();
        let addr = discovery.local_addr();

        discovery.stop().await;

        assert!(UdpSocket::bind(addr).await.is_ok(), "port must be free after stop");
    }
}
