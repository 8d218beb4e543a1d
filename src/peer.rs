use std::net::IpAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionStatus {
    Discovered,
    Connecting,
    Connected,
}

/// The single peer the supervisor is currently working with.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerRecord {
    pub hostname: String,
    pub ip: IpAddr,
    pub discovered_at: SystemTime,
    pub status: ConnectionStatus,
}

impl PeerRecord {
    pub fn discovered(hostname: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
            discovered_at: SystemTime::now(),
            status: ConnectionStatus::Discovered,
        }
    }

    /// Record for a peer that dialed us before we heard its beacon.
    pub fn inbound(ip: IpAddr) -> Self {
        Self {
            hostname: ip.to_string(),
            ip,
            discovered_at: SystemTime::now(),
            status: ConnectionStatus::Connected,
        }
    }
}
