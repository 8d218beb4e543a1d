use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Prefix of every beacon datagram.
pub const BEACON_MAGIC: &[u8] = b"HAMPTER_BEACON";

/// Keepalive token written on the control stream.
pub const HEARTBEAT: &[u8; 4] = b"PING";

pub const STATUS_READY: &str = "READY";

/// Largest application frame accepted on a session.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// SNI presented by the client role. The server certificate is not verified.
pub const SERVER_NAME: &str = "hampter-link";

/// QUIC application close codes.
pub mod close_code {
    pub const SHUTDOWN: u32 = 0;
    pub const DUPLICATE: u32 = 1;
    pub const HEARTBEAT_TIMEOUT: u32 = 2;
    pub const REJECTED: u32 = 3;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BeaconMessage {
    pub hostname: String,
    pub status: String,
}

impl BeaconMessage {
    pub fn ready(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            status: STATUS_READY.to_string(),
        }
    }

    /// `MAGIC || json`
    pub fn encode(&self) -> Vec<u8> {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let mut datagram = Vec::with_capacity(BEACON_MAGIC.len() + body.len());
        datagram.extend_from_slice(BEACON_MAGIC);
        datagram.extend_from_slice(&body);
        datagram
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolViolation> {
        let body = datagram
            .strip_prefix(BEACON_MAGIC)
            .ok_or(ProtocolViolation::BadMagic)?;
        serde_json::from_slice(body).map_err(|e| ProtocolViolation::MalformedBody(e.to_string()))
    }
}
