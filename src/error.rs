//! Error taxonomy shared by every component.
//!
//! Only [`ConfigurationError`] is allowed to escape to `main`; everything else
//! is either dropped where it happens (discovery noise) or turned into a state
//! transition by the supervisor.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Identity or config material could not be created, read or parsed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid PEM material in {path}: {reason}")]
    Pem { path: PathBuf, reason: String },
    #[error("could not determine local hostname: {0}")]
    Hostname(std::io::Error),
}

/// Failures of the beacon socket itself.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind beacon socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to enable broadcast: {0}")]
    Broadcast(std::io::Error),
    #[error("transient network error: {0}")]
    Transient(#[from] std::io::Error),
}

/// A datagram that is not a well-formed beacon.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("datagram does not start with the beacon magic")]
    BadMagic,
    #[error("beacon body is not valid JSON: {0}")]
    MalformedBody(String),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Establishing a secure session failed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to start connection to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: quinn::ConnectError,
    },
    #[error("handshake with {addr} failed: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: quinn::ConnectionError,
    },
    #[error("handshake with {0} timed out")]
    TimedOut(SocketAddr),
}

/// Errors surfaced by an established (or absent) session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active session")]
    NotConnected,
    #[error("session transport error: {0}")]
    Transport(String),
}

/// The QUIC endpoint could not be set up.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Identity(#[from] ConfigurationError),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("failed to bind session endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HardwareError {
    #[error("fan speed must be 0-100, got {0}")]
    InvalidSpeed(u8),
}

/// The interface setup script could not be run or reported failure.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("network.ip_address must be set to configure {0}")]
    MissingAddress(String),
    #[error("failed to launch {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{script} exited with {code:?}: {stderr}")]
    Failed {
        script: PathBuf,
        code: Option<i32>,
        stderr: String,
    },
}

/// A node could not bring up its long-lived activities.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
