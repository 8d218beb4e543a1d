//! Runtime configuration.
//!
//! A single [`Config`] value is resolved in `main` (JSON file, then CLI
//! overrides) and handed by reference to each component constructor. Every
//! section is `#[serde(default)]`, so a partial or missing file still yields a
//! complete config.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const DEFAULT_DISCOVERY_PORT: u16 = 5566;
pub const DEFAULT_SESSION_PORT: u16 = 4433;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Overrides the OS hostname used in beacons and the certificate.
    pub hostname: Option<String>,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub broadcast_address: IpAddr,
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            interval_ms: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn announce_addr(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Port the server role binds and the client role dials.
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SESSION_PORT,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("certs"),
        }
    }
}

impl IdentityConfig {
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join("cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("key.pem")
    }
}

/// Ad-hoc interface settings, only used when `configure` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
    pub ip_address: Option<Ipv4Addr>,
    pub channel: u8,
    pub configure: bool,
    pub script: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            ip_address: None,
            channel: 1,
            configure: false,
            script: PathBuf::from("./setup_network.sh"),
        }
    }
}

impl Config {
    /// Reads the config file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigurationError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The hostname this node announces: the override if set, else the OS name.
    pub fn local_hostname(&self) -> Result<String, ConfigurationError> {
        if let Some(name) = &self.hostname {
            return Ok(name.clone());
        }
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .map_err(ConfigurationError::Hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_wire_ports() {
        let cfg = Config::default();

        assert_eq!(cfg.discovery.port, 5566);
        assert_eq!(cfg.session.port, 4433);
        assert_eq!(cfg.discovery.interval(), Duration::from_secs(2));
        assert_eq!(cfg.session.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(
            cfg.discovery.announce_addr(),
            "255.255.255.255:5566".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_partial_json_fills_in_defaults() {
        // Arrange
        let json = r#"{ "hostname": "nodeA", "session": { "port": 9000 } }"#;

        // Act
        let cfg: Config = serde_json::from_str(json).unwrap();

        // Assert
        assert_eq!(cfg.hostname.as_deref(), Some("nodeA"));
        assert_eq!(cfg.session.port, 9000);
        assert_eq!(cfg.session.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();

        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_load_malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = Config::load(&path);

        assert!(matches!(result, Err(ConfigurationError::Parse { .. })));
    }

    #[test]
    fn test_local_hostname_prefers_override() {
        let cfg = Config {
            hostname: Some("nodeB".to_string()),
            ..Config::default()
        };

        assert_eq!(cfg.local_hostname().unwrap(), "nodeB");
    }

    #[test]
    fn test_identity_paths_live_in_configured_dir() {
        let cfg = IdentityConfig {
            dir: PathBuf::from("/tmp/hl"),
        };

        assert_eq!(cfg.cert_path(), PathBuf::from("/tmp/hl/cert.pem"));
        assert_eq!(cfg.key_path(), PathBuf::from("/tmp/hl/key.pem"));
    }
}
