//! Composition root: wires discovery, the session endpoint and the supervisor
//! together and owns their lifetimes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{Config, SessionConfig};
use crate::discovery::{BeaconSettings, Discovery};
use crate::error::{EndpointError, NodeError};
use crate::identity::Identity;
use crate::supervisor::{Supervisor, SupervisorHandle, UiEvent};
use crate::transport::{QuicDialer, SecureEndpoint};

const DISCOVERY_QUEUE: usize = 32;
const COMMAND_QUEUE: usize = 16;
const UI_QUEUE: usize = 128;
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub beacon: BeaconSettings,
    pub session_bind: SocketAddr,
    /// Session port dialed on discovered peers.
    pub peer_port: u16,
    pub session: SessionConfig,
}

impl NodeSettings {
    pub fn from_config(config: &Config, hostname: impl Into<String>) -> Self {
        Self {
            beacon: BeaconSettings::from_config(config, hostname),
            session_bind: config.session.bind_addr(),
            peer_port: config.session.port,
            session: config.session.clone(),
        }
    }
}

pub struct Node {
    hostname: String,
    discovery: Discovery,
    endpoint: SecureEndpoint,
    supervisor: SupervisorHandle,
    supervisor_task: Option<JoinHandle<()>>,
    accept_task: Option<JoinHandle<()>>,
    ui: broadcast::Sender<UiEvent>,
}

impl Node {
    pub async fn start(settings: NodeSettings, identity: &Identity) -> Result<Self, NodeError> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (ui, _) = broadcast::channel(UI_QUEUE);

        let endpoint = SecureEndpoint::bind(
            settings.session_bind,
            identity,
            &settings.session,
            transport_tx.clone(),
        )?;
        let accept_task = endpoint.start_listening();

        let dialer = QuicDialer::new(endpoint.clone(), transport_tx.clone());
        let (supervisor, tracked) =
            Supervisor::new(settings.peer_port, dialer, ui.clone(), transport_tx);

        let discovery = match Discovery::start(settings.beacon.clone(), tracked, discovery_tx).await {
            Ok(d) => d,
            Err(e) => {
                accept_task.abort();
                endpoint.close().await;
                return Err(e.into());
            }
        };

        let supervisor_task = tokio::spawn(supervisor.run(discovery_rx, transport_rx, command_rx));

        tracing::info!(
            "Node {} up: sessions on {}, beacons on {}",
            settings.beacon.hostname,
            endpoint.local_addr()?,
            discovery.local_addr()
        );

        Ok(Self {
            hostname: settings.beacon.hostname,
            discovery,
            endpoint,
            supervisor: SupervisorHandle::new(command_tx),
            supervisor_task: Some(supervisor_task),
            accept_task: Some(accept_task),
            ui,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.supervisor.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    pub fn session_addr(&self) -> Result<SocketAddr, EndpointError> {
        self.endpoint.local_addr()
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery.local_addr()
    }

    /// Stops discovery, the supervisor (closing any session and dial) and the
    /// endpoint, in that order. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        let Some(supervisor_task) = self.supervisor_task.take() else {
            return;
        };
        tracing::info!("Shutting down node {}", self.hostname);

        self.discovery.stop().await;

        self.supervisor.shutdown().await;
        if tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, supervisor_task)
            .await
            .is_err()
        {
            tracing::warn!("Supervisor did not stop within {:?}", SUPERVISOR_STOP_TIMEOUT);
        }

        self.endpoint.close().await;
        if let Some(accept) = self.accept_task.take() {
            accept.abort();
        }
        tracing::info!("Node {} stopped", self.hostname);
    }
}
