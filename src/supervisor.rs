//! Session supervisor.
//!
//! The only writer of link state. Discovery, the endpoint and the UI feed it
//! through channels and it processes one input at a time, so a discovered
//! peer and an inbound accept can never interleave. Dials run elsewhere (see
//! [`Dialer`]) and report back as transport events; nothing here awaits a
//! handshake.
//!
//! At most one peer is bound. When the bound session fails for any reason the
//! supervisor passes through `DISCONNECTED` back to `SEARCHING` and forgets
//! the peer, so the next beacon from anyone can be adopted.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::discovery::PeerDiscovered;
use crate::error::SessionError;
use crate::peer::{ConnectionStatus, PeerRecord};
use crate::protocol::close_code;
use crate::state::LinkState;
use crate::transport::{CloseReason, Link, Role, TransportEvent, TransportEvents};

/// Starts and cancels outbound handshakes. Outcomes come back as
/// [`TransportEvent::DialSucceeded`] / [`TransportEvent::DialFailed`].
#[cfg_attr(test, mockall::automock)]
pub trait Dialer: Send + Sync {
    fn dial(&self, attempt: u64, addr: SocketAddr);
    fn cancel(&self, attempt: u64);
}

/// Notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    PeerDiscovered { hostname: String, ip: IpAddr },
    SessionStateChanged(LinkState),
    MessageReceived { sender: IpAddr, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub role: Role,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: LinkState,
    pub peer: Option<PeerRecord>,
    pub session: Option<SessionInfo>,
}

#[derive(Debug)]
pub enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum Input {
    Discovery(PeerDiscovered),
    Transport(TransportEvent),
    Command(Command),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct PendingDial {
    attempt: u64,
    addr: SocketAddr,
}

/// A dial cancelled by a disconnect. Its handshake may already have finished.
#[derive(Debug, Clone)]
struct AbandonedDial {
    dial: PendingDial,
    hostname: String,
}

struct Outgoing {
    text: String,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

pub struct Supervisor<D: Dialer> {
    state: LinkState,
    current_peer: Option<PeerRecord>,
    session: Option<Arc<dyn Link>>,
    /// Writes for `session`, in order, off the event loop.
    outbox: Option<mpsc::UnboundedSender<Outgoing>>,
    pending: Option<PendingDial>,
    abandoned: Option<AbandonedDial>,
    next_attempt: u64,
    peer_port: u16,
    dialer: D,
    ui: broadcast::Sender<UiEvent>,
    tracked: watch::Sender<Option<IpAddr>>,
    transport: TransportEvents,
}

impl<D: Dialer> Supervisor<D> {
    /// `peer_port` is the session port dialed on discovered peers. `transport`
    /// is the sender side of the supervisor's own transport event queue; send
    /// failures are reported through it. The returned receiver follows the
    /// bound peer's address for discovery to dedupe on.
    pub fn new(
        peer_port: u16,
        dialer: D,
        ui: broadcast::Sender<UiEvent>,
        transport: TransportEvents,
    ) -> (Self, watch::Receiver<Option<IpAddr>>) {
        let (tracked, tracked_rx) = watch::channel(None);
        let supervisor = Self {
            state: LinkState::Searching,
            current_peer: None,
            session: None,
            outbox: None,
            pending: None,
            abandoned: None,
            next_attempt: 0,
            peer_port,
            dialer,
            ui,
            tracked,
            transport,
        };
        (supervisor, tracked_rx)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            peer: self.current_peer.clone(),
            session: self.session.as_ref().map(|s| SessionInfo {
                id: s.id(),
                role: s.role(),
                remote: s.remote_addr(),
            }),
        }
    }

    /// Processes inputs until shutdown or until every input channel is gone.
    pub async fn run(
        mut self,
        mut discovery: mpsc::Receiver<PeerDiscovered>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        tracing::info!("Supervisor started in {}", self.state);
        loop {
            let input = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(c) => Input::Command(c),
                    None => Input::Command(Command::Shutdown),
                },
                Some(ev) = transport.recv() => Input::Transport(ev),
                Some(ev) = discovery.recv() => Input::Discovery(ev),
            };
            if self.handle(input).await == Flow::Stop {
                break;
            }
        }
        tracing::info!("Supervisor stopped");
    }

    /// Applies one input. Never awaits network I/O.
    pub async fn handle(&mut self, input: Input) -> Flow {
        match input {
            Input::Discovery(ev) => self.on_peer_discovered(ev),
            Input::Transport(ev) => self.on_transport(ev),
            Input::Command(cmd) => return self.on_command(cmd),
        }
        Flow::Continue
    }

    fn on_peer_discovered(&mut self, ev: PeerDiscovered) {
        if !self.state.accepts_new_peer() {
            match &self.current_peer {
                Some(peer) if peer.ip == ev.ip => {
                    tracing::trace!("Beacon from bound peer {} ({})", ev.hostname, ev.ip);
                }
                Some(peer) => tracing::debug!(
                    "Ignoring {} ({}) while bound to {} ({})",
                    ev.hostname,
                    ev.ip,
                    peer.hostname,
                    peer.ip
                ),
                None => tracing::debug!("Ignoring {} in {}", ev.ip, self.state),
            }
            return;
        }

        tracing::info!("Found peer {} at {}", ev.hostname, ev.ip);
        self.emit(UiEvent::PeerDiscovered {
            hostname: ev.hostname.clone(),
            ip: ev.ip,
        });
        self.adopt(PeerRecord::discovered(ev.hostname, ev.ip));
        if self.state == LinkState::Searching {
            self.advance(LinkState::Found);
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let addr = SocketAddr::new(ev.ip, self.peer_port);
        self.pending = Some(PendingDial { attempt, addr });
        self.abandoned = None;
        if let Some(peer) = self.current_peer.as_mut() {
            peer.status = ConnectionStatus::Connecting;
        }
        self.advance(LinkState::Connecting);
        self.dialer.dial(attempt, addr);
    }

    fn on_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::DialSucceeded { attempt, link } => self.on_dial_succeeded(attempt, link),
            TransportEvent::DialFailed {
                attempt,
                addr,
                error,
            } => {
                if !self.take_pending(attempt) {
                    tracing::debug!("Ignoring stale dial failure to {}: {}", addr, error);
                    return;
                }
                if self.state == LinkState::Connecting {
                    tracing::warn!("Handshake with {} failed: {}", addr, error);
                    self.disconnect();
                } else {
                    tracing::debug!("Redundant dial to {} failed: {}", addr, error);
                }
            }
            TransportEvent::InboundAccepted { link } => self.on_inbound(link),
            TransportEvent::MessageReceived {
                session_id,
                sender,
                text,
            } => {
                if self.is_current(session_id) {
                    self.emit(UiEvent::MessageReceived {
                        sender: sender.ip(),
                        text,
                    });
                } else {
                    tracing::debug!("Dropping message from inactive session {}", session_id);
                }
            }
            TransportEvent::SessionClosed { session_id, reason } => {
                if !self.is_current(session_id) {
                    tracing::debug!("Session {} closed ({:?}), not bound", session_id, reason);
                    return;
                }
                match reason {
                    CloseReason::HeartbeatTimeout => tracing::warn!("Peer heartbeat lost"),
                    CloseReason::TransportClosed(ref why) => tracing::warn!("Session closed: {}", why),
                    CloseReason::Local => tracing::info!("Session closed locally"),
                }
                self.disconnect();
            }
            TransportEvent::SendFailed { session_id, reason } => {
                if self.is_current(session_id) {
                    tracing::warn!("Send failed, dropping session {}: {}", session_id, reason);
                    self.disconnect();
                }
            }
        }
    }

    fn on_dial_succeeded(&mut self, attempt: u64, link: Arc<dyn Link>) {
        if !self.take_pending(attempt) {
            if self.is_abandoned(attempt) {
                self.rebind_abandoned(link);
            } else {
                tracing::debug!("Closing session {} from a cancelled dial", link.id());
                link.close(close_code::DUPLICATE, "superseded");
            }
            return;
        }

        match self.state {
            LinkState::Connecting => self.bind(link),
            LinkState::Connected => self.arbitrate(link),
            _ => link.close(close_code::REJECTED, "not connecting"),
        }
    }

    /// A dial cancelled by the last disconnect still completed. If nothing
    /// else has been adopted since, it is the link to the peer we just lost.
    fn rebind_abandoned(&mut self, link: Arc<dyn Link>) {
        let Some(lost) = self.abandoned.take() else {
            link.close(close_code::DUPLICATE, "superseded");
            return;
        };
        if !self.state.accepts_new_peer() || !link.is_connected() {
            tracing::debug!("Closing late session {} to {}", link.id(), lost.dial.addr);
            link.close(close_code::DUPLICATE, "superseded");
            return;
        }

        tracing::info!("Late dial to {} completed, rebinding {}", lost.dial.addr, lost.hostname);
        self.adopt(PeerRecord::discovered(lost.hostname, lost.dial.addr.ip()));
        self.bind(link);
    }

    fn on_inbound(&mut self, link: Arc<dyn Link>) {
        let ip = link.remote_addr().ip();
        let same_peer = self.current_peer.as_ref().is_some_and(|p| p.ip == ip);

        match self.state {
            LinkState::Searching | LinkState::Found => {
                if !same_peer {
                    self.adopt(PeerRecord::inbound(ip));
                }
                tracing::info!("Peer {} connected to us", ip);
                self.bind(link);
            }
            LinkState::Connecting if same_peer => {
                // Keep the outbound dial alive; it is arbitrated if it completes.
                tracing::info!("Peer {} connected to us while we were dialing", ip);
                self.bind(link);
            }
            LinkState::Connected if same_peer => self.arbitrate(link),
            _ => {
                tracing::info!("Rejecting inbound session from {} in {}", ip, self.state);
                link.close(close_code::REJECTED, "busy");
            }
        }
    }

    /// Both nodes keep the session opened by the lower dialer address, so a
    /// simultaneous mutual dial converges on the same connection.
    fn arbitrate(&mut self, candidate: Arc<dyn Link>) {
        let Some(current) = self.session.as_ref() else {
            self.bind(candidate);
            return;
        };

        if candidate.dialer_addr() < current.dialer_addr() {
            tracing::info!(
                "Replacing session {} with {} (dialed by {})",
                current.id(),
                candidate.id(),
                candidate.dialer_addr()
            );
            current.close(close_code::DUPLICATE, "duplicate");
            self.set_session(candidate);
        } else {
            tracing::info!("Closing duplicate session {}", candidate.id());
            candidate.close(close_code::DUPLICATE, "duplicate");
        }
    }

    fn bind(&mut self, link: Arc<dyn Link>) {
        if let Some(peer) = self.current_peer.as_mut() {
            peer.status = ConnectionStatus::Connected;
        }
        tracing::info!("Bound session {} ({:?}) with {}", link.id(), link.role(), link.remote_addr());
        self.set_session(link);
        self.advance(LinkState::Connected);
    }

    fn set_session(&mut self, link: Arc<dyn Link>) {
        self.outbox = Some(spawn_writer(Arc::clone(&link), self.transport.clone()));
        self.session = Some(link);
    }

    fn adopt(&mut self, peer: PeerRecord) {
        self.tracked.send_replace(Some(peer.ip));
        self.current_peer = Some(peer);
    }

    fn disconnect(&mut self) {
        self.outbox = None;
        if let Some(session) = self.session.take() {
            session.close(close_code::SHUTDOWN, "disconnect");
        }
        let lost = self.current_peer.take();
        if let Some(pending) = self.pending.take() {
            tracing::debug!("Cancelling dial {} to {}", pending.attempt, pending.addr);
            self.dialer.cancel(pending.attempt);
            self.abandoned = lost.map(|peer| AbandonedDial {
                dial: pending,
                hostname: peer.hostname,
            });
        }
        self.tracked.send_replace(None);
        self.advance(LinkState::Disconnected);
        self.advance(LinkState::Searching);
    }

    fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Send { text, reply } => {
                self.send(text, reply);
                Flow::Continue
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            Command::Shutdown => {
                self.shutdown();
                Flow::Stop
            }
        }
    }

    /// Queues `text` on the bound session's writer; the reply comes from there.
    fn send(&mut self, text: String, reply: oneshot::Sender<Result<(), SessionError>>) {
        let outbox = match (&self.outbox, self.state) {
            (Some(outbox), LinkState::Connected) => outbox,
            _ => {
                let _ = reply.send(Err(SessionError::NotConnected));
                return;
            }
        };
        if let Err(mpsc::error::SendError(msg)) = outbox.send(Outgoing { text, reply }) {
            let _ = msg.reply.send(Err(SessionError::NotConnected));
        }
    }

    fn shutdown(&mut self) {
        self.outbox = None;
        self.abandoned = None;
        if let Some(pending) = self.pending.take() {
            self.dialer.cancel(pending.attempt);
        }
        if let Some(session) = self.session.take() {
            session.close(close_code::SHUTDOWN, "shutdown");
        }
        self.current_peer = None;
        self.tracked.send_replace(None);
    }

    fn take_pending(&mut self, attempt: u64) -> bool {
        match self.pending {
            Some(p) if p.attempt == attempt => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    fn is_abandoned(&self, attempt: u64) -> bool {
        self.abandoned
            .as_ref()
            .is_some_and(|a| a.dial.attempt == attempt)
    }

    fn is_current(&self, session_id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id() == session_id)
    }

    fn advance(&mut self, next: LinkState) {
        if !self.state.can_advance_to(next) {
            tracing::error!("Refusing illegal transition {} -> {}", self.state, next);
            return;
        }
        tracing::info!("Link {} -> {}", self.state, next);
        self.state = next;
        self.emit(UiEvent::SessionStateChanged(next));
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is fine; the core never waits on the UI.
        let _ = self.ui.send(event);
    }
}

/// Drains one session's outgoing messages in order. A transport failure is
/// reported back as [`TransportEvent::SendFailed`]; the writer then stops.
fn spawn_writer(link: Arc<dyn Link>, events: TransportEvents) -> mpsc::UnboundedSender<Outgoing> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    tokio::spawn(async move {
        while let Some(Outgoing { text, reply }) = rx.recv().await {
            let result = link.send(&text).await;
            let failure = match &result {
                Err(SessionError::Transport(why)) => Some(why.clone()),
                _ => None,
            };
            let _ = reply.send(result);
            if let Some(reason) = failure {
                let _ = events.send(TransportEvent::SendFailed {
                    session_id: link.id(),
                    reason,
                });
                break;
            }
        }
    });
    tx
}

/// Cloneable front door to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    /// Sends `text` on the active session.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Send {
            text: text.into(),
            reply,
        };
        if self.commands.send(cmd).await.is_err() {
            return Err(SessionError::NotConnected);
        }
        rx.await.unwrap_or(Err(SessionError::NotConnected))
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
