//! Line-oriented console: prints link events and turns stdin lines into
//! chat messages or `/` commands.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::hardware::{FanController, FanMode, Telemetry};
use crate::supervisor::{Snapshot, SupervisorHandle, UiEvent};
use crate::transport;

const HELP: &str = "\
Commands:
  /help         show this help
  /status       cpu, memory, disk, temperature and local address
  /fan <0-100>  set the fan to a fixed speed
  /fan          return the fan to auto mode
  /link         show link state and peer
  /quit         exit
Anything else is sent to the connected peer.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Fan(Option<u8>),
    Link,
    Quit,
    Chat(String),
    Invalid(String),
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(ConsoleCommand::Chat(line.to_string()));
        };

        let mut parts = rest.split_whitespace();
        let cmd = match (parts.next(), parts.next(), parts.next()) {
            (Some("help"), None, _) => ConsoleCommand::Help,
            (Some("status"), None, _) => ConsoleCommand::Status,
            (Some("link"), None, _) => ConsoleCommand::Link,
            (Some("quit"), None, _) => ConsoleCommand::Quit,
            (Some("fan"), None, _) => ConsoleCommand::Fan(None),
            (Some("fan"), Some(speed), None) => match speed.parse::<u8>() {
                Ok(p) if p <= 100 => ConsoleCommand::Fan(Some(p)),
                _ => ConsoleCommand::Invalid(format!("fan speed must be 0-100, got {speed}")),
            },
            _ => ConsoleCommand::Invalid(format!("unknown command: {line}")),
        };
        Some(cmd)
    }
}

pub fn render_event(event: &UiEvent) -> String {
    match event {
        UiEvent::PeerDiscovered { hostname, ip } => format!("* found {hostname} at {ip}"),
        UiEvent::SessionStateChanged(state) => format!("* link {state}"),
        UiEvent::MessageReceived { sender, text } => format!("<{sender}> {text}"),
    }
}

pub fn render_snapshot(snapshot: &Snapshot) -> String {
    let mut out = format!("state: {}", snapshot.state);
    if let Some(peer) = &snapshot.peer {
        out.push_str(&format!("\npeer:  {} ({}, {:?})", peer.hostname, peer.ip, peer.status));
    }
    if let Some(session) = &snapshot.session {
        out.push_str(&format!(
            "\nsession {}: {:?} with {}",
            session.id, session.role, session.remote
        ));
    }
    out
}

pub struct Console {
    handle: SupervisorHandle,
    fan: Option<Arc<dyn FanController>>,
    telemetry: Arc<dyn Telemetry>,
}

impl Console {
    pub fn new(
        handle: SupervisorHandle,
        fan: Option<Arc<dyn FanController>>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            handle,
            fan,
            telemetry,
        }
    }

    /// Runs until `/quit`, end of input or `shutdown` fires. Cancels
    /// `shutdown` on the way out so the rest of the process follows.
    pub async fn run(self, mut events: broadcast::Receiver<UiEvent>, shutdown: CancellationToken) {
        let mut lines = spawn_stdin_reader();
        println!("Type /help for commands.");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(ev) => println!("{}", render_event(&ev)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Console skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                line = lines.recv() => match line {
                    Some(line) => {
                        let Some(cmd) = ConsoleCommand::parse(&line) else { continue };
                        if !self.execute(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        shutdown.cancel();
    }

    /// Returns `false` when the console should exit.
    pub async fn execute(&self, cmd: ConsoleCommand) -> bool {
        match cmd {
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Status => {
                let status = self.telemetry.status();
                let temp = status
                    .temperature_c
                    .map(|t| format!("{t:.1}C"))
                    .unwrap_or_else(|| "n/a".to_string());
                let disk = status
                    .disk_percent
                    .map(|d| format!("{d:.1}%"))
                    .unwrap_or_else(|| "n/a".to_string());
                let ip = transport::local_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "cpu {:.1}%  ram {:.1}%  disk {}  temp {}  ip {}",
                    status.cpu_percent, status.ram_percent, disk, temp, ip
                );
                if let Some(fan) = &self.fan {
                    match fan.mode() {
                        FanMode::Auto => println!("fan auto"),
                        FanMode::Manual(p) => println!("fan {p}%"),
                    }
                }
            }
            ConsoleCommand::Fan(speed) => match &self.fan {
                None => println!("fan control is disabled"),
                Some(fan) => match speed {
                    Some(p) => match fan.set_manual_speed(p) {
                        Ok(()) => println!("fan set to {p}%"),
                        Err(e) => println!("{e}"),
                    },
                    None => {
                        fan.set_auto_mode();
                        println!("fan set to auto");
                    }
                },
            },
            ConsoleCommand::Link => match self.handle.snapshot().await {
                Some(snapshot) => println!("{}", render_snapshot(&snapshot)),
                None => println!("link is down"),
            },
            ConsoleCommand::Quit => return false,
            ConsoleCommand::Chat(text) => match self.handle.send(text).await {
                Ok(()) => {}
                Err(SessionError::NotConnected) => println!("not connected"),
                Err(e) => println!("send failed: {e}"),
            },
            ConsoleCommand::Invalid(msg) => println!("{msg}"),
        }
        true
    }
}

/// Blocking stdin reads on a detached thread; a pending read must not keep
/// the runtime alive at shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!("Console input failed: {}", e);
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
