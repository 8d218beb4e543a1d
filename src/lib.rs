pub mod config;
pub mod console;
pub mod discovery;
pub mod error;
pub mod hardware;
pub mod identity;
pub mod interface;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod transport;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use config::Config;
use console::Console;
use hardware::{FanController, LoggingFan, SysTelemetry};
use identity::IdentityStore;
use interface::ScriptConfigurator;
use node::{Node, NodeSettings};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Leave the fan alone and refuse `/fan`.
    pub no_fan: bool,
}

/// Runs a node with the console attached until Ctrl-C or `/quit`.
pub async fn run(config: Config, options: RunOptions) -> anyhow::Result<()> {
    let hostname = config
        .local_hostname()
        .context("Failed to resolve hostname")?;
    tracing::info!("Hampter Link starting as {}", hostname);

    // 1. Identity. Without it there is nothing to offer peers.
    let identity = IdentityStore::new(&config.identity, hostname.clone())
        .ensure_identity()
        .context("Failed to prepare TLS identity")?;

    // 2. Optional ad-hoc interface setup, before anything binds.
    let configurator = ScriptConfigurator::new(config.network.script.clone());
    match interface::apply(&config.network, &configurator).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!("Interface configuration not requested"),
        Err(e) => tracing::error!("Interface configuration failed, continuing: {}", e),
    }

    // 3. Discovery, endpoint and supervisor.
    let mut node = Node::start(NodeSettings::from_config(&config, hostname), &identity)
        .await
        .context("Failed to start node")?;

    // 4. Console.
    let fan: Option<Arc<dyn FanController>> = if options.no_fan {
        None
    } else {
        Some(Arc::new(LoggingFan::new()))
    };
    let console = Console::new(node.handle(), fan, Arc::new(SysTelemetry::new()));
    let shutdown = CancellationToken::new();
    let console_task = tokio::spawn(console.run(node.subscribe(), shutdown.clone()));

    tokio::select! {
        _ = shutdown.cancelled() => tracing::info!("Console closed"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Interrupted");
        }
    }

    shutdown.cancel();
    node.shutdown().await;
    if let Err(e) = console_task.await {
        tracing::debug!("Console task ended abnormally: {}", e);
    }
    Ok(())
}
