use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use hampter_link_lib::config::Config;
use hampter_link_lib::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "hampter-link")]
#[command(about = "Off-grid peer link: beacon discovery plus an encrypted QUIC session", long_about = None)]
struct Cli {
    /// Config file path (JSON). Missing file means defaults.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Hostname announced in beacons and the certificate
    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    discovery_port: Option<u16>,

    #[arg(long)]
    session_port: Option<u16>,

    /// Directory holding cert.pem and key.pem
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Disable fan control
    #[arg(long)]
    no_fan: bool,

    /// Run the interface setup script before starting
    #[arg(long)]
    configure_interface: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.hostname {
            config.hostname = Some(name.clone());
        }
        if let Some(port) = self.discovery_port {
            config.discovery.port = port;
        }
        if let Some(port) = self.session_port {
            config.session.port = port;
        }
        if let Some(dir) = &self.cert_dir {
            config.identity.dir = dir.clone();
        }
        if self.configure_interface {
            config.network.configure = true;
        }
    }
}

/// Console output goes to stdout, so logs go to stderr (and optionally a file).
fn init_tracing(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let Some(path) = &cli.log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli)?;

    let mut config = Config::load(&cli.config).context("Failed to load configuration")?;
    cli.apply(&mut config);

    hampter_link_lib::run(
        config,
        RunOptions {
            no_fan: cli.no_fan,
        },
    )
    .await
}
