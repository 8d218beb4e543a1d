//! Ad-hoc network interface setup, delegated to an external script.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::NetworkConfig;
use crate::error::InterfaceError;

#[async_trait]
pub trait NetworkInterfaceConfigurator: Send + Sync {
    async fn configure(&self, interface: &str, ip: Ipv4Addr, channel: u8) -> Result<(), InterfaceError>;
}

/// Runs `<launcher...> <script> <interface> <ip> <channel>`; the launcher is
/// `sudo` unless overridden.
#[derive(Debug, Clone)]
pub struct ScriptConfigurator {
    launcher: Vec<String>,
    script: PathBuf,
}

impl ScriptConfigurator {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            launcher: vec!["sudo".to_string()],
            script: script.into(),
        }
    }

    pub fn with_launcher<I, S>(mut self, launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = launcher.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self) -> Command {
        match self.launcher.split_first() {
            Some((program, rest)) => {
                let mut cmd = Command::new(program);
                cmd.args(rest).arg(&self.script);
                cmd
            }
            None => Command::new(&self.script),
        }
    }
}

#[async_trait]
impl NetworkInterfaceConfigurator for ScriptConfigurator {
    async fn configure(&self, interface: &str, ip: Ipv4Addr, channel: u8) -> Result<(), InterfaceError> {
        tracing::info!(
            "Configuring {} as {} on channel {} via {}",
            interface,
            ip,
            channel,
            self.script.display()
        );

        let output = self
            .command()
            .arg(interface)
            .arg(ip.to_string())
            .arg(channel.to_string())
            .output()
            .await
            .map_err(|source| InterfaceError::Spawn {
                script: self.script.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(InterfaceError::Failed {
                script: self.script.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::info!("Interface {} configured", interface);
        Ok(())
    }
}

/// Applies `network` when `configure` is set. Returns whether anything ran.
pub async fn apply(
    network: &NetworkConfig,
    configurator: &dyn NetworkInterfaceConfigurator,
) -> Result<bool, InterfaceError> {
    if !network.configure {
        return Ok(false);
    }
    let ip = network
        .ip_address
        .ok_or_else(|| InterfaceError::MissingAddress(network.interface.clone()))?;
    configurator
        .configure(&network.interface, ip, network.channel)
        .await?;
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("setup_network.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_script_receives_interface_ip_and_channel() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let path = script(dir.path(), &format!("echo \"$@\" > {}\n", out.display()));
        let configurator = ScriptConfigurator::new(path).with_launcher(["sh"]);

        // Act
        configurator
            .configure("wlan0", Ipv4Addr::new(192, 168, 99, 1), 6)
            .await
            .unwrap();

        // Assert
        let args = std::fs::read_to_string(out).unwrap();
        assert_eq!(args.trim(), "wlan0 192.168.99.1 6");
    }

    #[tokio::test]
    async fn test_failing_script_reports_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo 'no such device' >&2\nexit 3\n");
        let configurator = ScriptConfigurator::new(path).with_launcher(["sh"]);

        let err = configurator
            .configure("wlan9", Ipv4Addr::new(10, 0, 0, 1), 1)
            .await
            .unwrap_err();

        match err {
            InterfaceError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "no such device");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_launcher_is_spawn_error() {
        let configurator = ScriptConfigurator::new("/nonexistent/setup.sh")
            .with_launcher(["/nonexistent/launcher"]);

        let err = configurator
            .configure("wlan0", Ipv4Addr::new(10, 0, 0, 1), 1)
            .await
            .unwrap_err();

        assert!(matches!(err, InterfaceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_apply_skips_when_not_requested() {
        let network = NetworkConfig::default();
        let configurator = ScriptConfigurator::new("/nonexistent/setup.sh");

        assert!(!apply(&network, &configurator).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_requires_an_address() {
        let network = NetworkConfig {
            configure: true,
            ..NetworkConfig::default()
        };
        let configurator = ScriptConfigurator::new("/nonexistent/setup.sh");

        let err = apply(&network, &configurator).await.unwrap_err();

        assert!(matches!(err, InterfaceError::MissingAddress(iface) if iface == "wlan0"));
    }
}
