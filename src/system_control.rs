use crate::{
    config::{NetworkConfig, PtpConfig},
    controller::{DhcpRole, PtpRole},
    process_runner::CommandRunner,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{sync::Arc, time::Duration};
use tokio::process::{Child, Command};
use trait_variant::make;

/// Mutating system collaborators: the PTP daemon lifecycle, the network
/// profile swap and the system clock. Everything here changes externally
/// visible state and therefore only runs under the dispatcher's
/// single-writer discipline.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait SystemControl {
    /// Start the PTP daemon in the given role, superseding any instance
    /// started earlier. At most one daemon child exists at any time.
    async fn start_ptp_daemon(&mut self, role: PtpRole) -> Result<()>;

    /// Replace the active network profile wholesale with the template for
    /// the given role and tell networkd to reload.
    async fn apply_network_profile(&mut self, role: DhcpRole) -> Result<()>;

    /// Set the system clock to the given instant.
    async fn set_system_clock(&mut self, instant: DateTime<Utc>) -> Result<()>;
}

pub struct SystemdControl<R: CommandRunner> {
    runner: Arc<R>,
    network: NetworkConfig,
    ptp: PtpConfig,
    daemon: Option<Child>,
}

impl<R: CommandRunner> SystemdControl<R> {
    pub fn new(runner: Arc<R>, network: NetworkConfig, ptp: PtpConfig) -> Self {
        SystemdControl {
            runner,
            network,
            ptp,
            daemon: None,
        }
    }

    fn active_profile(&self) -> std::path::PathBuf {
        self.network
            .profile_dir
            .join(format!("10-{}.network", self.network.interface))
    }

    fn template_for(&self, role: DhcpRole) -> std::path::PathBuf {
        let suffix = match role {
            DhcpRole::Client => "client",
            DhcpRole::Server => "server",
        };
        self.network
            .template_dir
            .join(format!("10-{}-{suffix}.network", self.network.interface))
    }

    async fn supersede_daemon(&mut self) {
        if let Some(mut child) = self.daemon.take() {
            debug!("superseding ptp4l pid {:?}", child.id());
            if let Err(e) = child.kill().await {
                debug!("ptp4l already gone: {e}");
            }
            let _ = child.wait().await;
        }
    }
}

impl<R: CommandRunner + Send + Sync> SystemControl for SystemdControl<R> {
    async fn start_ptp_daemon(&mut self, role: PtpRole) -> Result<()> {
        self.supersede_daemon().await;

        let mut command = Command::new(&self.ptp.daemon_path);
        command.args(["-i", &self.network.interface]);
        match role {
            // Low priority1 forces grandmaster takeover on the segment
            PtpRole::Master => command.args(["--slaveOnly", "0", "--priority1", "10"]),
            PtpRole::Slave => command.args(["--slaveOnly", "1"]),
        };

        // No kill_on_drop: at process shutdown the daemon stays up, it is
        // supervised externally. Superseding kills explicitly.
        let child = command.spawn().context("failed to spawn ptp4l")?;

        info!("ptp4l started as {role} (pid {:?})", child.id());
        self.daemon = Some(child);
        Ok(())
    }

    async fn apply_network_profile(&mut self, role: DhcpRole) -> Result<()> {
        let template = self.template_for(role);
        let active = self.active_profile();

        tokio::fs::copy(&template, &active)
            .await
            .context(format!("failed to install profile {template:?}"))?;

        let reload = self
            .runner
            .run(
                "networkctl".into(),
                vec!["reload".to_string()],
                self.network.tool_timeout,
            )
            .await
            .context("networkctl reload failed")?;

        if !reload.success {
            bail!("networkctl reload exited non-zero");
        }

        info!("network profile switched to {role}");
        Ok(())
    }

    async fn set_system_clock(&mut self, instant: DateTime<Utc>) -> Result<()> {
        let usec = instant.timestamp_micros();

        let call = self
            .runner
            .run(
                "busctl".into(),
                vec![
                    "call".to_string(),
                    "org.freedesktop.timedate1".to_string(),
                    "/org/freedesktop/timedate1".to_string(),
                    "org.freedesktop.timedate1".to_string(),
                    "SetTime".to_string(),
                    "xbb".to_string(),
                    usec.to_string(),
                    "false".to_string(),
                    "false".to_string(),
                ],
                Duration::from_secs(5),
            )
            .await
            .context("timedate1 SetTime call failed")?;

        if !call.success {
            bail!("timedate1 rejected SetTime");
        }

        info!("system clock set to {instant}");
        Ok(())
    }
}
