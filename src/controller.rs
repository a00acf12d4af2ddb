use crate::{
    probes::{DhcpScan, FactProbes},
    system_control::SystemControl,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::{fmt, net::Ipv4Addr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PtpRole {
    Master,
    Slave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DhcpRole {
    Client,
    Server,
}

/// Which surface the physical panel currently renders. Irrelevant to the
/// HTTP surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Dhcp,
    Ptp,
}

impl fmt::Display for PtpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtpRole::Master => write!(f, "master"),
            PtpRole::Slave => write!(f, "slave"),
        }
    }
}

impl fmt::Display for DhcpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpRole::Client => write!(f, "client"),
            DhcpRole::Server => write!(f, "server"),
        }
    }
}

/// The single source of truth for the device's roles.
///
/// Owned exclusively by the RoleController; everyone else reads published
/// copies through [`SharedRole`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceRole {
    pub ptp_role: PtpRole,
    pub dhcp_role: DhcpRole,
    pub foreign_dhcp_server: Option<Ipv4Addr>,
    pub active_view: View,
}

impl Default for DeviceRole {
    fn default() -> Self {
        DeviceRole {
            ptp_role: PtpRole::Slave,
            dhcp_role: DhcpRole::Client,
            foreign_dhcp_server: None,
            active_view: View::Dhcp,
        }
    }
}

/// Copy-on-read handle to the last committed [`DeviceRole`]. Readers never
/// observe a mutation in progress; the controller publishes a full snapshot
/// at each commit point.
#[derive(Clone)]
pub struct SharedRole(Arc<RwLock<DeviceRole>>);

impl SharedRole {
    pub fn new(role: DeviceRole) -> Self {
        SharedRole(Arc::new(RwLock::new(role)))
    }

    pub async fn get(&self) -> DeviceRole {
        self.0.read().await.clone()
    }

    async fn publish(&self, role: &DeviceRole) {
        *self.0.write().await = role.clone();
    }
}

impl Default for SharedRole {
    fn default() -> Self {
        SharedRole::new(DeviceRole::default())
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("another command is still in flight")]
    Busy,
    #[error("foreign DHCP server present at {0}")]
    ForeignServerPresent(Ipv4Addr),
    #[error("no foreign PTP master on the segment")]
    NoForeignMaster,
    #[error("not applicable in the current role")]
    NotApplicable,
    #[error("PTP daemon did not confirm the new role within {0:?}")]
    DaemonNotReady(Duration),
    #[error(transparent)]
    Process(#[from] anyhow::Error),
}

/// The device state machine. All mutating methods run under the
/// dispatcher's single-writer discipline; a failed transition always leaves
/// the role at its pre-call value.
pub struct RoleController<S: SystemControl, P: FactProbes> {
    system: S,
    probes: Arc<P>,
    role: DeviceRole,
    shared: SharedRole,
    confirm_timeout: Duration,
    confirm_poll_interval: Duration,
}

impl<S, P> RoleController<S, P>
where
    S: SystemControl,
    P: FactProbes + Send + Sync,
{
    pub fn new(
        system: S,
        probes: Arc<P>,
        shared: SharedRole,
        confirm_timeout: Duration,
        confirm_poll_interval: Duration,
    ) -> Self {
        RoleController {
            system,
            probes,
            role: DeviceRole::default(),
            shared,
            confirm_timeout,
            confirm_poll_interval,
        }
    }

    pub fn device_role(&self) -> &DeviceRole {
        &self.role
    }

    /// One-time startup transition: derive the DHCP role from a fresh scan,
    /// install the matching profile and start the PTP daemon as slave.
    /// A scan that could not run proves nothing about the segment, so it
    /// also starts as client.
    pub async fn initialize(&mut self) -> Result<(), ControlError> {
        match self.probes.scan_for_foreign_dhcp_server().await {
            DhcpScan::NoneFound => {
                self.role.dhcp_role = DhcpRole::Server;
            }
            DhcpScan::Foreign(server) => {
                self.role.foreign_dhcp_server = Some(server);
                self.role.dhcp_role = DhcpRole::Client;
            }
            DhcpScan::Unavailable => {
                warn!("startup DHCP scan unavailable, staying client");
                self.role.dhcp_role = DhcpRole::Client;
            }
        }
        info!(
            "starting as DHCP {} (foreign server: {:?})",
            self.role.dhcp_role, self.role.foreign_dhcp_server
        );

        self.system
            .apply_network_profile(self.role.dhcp_role)
            .await?;
        self.system.start_ptp_daemon(PtpRole::Slave).await?;
        self.role.ptp_role = PtpRole::Slave;

        self.publish().await;
        Ok(())
    }

    /// Flip between PTP slave and master. The slave→master direction only
    /// commits once the daemon confirms grandmaster takeover; on timeout the
    /// slave instance is restored and the role is unchanged.
    pub async fn toggle_ptp_role(&mut self) -> Result<(), ControlError> {
        match self.role.ptp_role {
            PtpRole::Slave => {
                self.system.start_ptp_daemon(PtpRole::Master).await?;

                if let Err(e) = self.await_master_confirmation().await {
                    warn!("master takeover not confirmed, reverting to slave");
                    self.system.start_ptp_daemon(PtpRole::Slave).await?;
                    return Err(e);
                }

                self.role.ptp_role = PtpRole::Master;
            }
            PtpRole::Master => {
                self.system.start_ptp_daemon(PtpRole::Slave).await?;
                self.role.ptp_role = PtpRole::Slave;
            }
        }

        info!("ptp role is now {}", self.role.ptp_role);
        self.publish().await;
        Ok(())
    }

    async fn await_master_confirmation(&self) -> Result<(), ControlError> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;

        loop {
            if let Some(status) = self.probes.ptp_status().await {
                // Takeover is confirmed once no foreign grandmaster remains.
                if !status.foreign_master_present {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() + self.confirm_poll_interval > deadline {
                return Err(ControlError::DaemonNotReady(self.confirm_timeout));
            }
            tokio::time::sleep(self.confirm_poll_interval).await;
        }
    }

    /// Flip between DHCP client and server. Entering the server role is
    /// rejected while a foreign server is recorded.
    pub async fn toggle_dhcp_role(&mut self) -> Result<(), ControlError> {
        let target = match self.role.dhcp_role {
            DhcpRole::Server => DhcpRole::Client,
            DhcpRole::Client => {
                if let Some(server) = self.role.foreign_dhcp_server {
                    return Err(ControlError::ForeignServerPresent(server));
                }
                DhcpRole::Server
            }
        };

        self.system.apply_network_profile(target).await?;
        self.role.dhcp_role = target;

        info!("dhcp role is now {target}");
        self.publish().await;
        Ok(())
    }

    /// Re-run the foreign-server scan. Finding a foreign server while we act
    /// as server forces the demotion to client (collision self-resolution).
    /// A scan that could not run keeps the previous record: clearing it
    /// would re-open the server role on a segment we failed to check.
    pub async fn rescan_dhcp(&mut self) -> Result<(), ControlError> {
        match self.probes.scan_for_foreign_dhcp_server().await {
            DhcpScan::NoneFound => {
                self.role.foreign_dhcp_server = None;
            }
            DhcpScan::Foreign(server) => {
                self.role.foreign_dhcp_server = Some(server);
                info!("foreign DHCP server at {server}");
                if self.role.dhcp_role == DhcpRole::Server {
                    warn!("DHCP collision, demoting to client");
                    self.system.apply_network_profile(DhcpRole::Client).await?;
                    self.role.dhcp_role = DhcpRole::Client;
                }
            }
            DhcpScan::Unavailable => {
                warn!(
                    "DHCP scan unavailable, keeping record {:?}",
                    self.role.foreign_dhcp_server
                );
            }
        }

        self.publish().await;
        Ok(())
    }

    /// Set the system clock to the foreign grandmaster's estimated current
    /// time. A master has nothing to sync from.
    pub async fn sync_time_from_master(&mut self) -> Result<(), ControlError> {
        if self.role.ptp_role == PtpRole::Master {
            return Err(ControlError::NotApplicable);
        }

        let status = self
            .probes
            .ptp_status()
            .await
            .ok_or_else(|| anyhow::anyhow!("PTP status unavailable"))?;

        if !status.foreign_master_present {
            return Err(ControlError::NoForeignMaster);
        }

        let instant = status
            .estimated_utc
            .ok_or_else(|| anyhow::anyhow!("grandmaster reported no usable timestamps"))?;

        self.system.set_system_clock(instant).await?;
        Ok(())
    }

    /// Set the system clock directly to a caller-supplied instant.
    pub async fn set_time(&mut self, instant: DateTime<Utc>) -> Result<(), ControlError> {
        self.system.set_system_clock(instant).await?;
        Ok(())
    }

    pub async fn switch_view(&mut self) -> Result<(), ControlError> {
        self.role.active_view = match self.role.active_view {
            View::Dhcp => View::Ptp,
            View::Ptp => View::Dhcp,
        };
        self.publish().await;
        Ok(())
    }

    async fn publish(&self) {
        self.shared.publish(&self.role).await;
    }
}
