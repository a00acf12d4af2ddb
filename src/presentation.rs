use crate::{
    controller::{DeviceRole, DhcpRole, PtpRole, SharedRole, View},
    display::DisplayPanel,
    probes::{FactProbes, Lease},
};
use chrono::{DateTime, Utc};
use log::error;
use serde::Serialize;
use std::{net::Ipv4Addr, sync::Arc};

/// JSON view of the PTP surface; probe fields are null while the daemon has
/// not exported its status yet.
#[derive(Debug, Serialize)]
pub struct PtpInfo {
    pub role: PtpRole,
    pub foreign_master_present: Option<bool>,
    pub master_identity: Option<String>,
    pub current_offset_nanos: Option<i64>,
    pub estimated_utc: Option<DateTime<Utc>>,
    pub observed_clock_count: Option<u32>,
}

/// JSON view of the DHCP surface.
#[derive(Debug, Serialize)]
pub struct DhcpInfo {
    pub role: DhcpRole,
    pub own_address: Option<String>,
    pub foreign_server: Option<Ipv4Addr>,
    pub leases: Option<Vec<Lease>>,
}

pub async fn ptp_info<P: FactProbes>(probes: &P, role: &DeviceRole) -> PtpInfo {
    match probes.ptp_status().await {
        Some(status) => PtpInfo {
            role: role.ptp_role,
            foreign_master_present: Some(status.foreign_master_present),
            master_identity: status.master_identity,
            current_offset_nanos: status.current_offset_nanos,
            estimated_utc: status.estimated_utc,
            observed_clock_count: Some(status.observed_clock_count),
        },
        None => PtpInfo {
            role: role.ptp_role,
            foreign_master_present: None,
            master_identity: None,
            current_offset_nanos: None,
            estimated_utc: None,
            observed_clock_count: None,
        },
    }
}

pub async fn dhcp_info<P: FactProbes>(probes: &P, role: &DeviceRole) -> DhcpInfo {
    let leases = match role.dhcp_role {
        DhcpRole::Server => probes.dhcp_leases().await,
        DhcpRole::Client => None,
    };

    DhcpInfo {
        role: role.dhcp_role,
        own_address: probes.own_address(role.dhcp_role).await,
        foreign_server: role.foreign_dhcp_server,
        leases,
    }
}

/// Renders the committed role snapshot plus live probe results onto the
/// physical panel. The worker re-renders after every executed command.
pub struct Presenter<D: DisplayPanel, P: FactProbes> {
    panel: D,
    probes: Arc<P>,
    role: SharedRole,
}

impl<D, P> Presenter<D, P>
where
    D: DisplayPanel,
    P: FactProbes + Send + Sync,
{
    pub fn new(panel: D, probes: Arc<P>, role: SharedRole) -> Self {
        Presenter {
            panel,
            probes,
            role,
        }
    }

    pub async fn render(&mut self) {
        let role = self.role.get().await;
        let text = match role.active_view {
            View::Dhcp => dhcp_text(&dhcp_info(self.probes.as_ref(), &role).await),
            View::Ptp => ptp_text(&ptp_info(self.probes.as_ref(), &role).await),
        };

        if let Err(e) = self.panel.show(text).await {
            error!("panel render failed: {e:#}");
        }
    }

    pub async fn render_error(&mut self, message: &str) {
        if let Err(e) = self.panel.show(format!("Error:\n{message}")).await {
            error!("panel render failed: {e:#}");
        }
    }

    /// Best-effort shutdown cleanup; the panel may already be gone.
    pub async fn clear(&mut self) {
        if let Err(e) = self.panel.clear().await {
            error!("panel clear failed: {e:#}");
        }
    }
}

pub fn dhcp_text(info: &DhcpInfo) -> String {
    let mut lines = vec![format!("DHCP: {}", info.role)];

    if let Some(address) = &info.own_address {
        lines.push(format!("addr {address}"));
    }
    if let Some(server) = info.foreign_server {
        lines.push(format!("foreign srv {server}"));
    }

    match &info.leases {
        Some(leases) if leases.is_empty() => lines.push("No leases".to_string()),
        Some(leases) => {
            for lease in leases {
                lines.push(format!("{} {}", lease.ip_address, lease.mac_address));
            }
        }
        None => {}
    }

    lines.join("\n")
}

pub fn ptp_text(info: &PtpInfo) -> String {
    let mut lines = vec![format!("PTP: {}", info.role)];

    match info.foreign_master_present {
        None => lines.push("status unavailable".to_string()),
        Some(false) => lines.push("no foreign master".to_string()),
        Some(true) => {
            if let Some(identity) = &info.master_identity {
                lines.push(format!("gm {identity}"));
            }
            if let Some(offset) = info.current_offset_nanos {
                lines.push(format!("offset {offset} ns"));
            }
        }
    }

    if let Some(count) = info.observed_clock_count {
        lines.push(format!("{count} other clocks"));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcp_view_lists_leases() {
        let info = DhcpInfo {
            role: DhcpRole::Server,
            own_address: Some("192.168.77.1".to_string()),
            foreign_server: None,
            leases: Some(vec![Lease {
                ip_address: "10.0.0.5".to_string(),
                mac_address: "00:11:22:33:44:55".to_string(),
            }]),
        };

        let text = dhcp_text(&info);
        assert!(text.contains("DHCP: server"));
        assert!(text.contains("10.0.0.5 00:11:22:33:44:55"));
    }

    #[test]
    fn dhcp_view_reports_empty_lease_table() {
        let info = DhcpInfo {
            role: DhcpRole::Server,
            own_address: None,
            foreign_server: None,
            leases: Some(vec![]),
        };

        assert!(dhcp_text(&info).contains("No leases"));
    }

    #[test]
    fn ptp_view_shows_grandmaster_details() {
        let info = PtpInfo {
            role: PtpRole::Slave,
            foreign_master_present: Some(true),
            master_identity: Some("aa:bb:cc:11:22:33".to_string()),
            current_offset_nanos: Some(-250),
            estimated_utc: None,
            observed_clock_count: Some(2),
        };

        let text = ptp_text(&info);
        assert!(text.contains("PTP: slave"));
        assert!(text.contains("gm aa:bb:cc:11:22:33"));
        assert!(text.contains("offset -250 ns"));
        assert!(text.contains("2 other clocks"));
    }

    #[test]
    fn ptp_view_tolerates_unavailable_probe() {
        let info = PtpInfo {
            role: PtpRole::Master,
            foreign_master_present: None,
            master_identity: None,
            current_offset_nanos: None,
            estimated_utc: None,
            observed_clock_count: None,
        };

        assert!(ptp_text(&info).contains("status unavailable"));
    }
}
