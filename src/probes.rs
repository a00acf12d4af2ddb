use crate::{
    config::{NetworkConfig, PtpConfig},
    controller::DhcpRole,
    process_runner::CommandRunner,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use log::{debug, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::Serialize;
use std::{
    collections::HashSet,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{net::UdpSocket, time::timeout};
use trait_variant::make;

/// Snapshot of the local PTP daemon's view of the segment
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PtpStatus {
    pub foreign_master_present: bool,
    /// Grandmaster identity reformatted as a colon-separated MAC
    pub master_identity: Option<String>,
    pub current_offset_nanos: Option<i64>,
    /// The grandmaster's estimated current time (ingress time corrected by
    /// the reported master offset)
    pub estimated_utc: Option<DateTime<Utc>>,
    /// Clocks on the segment besides ourselves
    pub observed_clock_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Lease {
    pub ip_address: String,
    pub mac_address: String,
}

/// Outcome of one foreign-DHCP-server scan.
///
/// A scan that could not even transmit (client port taken, broadcast send
/// refused) is distinct from an idle segment: callers must not treat it as
/// evidence that no foreign server exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpScan {
    Foreign(Ipv4Addr),
    NoneFound,
    Unavailable,
}

/// Read-only queries against the segment and the local daemons.
///
/// Probes never mutate device state and never fail past this boundary: a
/// backing tool that is missing, times out or has not exported its data yet
/// yields `None` (or [`DhcpScan::Unavailable`] for the scan), which callers
/// treat as "retry on the next poll".
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait FactProbes {
    async fn ptp_status(&self) -> Option<PtpStatus>;
    async fn dhcp_leases(&self) -> Option<Vec<Lease>>;
    async fn own_address(&self, role: DhcpRole) -> Option<String>;
    async fn scan_for_foreign_dhcp_server(&self) -> DhcpScan;
}

pub struct SystemProbes<R: CommandRunner> {
    runner: Arc<R>,
    network: NetworkConfig,
    ptp: PtpConfig,
}

impl<R: CommandRunner> SystemProbes<R> {
    pub fn new(runner: Arc<R>, network: NetworkConfig, ptp: PtpConfig) -> Self {
        SystemProbes {
            runner,
            network,
            ptp,
        }
    }

    async fn pmc(&self, request: &str) -> Option<String> {
        let mut args = vec!["-u".to_string()];
        // CLOCK_DESCRIPTION is broadcast to every clock on the segment
        if request == "GET CLOCK_DESCRIPTION" {
            args.push("-b".to_string());
            args.push("1".to_string());
        }
        args.extend([
            "-i".to_string(),
            self.network.interface.clone(),
            request.to_string(),
        ]);

        match self
            .runner
            .run(
                self.ptp.management_client_path.clone(),
                args,
                self.ptp.query_timeout,
            )
            .await
        {
            Ok(output) if output.success => Some(output.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!("pmc unavailable: {e}");
                None
            }
        }
    }

    async fn link_index(&self) -> Option<String> {
        let output = self
            .runner
            .run(
                "ip".into(),
                vec![
                    "--oneline".to_string(),
                    "link".to_string(),
                    "show".to_string(),
                    "dev".to_string(),
                    self.network.interface.clone(),
                ],
                self.network.tool_timeout,
            )
            .await
            .ok()
            .filter(|output| output.success)?;

        let index = output.stdout.split(':').next()?.trim();
        if index.is_empty() {
            return None;
        }
        Some(index.to_string())
    }

    async fn interface_mac(&self) -> Option<[u8; 6]> {
        let path = format!("/sys/class/net/{}/address", self.network.interface);
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        parse_mac(text.trim())
    }
}

impl<R: CommandRunner + Send + Sync> FactProbes for SystemProbes<R> {
    async fn ptp_status(&self) -> Option<PtpStatus> {
        let dump = self.pmc("GET TIME_STATUS_NP").await?;
        let mut status = parse_time_status(&dump)?;

        if let Some(description) = self.pmc("GET CLOCK_DESCRIPTION").await {
            status.observed_clock_count = count_foreign_clocks(&description);
        }

        Some(status)
    }

    async fn dhcp_leases(&self) -> Option<Vec<Lease>> {
        let index = self.link_index().await?;

        // The Leases property only appears once networkd runs a DHCP server
        // on the link; until then busctl exits non-zero (UnknownProperty).
        let output = self
            .runner
            .run(
                "busctl".into(),
                vec![
                    "--json=short".to_string(),
                    "get-property".to_string(),
                    "org.freedesktop.network1".to_string(),
                    format!("/org/freedesktop/network1/link/{index}"),
                    "org.freedesktop.network1.DHCPServer".to_string(),
                    "Leases".to_string(),
                ],
                self.network.tool_timeout,
            )
            .await
            .ok()
            .filter(|output| output.success)?;

        decode_leases(&output.stdout)
    }

    async fn own_address(&self, role: DhcpRole) -> Option<String> {
        match role {
            DhcpRole::Server => Some(self.network.server_address.to_string()),
            DhcpRole::Client => {
                let output = self
                    .runner
                    .run(
                        "networkctl".into(),
                        vec!["status".to_string()],
                        self.network.tool_timeout,
                    )
                    .await
                    .ok()
                    .filter(|output| output.success)?;

                parse_own_address(&output.stdout, &self.network.interface)
            }
        }
    }

    async fn scan_for_foreign_dhcp_server(&self) -> DhcpScan {
        let Some(mac) = self.interface_mac().await else {
            warn!("cannot read interface MAC, skipping DHCP scan");
            return DhcpScan::Unavailable;
        };

        let discover = match build_discover(&mac) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode DHCP discover: {e:#}");
                return DhcpScan::Unavailable;
            }
        };

        let socket = match bind_scan_socket() {
            Ok(socket) => socket,
            Err(e) => {
                warn!("failed to bind DHCP client port: {e:#}");
                return DhcpScan::Unavailable;
            }
        };
        if let Err(e) = socket.send_to(&discover, ("255.255.255.255", 67)).await {
            warn!("failed to send DHCP discover: {e}");
            return DhcpScan::Unavailable;
        }

        let deadline = tokio::time::Instant::now() + self.network.scan_window;
        let mut buf = [0u8; 1500];

        // No reply within the window is the common case on an idle segment.
        loop {
            let Some(remaining) = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .filter(|remaining| !remaining.is_zero())
            else {
                return DhcpScan::NoneFound;
            };

            let (len, source) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => return DhcpScan::NoneFound,
                Ok(Err(e)) => {
                    warn!("DHCP scan receive failed: {e}");
                    return DhcpScan::Unavailable;
                }
                Ok(Ok(received)) => received,
            };

            if let Some(server) = offer_server(&buf[..len], source.ip()) {
                if server != self.network.server_address {
                    debug!("foreign DHCP server answered from {server}");
                    return DhcpScan::Foreign(server);
                }
            }
        }
    }
}

/// The system's own DHCP client may hold :68 while we are a client, so the
/// scan socket needs address reuse to coexist with it.
fn bind_scan_socket() -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("socket creation failed")?;

    socket.set_reuse_address(true).ok();
    socket.set_broadcast(true).context("broadcast flag")?;
    socket.set_nonblocking(true).context("nonblocking flag")?;
    socket
        .bind(&std::net::SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68).into())
        .context("bind 0.0.0.0:68")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("tokio socket conversion")
}

fn build_discover(mac: &[u8; 6]) -> anyhow::Result<Vec<u8>> {
    let xid = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();

    let mut message = Message::default();
    message.set_opcode(Opcode::BootRequest);
    message.set_xid(xid);
    message.set_flags(Flags::default().set_broadcast());
    message.set_chaddr(mac);
    message
        .opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    message
        .opts_mut()
        .insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
        ]));

    message
        .to_vec()
        .map_err(|e| anyhow::anyhow!("DHCP encode failed: {e}"))
}

fn offer_server(data: &[u8], source: std::net::IpAddr) -> Option<Ipv4Addr> {
    let message = Message::from_bytes(data).ok()?;

    let is_offer = matches!(
        message.opts().get(OptionCode::MessageType),
        Some(DhcpOption::MessageType(MessageType::Offer))
    );
    if !is_offer {
        return None;
    }

    if let Some(DhcpOption::ServerIdentifier(server)) =
        message.opts().get(OptionCode::ServerIdentifier)
    {
        return Some(*server);
    }

    match source {
        std::net::IpAddr::V4(addr) => Some(addr),
        std::net::IpAddr::V6(_) => None,
    }
}

/// Parse the key/value body of a `pmc GET TIME_STATUS_NP` response.
pub fn parse_time_status(dump: &str) -> Option<PtpStatus> {
    let mut master_offset = None;
    let mut ingress_time = None;
    let mut gm_present = None;
    let mut gm_identity = None;

    for line in dump.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };

        match key {
            "master_offset" => master_offset = value.parse::<i64>().ok(),
            "ingress_time" => ingress_time = value.parse::<i64>().ok(),
            "gmPresent" => gm_present = Some(value == "true"),
            "gmIdentity" => gm_identity = Some(value.to_string()),
            _ => {}
        }
    }

    // A dump without a gmPresent line is not a TIME_STATUS_NP response.
    let foreign_master_present = gm_present?;

    let estimated_utc = match (ingress_time, master_offset) {
        (Some(ingress), Some(offset)) if ingress != 0 => {
            Some(DateTime::from_timestamp_nanos(ingress - offset))
        }
        _ => None,
    };

    Some(PtpStatus {
        foreign_master_present,
        master_identity: gm_identity.as_deref().and_then(identity_to_mac),
        current_offset_nanos: master_offset,
        estimated_utc,
        observed_clock_count: 0,
    })
}

/// Decode a textual PTP clock identity into a colon-separated MAC by
/// dropping the EUI-64 padding octets: `aabbcc.fffe.112233` → `aa:bb:cc:11:22:33`.
pub fn identity_to_mac(identity: &str) -> Option<String> {
    if !is_clock_identity(identity) {
        return None;
    }

    let mut parts = identity.split('.');
    let head = parts.next()?;
    // Only the EUI-64 padding octets are droppable; any other middle group
    // means the identity is not MAC-derived.
    let padding = parts.next()?;
    if !padding.eq_ignore_ascii_case("fffe") {
        return None;
    }
    let tail = parts.next()?;

    let octets: Vec<String> = head
        .as_bytes()
        .chunks(2)
        .chain(tail.as_bytes().chunks(2))
        .map(|pair| String::from_utf8_lossy(pair).to_lowercase())
        .collect();

    Some(octets.join(":"))
}

/// A textual clock identity is three dot-separated hex groups of 6, 4 and 6
/// digits (the middle group being the EUI-64 padding).
pub fn is_clock_identity(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return false;
    }

    let lengths = [6, 4, 6];
    parts
        .iter()
        .zip(lengths)
        .all(|(part, len)| part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Count distinct clock identities in a broadcast `GET CLOCK_DESCRIPTION`
/// dump, excluding ourselves.
pub fn count_foreign_clocks(dump: &str) -> u32 {
    let mut identities = HashSet::new();

    for token in dump.split_whitespace() {
        // Response headers carry the identity with a port suffix, e.g.
        // aabbcc.fffe.112233-1
        let identity = token.split('-').next().unwrap_or(token);
        if is_clock_identity(identity) {
            identities.insert(identity.to_string());
        }
    }

    (identities.len() as u32).saturating_sub(1)
}

/// Decode the networkd `Leases` bus property from `busctl --json` output.
///
/// Each lease entry carries the client address as 4 raw octets and the
/// hardware address as a raw byte field of which the first 6 bytes matter.
pub fn decode_leases(json: &str) -> Option<Vec<Lease>> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let entries = value.get("data")?.as_array()?;

    let mut leases = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry.as_array()?;

        let ip_octets = raw_bytes(fields.get(2)?)?;
        if ip_octets.len() != 4 {
            return None;
        }
        let ip_address = ip_octets
            .iter()
            .map(|octet| octet.to_string())
            .collect::<Vec<_>>()
            .join(".");

        let hw_bytes = raw_bytes(fields.get(4)?)?;
        if hw_bytes.len() < 6 {
            return None;
        }
        let mac_address = hw_bytes[..6]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        leases.push(Lease {
            ip_address,
            mac_address,
        });
    }

    Some(leases)
}

fn raw_bytes(value: &serde_json::Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// Find our own address in interface-status text: the dotted quad followed
/// by `on <interface>` inside the `Address:` block. Other labelled blocks
/// (Gateway, DNS) carry the same shape and must not match.
pub fn parse_own_address(text: &str, interface: &str) -> Option<String> {
    let mut in_address_block = false;

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        // A labelled line starts a new block; unlabelled lines continue
        // the previous one.
        if let Some(first) = tokens.first() {
            if first.ends_with(':') {
                in_address_block = *first == "Address:";
            }
        }
        if !in_address_block {
            continue;
        }

        for window in tokens.windows(3) {
            let [addr, on, iface] = window else {
                continue;
            };
            if *on == "on" && *iface == interface && addr.parse::<Ipv4Addr>().is_ok() {
                return Some((*addr).to_string());
            }
        }
    }

    None
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');

    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIME_STATUS_DUMP: &str = "\
sending: GET TIME_STATUS_NP
\t900000.fffe.000000-0 seq 0 RESPONSE MANAGEMENT TIME_STATUS_NP
\t\tmaster_offset              -250
\t\tingress_time               1700000000123456789
\t\tcumulativeScaledRateOffset +0.000000000
\t\tgmTimeBaseIndicator        0
\t\tgmIdentity                 aabbcc.fffe.112233
\t\tgmPresent                  true
";

    #[test]
    fn time_status_parses_offset_identity_and_presence() {
        let status = parse_time_status(TIME_STATUS_DUMP).expect("no status");

        assert!(status.foreign_master_present);
        assert_eq!(status.master_identity.as_deref(), Some("aa:bb:cc:11:22:33"));
        assert_eq!(status.current_offset_nanos, Some(-250));

        // ingress_time - master_offset, as an absolute instant
        let expected = DateTime::from_timestamp_nanos(1_700_000_000_123_456_789 + 250);
        assert_eq!(status.estimated_utc, Some(expected));
    }

    #[test]
    fn time_status_without_grandmaster() {
        let dump = "\tgmPresent false\n\tingress_time 0\n\tmaster_offset 0\n";
        let status = parse_time_status(dump).expect("no status");

        assert!(!status.foreign_master_present);
        assert_eq!(status.estimated_utc, None);
    }

    #[test]
    fn garbage_is_not_a_time_status() {
        assert_eq!(parse_time_status("pmc: command not found"), None);
    }

    #[test]
    fn identity_drops_eui64_padding() {
        assert_eq!(
            identity_to_mac("aabbcc.fffe.112233").as_deref(),
            Some("aa:bb:cc:11:22:33")
        );
        assert_eq!(
            identity_to_mac("001122.fffe.AABBCC").as_deref(),
            Some("00:11:22:aa:bb:cc")
        );
        assert_eq!(identity_to_mac("not-an-identity"), None);
        assert_eq!(identity_to_mac("aabbcc.ff.112233"), None);
    }

    #[test]
    fn identity_without_eui64_padding_is_not_a_mac() {
        // A valid clock identity, but not derived from a MAC address.
        assert_eq!(identity_to_mac("aabbcc.abcd.112233"), None);
        assert_eq!(
            identity_to_mac("aabbcc.FFFE.112233").as_deref(),
            Some("aa:bb:cc:11:22:33")
        );
    }

    #[test]
    fn clock_count_excludes_self_and_duplicates() {
        let dump = "\
sending: GET CLOCK_DESCRIPTION
\taabbcc.fffe.112233-1 seq 0 RESPONSE MANAGEMENT CLOCK_DESCRIPTION
\t\tclockType 0x8000
\t001122.fffe.334455-1 seq 0 RESPONSE MANAGEMENT CLOCK_DESCRIPTION
\t001122.fffe.334455-2 seq 0 RESPONSE MANAGEMENT CLOCK_DESCRIPTION
";
        assert_eq!(count_foreign_clocks(dump), 1);
        assert_eq!(count_foreign_clocks(""), 0);
    }

    #[test]
    fn leases_decode_from_raw_octets() {
        let json = r#"{
            "type": "a(uayayayt)",
            "data": [
                [2, [1, 2], [10, 0, 0, 5], [0], [0, 17, 34, 51, 68, 85, 0, 0], 12345]
            ]
        }"#;

        let leases = decode_leases(json).expect("no leases");
        assert_eq!(
            leases,
            vec![Lease {
                ip_address: "10.0.0.5".to_string(),
                mac_address: "00:11:22:33:44:55".to_string(),
            }]
        );
    }

    #[test]
    fn empty_lease_table_decodes_to_empty() {
        let json = r#"{"type": "a(uayayayt)", "data": []}"#;
        assert_eq!(decode_leases(json), Some(vec![]));
    }

    #[test]
    fn malformed_lease_json_is_unavailable() {
        assert_eq!(decode_leases("UnknownProperty"), None);
        assert_eq!(decode_leases(r#"{"data": [[1]]}"#), None);
    }

    #[test]
    fn own_address_matches_dotted_quad_before_interface() {
        let text = "\
         State: routable
       Address: 192.168.1.23 on eth0
                fe80::1 on eth0
       Gateway: 192.168.1.1 on eth0
";
        assert_eq!(
            parse_own_address(text, "eth0").as_deref(),
            Some("192.168.1.23")
        );
        assert_eq!(parse_own_address(text, "eth1"), None);
        assert_eq!(parse_own_address("no addresses here", "eth0"), None);
    }

    #[test]
    fn gateway_line_is_not_our_own_address() {
        let text = "\
         State: routable
       Gateway: 192.168.1.1 on eth0
";
        assert_eq!(parse_own_address(text, "eth0"), None);
    }

    #[test]
    fn second_address_line_in_the_block_matches() {
        let text = "\
       Address: fe80::1 on eth0
                10.0.0.3 on eth0
       Gateway: 10.0.0.1 on eth0
";
        assert_eq!(parse_own_address(text, "eth0").as_deref(), Some("10.0.0.3"));
    }

    #[test]
    fn mac_text_parses_to_bytes() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(parse_mac("aa:bb"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
