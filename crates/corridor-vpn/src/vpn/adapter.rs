//! Gateway/adapter resolution from the OS route table.
//!
//! Split tunneling needs the physical adapter that traffic to the VPN
//! server leaves through. We capture the route table with the native
//! tooling and pick the most specific route covering the server address;
//! the parsers are pure functions over the command output.

use crate::vpn::types::*;
use log::debug;
use std::net::{IpAddr, Ipv4Addr};
use tokio::process::Command;

/// Physical adapter identified by the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRef {
    pub index: u32,
    pub name: String,
}

/// One parsed route-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRow {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub interface: String,
    /// Interface index when the table reports one, zero otherwise.
    pub index: u32,
    pub metric: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves the physical adapter routing toward a server address.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayAddressResolver;

impl GatewayAddressResolver {
    pub fn new() -> Self {
        Self
    }

    /// Most specific adapter for `server`. IPv6 targets fall back to
    /// the IPv4 default route.
    pub async fn resolve(&self, server: IpAddr) -> Result<AdapterRef, VpnError> {
        let output = capture_route_table().await?;
        let rows = parse_route_table(&output);
        let target = match server {
            IpAddr::V4(a) => a,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let row = best_route(&rows, target).ok_or_else(|| {
            VpnError::new(
                ErrorCode::AdapterUnavailable,
                format!("No route toward {}", server),
            )
        })?;
        let index = if row.index != 0 {
            row.index
        } else {
            interface_index(&row.interface).unwrap_or(0)
        };
        debug!(
            "Resolved adapter for {}: {} (index {})",
            server, row.interface, index
        );
        Ok(AdapterRef {
            index,
            name: row.interface.clone(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Capture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dump the IPv4 route table with the platform's native tooling.
pub async fn capture_route_table() -> Result<String, VpnError> {
    #[cfg(target_os = "windows")]
    let result = Command::new("netsh")
        .args(["interface", "ipv4", "show", "route"])
        .output()
        .await;
    #[cfg(target_os = "linux")]
    let result = Command::new("ip").args(["route", "show"]).output().await;
    #[cfg(target_os = "macos")]
    let result = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .await;
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    let result: std::io::Result<std::process::Output> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no route table tooling on this platform",
    ));

    let output = result.map_err(|e| {
        VpnError::new(ErrorCode::AdapterUnavailable, "Cannot read route table")
            .with_detail(e.to_string())
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse whichever table format the current platform produced.
pub fn parse_route_table(output: &str) -> Vec<RouteRow> {
    #[cfg(target_os = "windows")]
    return parse_routes_netsh(output);
    #[cfg(target_os = "linux")]
    return parse_routes_ip(output);
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    return parse_routes_netstat(output);
}

/// Interface name to kernel index, where the OS exposes it as a file.
fn interface_index(name: &str) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        return std::fs::read_to_string(format!("/sys/class/net/{}/ifindex", name))
            .ok()?
            .trim()
            .parse()
            .ok();
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Per-format parsers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `netsh interface ipv4 show route` rows:
/// `Publish  Type  Met  Prefix  Idx  Gateway/Interface Name`
pub fn parse_routes_netsh(output: &str) -> Vec<RouteRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let Some((network, prefix_len)) = parse_prefix(fields[3]) else {
            continue;
        };
        let Ok(metric) = fields[2].parse::<u32>() else {
            continue;
        };
        let Ok(index) = fields[4].parse::<u32>() else {
            continue;
        };
        rows.push(RouteRow {
            network,
            prefix_len,
            interface: fields[5..].join(" "),
            index,
            metric,
        });
    }
    rows
}

/// `ip route show` rows, e.g.
/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
/// `10.8.0.0/24 dev tun0 proto kernel scope link src 10.8.0.2`
pub fn parse_routes_ip(output: &str) -> Vec<RouteRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let (network, prefix_len) = if fields[0] == "default" {
            (Ipv4Addr::UNSPECIFIED, 0)
        } else {
            match parse_prefix(fields[0]) {
                Some(p) => p,
                None => continue,
            }
        };
        let Some(dev_pos) = fields.iter().position(|f| *f == "dev") else {
            continue;
        };
        let Some(interface) = fields.get(dev_pos + 1) else {
            continue;
        };
        let metric = fields
            .iter()
            .position(|f| *f == "metric")
            .and_then(|i| fields.get(i + 1))
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        rows.push(RouteRow {
            network,
            prefix_len,
            interface: interface.to_string(),
            index: 0,
            metric,
        });
    }
    rows
}

/// `netstat -rn -f inet` rows:
/// `Destination  Gateway  Flags  Netif [Expire]`
pub fn parse_routes_netstat(output: &str) -> Vec<RouteRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (network, prefix_len) = if fields[0] == "default" {
            (Ipv4Addr::UNSPECIFIED, 0)
        } else {
            match parse_compact_destination(fields[0]) {
                Some(p) => p,
                None => continue,
            }
        };
        rows.push(RouteRow {
            network,
            prefix_len,
            interface: fields[3].to_string(),
            index: 0,
            metric: 0,
        });
    }
    rows
}

/// `a.b.c.d/len` or a bare address (treated as /32).
fn parse_prefix(s: &str) -> Option<(Ipv4Addr, u8)> {
    match s.split_once('/') {
        Some((addr, len)) => {
            let network = addr.parse().ok()?;
            let prefix_len: u8 = len.parse().ok()?;
            (prefix_len <= 32).then_some((network, prefix_len))
        }
        None => s.parse().ok().map(|a| (a, 32)),
    }
}

/// BSD tables compress destinations: `10.8/24`, `192.168.1`. Missing
/// octets are zero-padded; without an explicit length the prefix covers
/// the octets present.
fn parse_compact_destination(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr_part, explicit_len) = match s.split_once('/') {
        Some((a, l)) => (a, Some(l.parse::<u8>().ok()?)),
        None => (s, None),
    };
    let octets: Vec<&str> = addr_part.split('.').collect();
    if octets.is_empty() || octets.len() > 4 {
        return None;
    }
    let mut parsed = [0u8; 4];
    for (i, o) in octets.iter().enumerate() {
        parsed[i] = o.parse().ok()?;
    }
    let prefix_len = explicit_len.unwrap_or((octets.len() * 8) as u8);
    if prefix_len > 32 {
        return None;
    }
    Some((Ipv4Addr::from(parsed), prefix_len))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Route selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn prefix_contains(network: Ipv4Addr, prefix_len: u8, addr: Ipv4Addr) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let shift = 32 - u32::from(prefix_len);
    (u32::from(network) >> shift) == (u32::from(addr) >> shift)
}

/// Longest-prefix match; metric breaks ties (lower wins).
pub fn best_route(rows: &[RouteRow], addr: Ipv4Addr) -> Option<&RouteRow> {
    rows.iter()
        .filter(|r| prefix_contains(r.network, r.prefix_len, addr))
        .max_by_key(|r| (r.prefix_len, std::cmp::Reverse(r.metric)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETSH_OUTPUT: &str = "\
Publish  Type      Met  Prefix                    Idx  Gateway/Interface Name
-------  --------  ---  ------------------------  ---  ------------------------
No       Manual    256  0.0.0.0/0                  12  192.168.1.1
No       System    256  127.0.0.0/8                 1  Loopback Pseudo-Interface 1
No       System    256  192.168.1.0/24             12  Ethernet
No       System    256  10.8.0.0/24                23  TAP-Adapter V9
";

    const IP_OUTPUT: &str = "\
default via 192.168.1.1 dev eth0 proto dhcp metric 100
10.8.0.0/24 dev tun0 proto kernel scope link src 10.8.0.2
172.17.0.0/16 dev docker0 proto kernel scope link src 172.17.0.1 linkdown
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.42 metric 100
";

    const NETSTAT_OUTPUT: &str = "\
Routing tables

Internet:
Destination        Gateway            Flags        Netif Expire
default            192.168.1.1        UGScg          en0
10.8/24            10.8.0.1           UGSc         utun2
127                127.0.0.1          UCS            lo0
192.168.1          link#6             UCS            en0      !
";

    // ── netsh ────────────────────────────────────────────────────

    #[test]
    fn netsh_rows_parse() {
        let rows = parse_routes_netsh(NETSH_OUTPUT);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].network, Ipv4Addr::UNSPECIFIED);
        assert_eq!(rows[0].prefix_len, 0);
        assert_eq!(rows[0].index, 12);
        // Interface names with spaces survive.
        assert_eq!(rows[1].interface, "Loopback Pseudo-Interface 1");
        assert_eq!(rows[3].interface, "TAP-Adapter V9");
        assert_eq!(rows[3].index, 23);
    }

    #[test]
    fn netsh_header_lines_skipped() {
        let rows = parse_routes_netsh("Publish Type Met Prefix Idx Name\n--- --- ---\n");
        assert!(rows.is_empty());
    }

    // ── ip route ─────────────────────────────────────────────────

    #[test]
    fn ip_rows_parse() {
        let rows = parse_routes_ip(IP_OUTPUT);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].network, Ipv4Addr::UNSPECIFIED);
        assert_eq!(rows[0].interface, "eth0");
        assert_eq!(rows[0].metric, 100);
        assert_eq!(rows[1].network, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(rows[1].prefix_len, 24);
        assert_eq!(rows[1].interface, "tun0");
        assert_eq!(rows[1].metric, 0);
    }

    // ── netstat ──────────────────────────────────────────────────

    #[test]
    fn netstat_rows_parse() {
        let rows = parse_routes_netstat(NETSTAT_OUTPUT);
        // Header/blank lines are dropped; 4 routes remain.
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].network, Ipv4Addr::UNSPECIFIED);
        assert_eq!(rows[0].interface, "en0");
        assert_eq!(rows[1].network, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(rows[1].prefix_len, 24);
        assert_eq!(rows[1].interface, "utun2");
        // Compressed `192.168.1` pads to /24.
        assert_eq!(rows[3].network, Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(rows[3].prefix_len, 24);
    }

    #[test]
    fn compact_destination_forms() {
        assert_eq!(
            parse_compact_destination("10.8/24"),
            Some((Ipv4Addr::new(10, 8, 0, 0), 24))
        );
        assert_eq!(
            parse_compact_destination("127"),
            Some((Ipv4Addr::new(127, 0, 0, 0), 8))
        );
        assert_eq!(
            parse_compact_destination("192.168.1.5"),
            Some((Ipv4Addr::new(192, 168, 1, 5), 32))
        );
        assert_eq!(parse_compact_destination("link#6"), None);
        assert_eq!(parse_compact_destination("10.8/40"), None);
    }

    // ── Selection ────────────────────────────────────────────────

    #[test]
    fn longest_prefix_wins() {
        let rows = parse_routes_ip(IP_OUTPUT);
        let row = best_route(&rows, Ipv4Addr::new(192, 168, 1, 77)).unwrap();
        assert_eq!(row.interface, "eth0");
        assert_eq!(row.prefix_len, 24);
        let row = best_route(&rows, Ipv4Addr::new(10, 8, 0, 9)).unwrap();
        assert_eq!(row.interface, "tun0");
    }

    #[test]
    fn default_route_as_fallback() {
        let rows = parse_routes_ip(IP_OUTPUT);
        let row = best_route(&rows, Ipv4Addr::new(203, 0, 113, 4)).unwrap();
        assert_eq!(row.prefix_len, 0);
        assert_eq!(row.interface, "eth0");
    }

    #[test]
    fn no_route_for_empty_table() {
        assert!(best_route(&[], Ipv4Addr::new(1, 2, 3, 4)).is_none());
    }

    #[test]
    fn metric_breaks_prefix_ties() {
        let mut rows = parse_routes_ip(
            "192.168.1.0/24 dev slow0 proto kernel metric 600\n\
             192.168.1.0/24 dev fast0 proto kernel metric 100\n",
        );
        let row = best_route(&rows, Ipv4Addr::new(192, 168, 1, 1)).unwrap();
        assert_eq!(row.interface, "fast0");
        rows.reverse();
        let row = best_route(&rows, Ipv4Addr::new(192, 168, 1, 1)).unwrap();
        assert_eq!(row.interface, "fast0");
    }

    #[test]
    fn netsh_index_feeds_adapter_ref() {
        let rows = parse_routes_netsh(NETSH_OUTPUT);
        let row = best_route(&rows, Ipv4Addr::new(10, 8, 0, 4)).unwrap();
        assert_eq!(row.index, 23);
    }
}
