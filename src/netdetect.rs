use crate::error::ConfigError;
use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{ipv4_mask_to_prefix, Ipv4Net};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Smallest and largest CIDR prefix accepted for IP range discovery.
pub const MIN_PREFIX: u8 = 8;
pub const MAX_PREFIX: u8 = 31;

/// Inclusive IPv4 address range. Never empty: every constructor keeps `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    start: u32,
    end: u32,
}

#[allow(clippy::len_without_is_empty)]
impl Ipv4Range {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, ConfigError> {
        let (s, e) = (u32::from(start), u32::from(end));
        if s > e {
            return Err(ConfigError::InvalidRange(format!("{start}-{end} (start > end)")));
        }
        Ok(Self { start: s, end: e })
    }

    pub fn single(ip: Ipv4Addr) -> Self {
        let n = u32::from(ip);
        Self { start: n, end: n }
    }

    /// Whole network including its network and broadcast addresses.
    pub fn from_net(net: Ipv4Net) -> Self {
        Self {
            start: u32::from(net.network()),
            end: u32::from(net.broadcast()),
        }
    }

    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    /// Lazily walk every address in the range.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }
}

/// Parse one range expression.
///
/// Supported forms:
/// - plain address: `10.0.0.5`
/// - dash range: `192.168.8.2-192.168.8.20`
/// - CIDR: `10.0.0.0/24` (prefix /8../31)
/// - dotted mask: `10.0.0.0/255.255.255.0`
pub fn parse_ip_range(input: &str) -> Result<Ipv4Range, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidRange("empty range".into()));
    }

    if let Some((a, b)) = s.split_once('-') {
        let start = parse_ipv4(a)?;
        let end = parse_ipv4(b)?;
        return Ipv4Range::new(start, end);
    }

    if let Some((ip, suffix)) = s.split_once('/') {
        let ip = parse_ipv4(ip)?;
        let suffix = suffix.trim();
        let prefix = if suffix.contains('.') {
            let mask = parse_ipv4(suffix)
                .map_err(|_| ConfigError::InvalidMask(suffix.to_string()))?;
            ipv4_mask_to_prefix(mask).map_err(|_| ConfigError::InvalidMask(suffix.to_string()))?
        } else {
            suffix
                .parse::<u8>()
                .map_err(|_| ConfigError::InvalidRange(s.to_string()))?
        };
        let net = cidr_net(ip, prefix)?;
        return Ok(Ipv4Range::from_net(net));
    }

    Ok(Ipv4Range::single(parse_ipv4(s)?))
}

/// Build the network containing `ip` with the given prefix, enforcing the /8../31 window.
pub fn cidr_net(ip: Ipv4Addr, prefix: u8) -> Result<Ipv4Net, ConfigError> {
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
        return Err(ConfigError::InvalidCidr(prefix));
    }
    Ipv4Net::new(ip, prefix)
        .map(|n| n.trunc())
        .map_err(|_| ConfigError::InvalidCidr(prefix))
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr, ConfigError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ConfigError::InvalidIp(s.trim().to_string()))
}

/// Detect the subnets of every Ethernet-like local IPv4 adapter, using the adapter's own prefix.
///
/// Loopback, link-local and virtual bridge/tunnel adapters are skipped. Duplicates are removed.
pub fn detect_local_networks() -> Result<Vec<Ipv4Net>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if iface.is_loopback() || !is_ethernet_like(&iface.name) {
            continue;
        }
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_link_local() {
                continue;
            }
            let Ok(prefix) = ipv4_mask_to_prefix(v4.netmask) else {
                continue;
            };
            match cidr_net(v4.ip, prefix) {
                Ok(net) => {
                    set.insert(net);
                }
                Err(e) => {
                    tracing::warn!(iface = %iface.name, error = %e, "skipping adapter subnet");
                }
            }
        }
    }
    let mut nets: Vec<Ipv4Net> = set.into_iter().collect();
    // Sort for stable output
    nets.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(nets)
}

/// Adapter names that are physical/wireless NICs rather than container bridges or tunnels.
pub fn is_ethernet_like(name: &str) -> bool {
    const VIRTUAL: &[&str] = &["docker", "veth", "br-", "virbr", "tun", "tap", "wg", "vmnet"];
    let lower = name.to_ascii_lowercase();
    !VIRTUAL.iter().any(|p| lower.starts_with(p))
}
