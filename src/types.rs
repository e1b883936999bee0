use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Name SQL Server uses for the default (unnamed) instance.
pub const DEFAULT_INSTANCE: &str = "MSSQLSERVER";

/// Default TCP port of the database engine.
pub const DEFAULT_SQL_PORT: u16 = 1433;

/// A single host identity to probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    pub host: String,
    /// Identity is already an address or a directory-provided DNS name. Informational: it is
    /// carried into scan logs and does not change which probes run.
    pub resolved: bool,
}

impl ScanTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            resolved: false,
        }
    }

    pub fn resolved(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            resolved: true,
        }
    }

    /// Key used for the per-run "already scanned" set.
    pub fn dedup_key(&self) -> String {
        self.host.trim().to_ascii_lowercase()
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }
}

/// How sure the engine is that a row is a real SQL Server endpoint.
///
/// Variants are declared in ascending order so the derived `Ord` is the
/// `None < Low < Medium < High` lattice.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Confidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Raise to `level` if it is higher; never lowers.
    pub fn raise(&mut self, level: Confidence) {
        if level > *self {
            *self = level;
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "None",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        };
        f.write_str(s)
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown confidence level: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    Available,
    Unavailable,
    #[default]
    Unknown,
}

/// One kind of per-host probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProbeKind {
    Browser,
    SqlConnect,
    SqlService,
    DnsResolve,
    Spn,
    TcpPort,
    Ping,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::Browser,
        ProbeKind::SqlConnect,
        ProbeKind::SqlService,
        ProbeKind::DnsResolve,
        ProbeKind::Spn,
        ProbeKind::TcpPort,
        ProbeKind::Ping,
    ];
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(Self::Browser),
            "sqlconnect" => Ok(Self::SqlConnect),
            "sqlservice" => Ok(Self::SqlService),
            "dnsresolve" | "dns" => Ok(Self::DnsResolve),
            "spn" => Ok(Self::Spn),
            "tcpport" | "tcp" => Ok(Self::TcpPort),
            "ping" => Ok(Self::Ping),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// Set of enabled probe kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProbeSet(BTreeSet<ProbeKind>);

impl ProbeSet {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn all() -> Self {
        ProbeKind::ALL.into_iter().collect()
    }

    /// Every probe except the authenticated connection attempt.
    pub fn default_set() -> Self {
        ProbeKind::ALL
            .into_iter()
            .filter(|k| *k != ProbeKind::SqlConnect)
            .collect()
    }

    pub fn contains(&self, kind: ProbeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn insert(&mut self, kind: ProbeKind) {
        self.0.insert(kind);
    }

    pub fn iter(&self) -> impl Iterator<Item = ProbeKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::default_set()
    }
}

impl FromIterator<ProbeKind> for ProbeSet {
    fn from_iter<I: IntoIterator<Item = ProbeKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Source of candidate hosts for a discovery run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiscoveryType {
    IpRange,
    DomainSpn,
    DomainServer,
    DataSourceEnumeration,
}

impl DiscoveryType {
    pub const ALL: [DiscoveryType; 4] = [
        DiscoveryType::IpRange,
        DiscoveryType::DomainSpn,
        DiscoveryType::DomainServer,
        DiscoveryType::DataSourceEnumeration,
    ];
}

/// Username/password pair handed through to collaborators.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DnsResult {
    pub host_name: String,
    pub addresses: Vec<IpAddr>,
}

/// One instance record from an SSRP reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct BrowserReply {
    /// Host the probe was sent to.
    pub machine_name: String,
    /// `ServerName` field of the reply.
    pub computer_name: String,
    pub instance_name: String,
    pub sql_instance: String,
    pub version: String,
    pub is_clustered: bool,
    #[serde(rename = "TCPPort")]
    pub tcp_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PortResult {
    pub computer_name: String,
    pub port: u16,
    pub is_open: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Engine,
    Agent,
    Browser,
    FullText,
    ReportingServices,
    AnalysisServices,
    IntegrationServices,
    Telemetry,
    Writer,
    Launchpad,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Running,
    Stopped,
    Paused,
    StartPending,
    StopPending,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInfo {
    pub computer_name: String,
    pub service_name: String,
    /// Empty for services without instance affinity (Browser, Writer, ...).
    pub instance_name: String,
    pub service_type: ServiceType,
    pub state: ServiceState,
}

impl ServiceInfo {
    pub fn is_instance_scoped(&self) -> bool {
        !self.instance_name.is_empty()
    }
}

/// Everything gathered about one host during one scan pass.
#[derive(Debug, Clone, Default)]
pub struct InstanceEvidence {
    pub target: Option<ScanTarget>,
    pub dns: Option<DnsResult>,
    pub ping: bool,
    pub spns: Vec<String>,
    pub ports: Vec<PortResult>,
    pub browser: Vec<BrowserReply>,
    pub services: Vec<ServiceInfo>,
}

impl InstanceEvidence {
    pub fn for_target(target: ScanTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    pub fn computer_name(&self) -> String {
        self.target
            .as_ref()
            .map(|t| t.host.clone())
            .unwrap_or_default()
    }

    /// Best host name: the DNS-resolved name if any, else the target itself.
    pub fn machine_name(&self) -> String {
        match &self.dns {
            Some(d) if !d.host_name.is_empty() => d.host_name.clone(),
            _ => self.computer_name(),
        }
    }

    pub fn reachable(&self) -> bool {
        self.dns.is_some() || self.ping
    }
}

/// One externally visible result row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScanReport {
    pub machine_name: String,
    pub computer_name: String,
    pub instance_name: Option<String>,
    pub sql_instance: String,
    pub full_name: String,
    pub port: Option<u16>,
    pub dns_resolution: Option<DnsResult>,
    pub ping: bool,
    pub scan_types: ProbeSet,
    pub services: Vec<ServiceInfo>,
    pub system_services: Vec<ServiceInfo>,
    #[serde(rename = "SPNs")]
    pub spns: Vec<String>,
    pub browse_reply: Option<BrowserReply>,
    pub ports_scanned: Vec<PortResult>,
    pub tcp_connected: bool,
    pub sql_connected: bool,
    pub confidence: Confidence,
    pub availability: Availability,
    pub timestamp: String,
}

impl ScanReport {
    /// Fill `sql_instance` / `full_name` from computer, instance and port.
    pub fn refresh_names(&mut self) {
        self.sql_instance = match self.instance_name.as_deref() {
            Some(i) if !i.eq_ignore_ascii_case(DEFAULT_INSTANCE) => {
                format!("{}\\{}", self.computer_name, i)
            }
            _ => self.computer_name.clone(),
        };
        self.full_name = match self.port {
            Some(p) => format!("{},{}", self.sql_instance, p),
            None => self.sql_instance.clone(),
        };
    }
}
