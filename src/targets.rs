//! Expands a discovery request into a lazy stream of hosts to scan.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::browser;
use crate::directory::{self, Directory};
use crate::error::ConfigError;
use crate::netdetect::{self, Ipv4Range};
use crate::types::{Credential, DiscoveryType, ScanTarget};

/// What to scan: explicit hosts, discovery sources, or both.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryRequest {
    pub hosts: Vec<String>,
    pub discovery: Vec<DiscoveryType>,
    /// IP range expressions; giving any implies `IpRange` discovery.
    pub ip_ranges: Vec<String>,
}

impl DiscoveryRequest {
    /// Validate the request. Every error here is fatal for the run.
    pub fn plan(&self) -> Result<TargetPlan, ConfigError> {
        let mut discovery: BTreeSet<DiscoveryType> = self.discovery.iter().copied().collect();
        if !self.ip_ranges.is_empty() {
            discovery.insert(DiscoveryType::IpRange);
        }
        if self.hosts.is_empty() && discovery.is_empty() {
            return Err(ConfigError::NothingToScan);
        }

        let ranges = self
            .ip_ranges
            .iter()
            .map(|r| netdetect::parse_ip_range(r))
            .collect::<Result<Vec<_>, _>>()?;

        let hosts = self
            .hosts
            .iter()
            .map(|h| normalize_host(h))
            .filter(|h| !h.is_empty())
            .map(ScanTarget::new)
            .collect();

        Ok(TargetPlan {
            hosts,
            ranges,
            discovery,
        })
    }
}

/// Reduce a connection-style identifier to a bare host or address.
///
/// `tcp:SQL01\PROD,1433` becomes `SQL01`; `.` and `(local)` become `localhost`.
pub fn normalize_host(input: &str) -> String {
    let mut s = input.trim();
    for prefix in ["tcp:", "np:", "lpc:", "admin:"] {
        if s.get(..prefix.len()).is_some_and(|p| p.eq_ignore_ascii_case(prefix)) {
            s = &s[prefix.len()..];
        }
    }
    let s = s.split([',', '\\']).next().unwrap_or("").trim();
    match s {
        "." | "(local)" | "(localdb)" => "localhost".to_string(),
        _ => s.to_string(),
    }
}

/// Validated discovery request.
#[derive(Debug, Clone)]
pub struct TargetPlan {
    hosts: Vec<ScanTarget>,
    ranges: Vec<Ipv4Range>,
    discovery: BTreeSet<DiscoveryType>,
}

/// Where directory- and broadcast-based discovery reach out to.
#[derive(Clone)]
pub struct TargetSources {
    pub directory: Arc<dyn Directory>,
    pub domain_controller: Option<String>,
    pub credential: Option<Credential>,
    pub broadcast_window: Duration,
}

impl TargetPlan {
    pub fn discovery(&self) -> &BTreeSet<DiscoveryType> {
        &self.discovery
    }

    /// Start producing targets. The channel is bounded so expansion only runs ahead of the
    /// scanner by `buffer` hosts; dropping the receiver stops the producer.
    pub fn stream(self, sources: TargetSources, buffer: usize) -> mpsc::Receiver<ScanTarget> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            self.produce(&sources, &tx).await;
        });
        rx
    }

    async fn produce(&self, sources: &TargetSources, tx: &mpsc::Sender<ScanTarget>) {
        if !send_all(tx, self.hosts.iter().cloned()).await {
            return;
        }

        if self.discovery.contains(&DiscoveryType::IpRange) && !self.send_ranges(tx).await {
            return;
        }

        let controller = sources.domain_controller.as_deref();
        let credential = sources.credential.as_ref();

        if self.discovery.contains(&DiscoveryType::DomainSpn) {
            match directory::sweep_spn_hosts(sources.directory.as_ref(), controller, credential).await {
                Ok(hosts) => {
                    info!(count = hosts.len(), "directory SPN sweep");
                    if !send_all(tx, hosts.into_iter().map(ScanTarget::resolved)).await {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "directory SPN sweep failed; no targets from it"),
            }
        }

        if self.discovery.contains(&DiscoveryType::DomainServer) {
            match directory::sweep_servers(sources.directory.as_ref(), controller, credential).await {
                Ok(hosts) => {
                    info!(count = hosts.len(), "directory server sweep");
                    if !send_all(tx, hosts.into_iter().map(ScanTarget::resolved)).await {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "directory server sweep failed; no targets from it"),
            }
        }

        if self.discovery.contains(&DiscoveryType::DataSourceEnumeration) {
            match browser::enumerate_broadcast(sources.broadcast_window).await {
                Ok(replies) => {
                    let hosts: IndexSet<String> =
                        replies.into_iter().map(|r| r.computer_name).collect();
                    info!(count = hosts.len(), "browser broadcast enumeration");
                    send_all(tx, hosts.into_iter().map(ScanTarget::new)).await;
                }
                Err(e) => warn!(error = %e, "browser broadcast failed; no targets from it"),
            }
        }
    }

    async fn send_ranges(&self, tx: &mpsc::Sender<ScanTarget>) -> bool {
        let ranges = if self.ranges.is_empty() {
            match netdetect::detect_local_networks() {
                Ok(nets) => {
                    info!(networks = nets.len(), "scanning local adapter subnets");
                    nets.into_iter().map(Ipv4Range::from_net).collect()
                }
                Err(e) => {
                    warn!(error = %e, "local network detection failed; no IP range targets");
                    Vec::new()
                }
            }
        } else {
            self.ranges.clone()
        };

        for range in ranges {
            let targets = range.iter().map(|ip| ScanTarget::resolved(ip.to_string()));
            if !send_all(tx, targets).await {
                return false;
            }
        }
        true
    }
}

// false once the consumer has gone away
async fn send_all(tx: &mpsc::Sender<ScanTarget>, targets: impl Iterator<Item = ScanTarget>) -> bool {
    for t in targets {
        if tx.send(t).await.is_err() {
            return false;
        }
    }
    true
}
