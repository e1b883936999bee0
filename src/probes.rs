use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time;
use tracing::debug;

use crate::browser;
use crate::config::ScanOptions;
use crate::directory::{self, Directory, DirectoryError, LdapDirectory};
use crate::error::ProbeError;
use crate::services::{ScServiceEnumerator, ServiceEnumerator, ServiceError};
use crate::types::{BrowserReply, DnsResult, ServiceInfo};

const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Every per-host probe the orchestrator can run. Implementations must not share mutable state
/// between calls.
#[async_trait]
pub trait HostProber: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<DnsResult>;

    async fn ping(&self, host: &str) -> bool;

    async fn spns(&self, host: &str) -> Result<Vec<String>, DirectoryError>;

    async fn tcp_port(&self, host: &str, port: u16) -> bool;

    async fn browser(&self, host: &str) -> Result<Vec<BrowserReply>, ProbeError>;

    async fn services(&self, host: &str) -> Result<Vec<ServiceInfo>, ServiceError>;
}

/// Live prober talking to the network, the directory and the remote service manager.
pub struct NetworkProber {
    options: ScanOptions,
    directory: Arc<dyn Directory>,
    services: Arc<dyn ServiceEnumerator>,
}

impl NetworkProber {
    pub fn new(
        options: ScanOptions,
        directory: Arc<dyn Directory>,
        services: Arc<dyn ServiceEnumerator>,
    ) -> Self {
        Self {
            options,
            directory,
            services,
        }
    }

    /// Prober wired to LDAP and `sc.exe` with timeouts from `options`.
    pub fn live(options: ScanOptions) -> Self {
        let directory = Arc::new(LdapDirectory::new(options.connect_timeout()));
        let services = Arc::new(ScServiceEnumerator::new(options.service_timeout()));
        Self::new(options, directory, services)
    }
}

#[async_trait]
impl HostProber for NetworkProber {
    async fn resolve(&self, host: &str) -> Option<DnsResult> {
        resolve(host).await
    }

    async fn ping(&self, host: &str) -> bool {
        ping(host, self.options.ping_timeout()).await
    }

    async fn spns(&self, host: &str) -> Result<Vec<String>, DirectoryError> {
        directory::host_spns(
            self.directory.as_ref(),
            host,
            self.options.domain_controller.as_deref(),
            self.options.credential.as_ref(),
        )
        .await
    }

    async fn tcp_port(&self, host: &str, port: u16) -> bool {
        probe_tcp(host, port, self.options.tcp_timeout()).await
    }

    async fn browser(&self, host: &str) -> Result<Vec<BrowserReply>, ProbeError> {
        browser::probe_browser(host, self.options.browser_timeout()).await
    }

    async fn services(&self, host: &str) -> Result<Vec<ServiceInfo>, ServiceError> {
        self.services
            .list_services(host, self.options.credential.as_ref())
            .await
    }
}

/// Forward lookup of a name, or reverse lookup of a literal address. Failure means "no resolution".
pub async fn resolve(host: &str) -> Option<DnsResult> {
    let owned = host.to_string();
    let task = tokio::task::spawn_blocking(move || resolve_blocking(&owned));
    match time::timeout(DNS_TIMEOUT, task).await {
        Ok(Ok(res)) => res,
        _ => {
            debug!(host, "dns lookup timed out");
            None
        }
    }
}

fn resolve_blocking(host: &str) -> Option<DnsResult> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let host_name = dns_lookup::lookup_addr(&ip).ok()?;
        return Some(DnsResult {
            host_name,
            addresses: vec![ip],
        });
    }
    let addresses = dns_lookup::lookup_host(host).ok()?;
    if addresses.is_empty() {
        return None;
    }
    Some(DnsResult {
        host_name: host.to_string(),
        addresses,
    })
}

/// One ICMP echo. Any failure, including missing raw-socket privileges, is "no reply".
pub async fn ping(host: &str, timeout: Duration) -> bool {
    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => match lookup_host((host, 0)).await.ok().and_then(|mut a| a.next()) {
            Some(sa) => sa.ip(),
            None => return false,
        },
    };
    let payload = [0u8; 32];
    match time::timeout(timeout, surge_ping::ping(ip, &payload)).await {
        Ok(Ok((_, rtt))) => {
            debug!(host, ?rtt, "ping reply");
            true
        }
        Ok(Err(e)) => {
            debug!(host, error = %e, "ping failed");
            false
        }
        Err(_) => false,
    }
}

/// TCP connect probe. The socket is dropped (closed) straight away whatever the outcome.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}
