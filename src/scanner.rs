use crate::config::ScanOptions;
use crate::directory::{Directory, LdapDirectory};
use crate::filter;
use crate::fusion;
use crate::probes::{HostProber, NetworkProber};
use crate::sqlconn::{SqlConnector, TiberiusConnector};
use crate::targets::{DiscoveryRequest, TargetSources};
use crate::types::{InstanceEvidence, PortResult, ProbeKind, ScanReport, ScanTarget};
use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress counters and accumulated rows, shareable with a status endpoint.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub hosts_seen: Arc<AtomicU64>,
    pub hosts_scanned: Arc<AtomicU64>,
    pub rows_found: Arc<AtomicU64>,
    pub reports: Arc<Mutex<Vec<ScanReport>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            hosts_seen: Arc::new(AtomicU64::new(0)),
            hosts_scanned: Arc::new(AtomicU64::new(0)),
            rows_found: Arc::new(AtomicU64::new(0)),
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the enabled probes against one host at a time and remembers which hosts were done.
pub struct HostScanner {
    prober: Arc<dyn HostProber>,
    options: ScanOptions,
    scanned: Mutex<HashSet<String>>,
}

impl HostScanner {
    pub fn new(prober: Arc<dyn HostProber>, options: ScanOptions) -> Self {
        Self {
            prober,
            options,
            scanned: Mutex::new(HashSet::new()),
        }
    }

    /// Gather evidence for `target`. Returns `None` if this host was already scanned in this run.
    ///
    /// Individual probe failures only remove that probe's evidence.
    pub async fn scan_host(&self, target: ScanTarget) -> Option<InstanceEvidence> {
        if !self.scanned.lock().await.insert(target.dedup_key()) {
            debug!(host = %target.host, "already scanned");
            return None;
        }

        let probes = &self.options.probes;
        let host = target.host.clone();
        debug!(host = %host, resolved = target.resolved, "scanning host");
        let mut ev = InstanceEvidence::for_target(target.clone());

        if probes.contains(ProbeKind::DnsResolve) {
            ev.dns = self.prober.resolve(&host).await;
        }

        if probes.contains(ProbeKind::Ping) {
            ev.ping = self.prober.ping(&host).await;
        }

        if probes.contains(ProbeKind::Spn) {
            let spn_host = ev
                .dns
                .as_ref()
                .map(|d| d.host_name.clone())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| host.clone());
            if ScanTarget::new(spn_host.as_str()).is_ip_literal() {
                debug!(host = %spn_host, "skipping SPN lookup for a literal address");
            } else {
                match self.prober.spns(&spn_host).await {
                    Ok(spns) => ev.spns = spns,
                    Err(e) => debug!(host = %spn_host, error = %e, "SPN lookup failed"),
                }
            }
        }

        // Port state corroborates every other kind of evidence, so it is always probed.
        for port in self.options.effective_ports() {
            let is_open = self.prober.tcp_port(&host, port).await;
            ev.ports.push(PortResult {
                computer_name: host.clone(),
                port,
                is_open,
            });
        }

        if probes.contains(ProbeKind::Browser) {
            match self.prober.browser(&host).await {
                Ok(replies) => ev.browser = replies,
                Err(e) if self.options.strict_browser_errors => {
                    warn!(host = %host, error = %e, "browser probe failed");
                }
                Err(e) => debug!(host = %host, error = %e, "no browser reply"),
            }
        }

        if probes.contains(ProbeKind::SqlService) {
            match self.prober.services(&host).await {
                Ok(services) => ev.services = services,
                Err(e) => warn!(host = %host, error = %e, "service enumeration failed"),
            }
        }

        Some(ev)
    }
}

/// Live collaborators for a run.
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Arc<dyn HostProber>,
    pub connector: Arc<dyn SqlConnector>,
    pub directory: Arc<dyn Directory>,
}

impl Collaborators {
    pub fn live(options: &ScanOptions) -> Self {
        Self {
            prober: Arc::new(NetworkProber::live(options.clone())),
            connector: Arc::new(TiberiusConnector::new(
                options.sql_credential.clone(),
                options.connect_timeout(),
            )),
            directory: Arc::new(LdapDirectory::new(options.connect_timeout())),
        }
    }
}

/// Validate `request`, enumerate targets and scan them. Configuration errors abort before any
/// host is touched.
pub async fn discover(
    request: &DiscoveryRequest,
    options: &ScanOptions,
    collaborators: Collaborators,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> Result<Vec<ScanReport>> {
    let plan = request.plan()?;
    let sources = TargetSources {
        directory: collaborators.directory.clone(),
        domain_controller: options.domain_controller.clone(),
        credential: options.credential.clone(),
        broadcast_window: options.browser_timeout(),
    };
    let targets = plan.stream(sources, options.concurrency.max(1) * 4);
    Ok(scan_stream(targets, options, collaborators, cancel, shared).await)
}

/// Scan every target from `targets` with at most `options.concurrency` hosts in flight.
pub async fn scan_stream(
    mut targets: mpsc::Receiver<ScanTarget>,
    options: &ScanOptions,
    collaborators: Collaborators,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> Vec<ScanReport> {
    let scanner = Arc::new(HostScanner::new(collaborators.prober.clone(), options.clone()));
    let sem = Arc::new(Semaphore::new(options.concurrency.clamp(1, 1_024)));
    let mut set = JoinSet::new();

    info!(
        probes = ?options.probes,
        ports = ?options.effective_ports(),
        min_confidence = %options.min_confidence,
        "discovery started"
    );

    loop {
        let target = tokio::select! {
            _ = cancel.cancelled() => break,
            t = targets.recv() => match t {
                Some(t) => t,
                None => break,
            },
        };
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        shared.hosts_seen.fetch_add(1, Ordering::Relaxed);

        let scanner = scanner.clone();
        let connector = collaborators.connector.clone();
        let options = options.clone();
        let shared = shared.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes
            if cancel.is_cancelled() {
                return;
            }
            let host = target.host.clone();
            let Some(evidence) = scanner.scan_host(target).await else {
                return;
            };
            let rows = fuse_and_rank(&evidence, &options, connector.as_ref()).await;
            debug!(host = %host, rows = rows.len(), "host done");

            shared.hosts_scanned.fetch_add(1, Ordering::Relaxed);
            shared.rows_found.fetch_add(rows.len() as u64, Ordering::Relaxed);
            shared.reports.lock().await.extend(rows);
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "host scan task failed");
        }
    }

    let reports = shared.reports.lock().await.clone();
    info!(
        hosts = shared.hosts_scanned.load(Ordering::Relaxed),
        rows = reports.len(),
        "discovery finished"
    );
    reports
}

/// Fuse one host's evidence, run the optional connection upgrade and apply the confidence floor.
pub async fn fuse_and_rank(
    evidence: &InstanceEvidence,
    options: &ScanOptions,
    connector: &dyn SqlConnector,
) -> Vec<ScanReport> {
    let timestamp = now_rfc3339();
    let mut rows = fusion::fuse(evidence, &options.probes, options.min_confidence, &timestamp);
    if options.probes.contains(ProbeKind::SqlConnect) {
        rows = fusion::upgrade_with_connection(rows, connector).await;
    }
    filter::by_confidence(rows, options.min_confidence)
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
