use async_trait::async_trait;
use sql_scan_rs::config::ScanOptions;
use sql_scan_rs::directory::{BoundDirectory, Directory, DirectoryEntry, DirectoryError, DirectoryQuery};
use sql_scan_rs::error::ProbeError;
use sql_scan_rs::probes::HostProber;
use sql_scan_rs::scanner::{self, Collaborators, HostScanner, SharedProgress};
use sql_scan_rs::services::ServiceError;
use sql_scan_rs::sqlconn::{ConnectOutcome, SqlConnector, SqlTarget};
use sql_scan_rs::targets::DiscoveryRequest;
use sql_scan_rs::types::{
    Availability, BrowserReply, Confidence, Credential, DiscoveryType, DnsResult, ProbeKind,
    ProbeSet, ScanReport, ScanTarget, ServiceInfo, ServiceState, ServiceType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default, Clone)]
struct FakeHost {
    dns: Option<DnsResult>,
    ping: bool,
    spns: Vec<String>,
    open_ports: Vec<u16>,
    browser: Vec<BrowserReply>,
    services: Vec<ServiceInfo>,
}

#[derive(Default)]
struct FakeProber {
    hosts: HashMap<String, FakeHost>,
    tcp_calls: Mutex<Vec<(String, u16)>>,
    spn_calls: Mutex<Vec<String>>,
}

impl FakeProber {
    fn with(hosts: Vec<(&str, FakeHost)>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|(h, f)| (h.to_string(), f)).collect(),
            ..Default::default()
        }
    }

    fn host(&self, host: &str) -> FakeHost {
        self.hosts.get(host).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HostProber for FakeProber {
    async fn resolve(&self, host: &str) -> Option<DnsResult> {
        self.host(host).dns
    }

    async fn ping(&self, host: &str) -> bool {
        self.host(host).ping
    }

    async fn spns(&self, host: &str) -> Result<Vec<String>, DirectoryError> {
        self.spn_calls.lock().unwrap().push(host.to_string());
        Ok(self.host(host).spns)
    }

    async fn tcp_port(&self, host: &str, port: u16) -> bool {
        self.tcp_calls.lock().unwrap().push((host.to_string(), port));
        self.host(host).open_ports.contains(&port)
    }

    async fn browser(&self, host: &str) -> Result<Vec<BrowserReply>, ProbeError> {
        let replies = self.host(host).browser;
        if replies.is_empty() {
            return Err(ProbeError::Timeout {
                probe: "browser",
                host: host.to_string(),
            });
        }
        Ok(replies)
    }

    async fn services(&self, host: &str) -> Result<Vec<ServiceInfo>, ServiceError> {
        let services = self.host(host).services;
        if services.is_empty() {
            return Err(ServiceError::Timeout(host.to_string()));
        }
        Ok(services)
    }
}

struct NoServer;

#[async_trait]
impl SqlConnector for NoServer {
    async fn connect(&self, _target: &SqlTarget) -> ConnectOutcome {
        ConnectOutcome::Unreachable {
            reason: "refused".into(),
        }
    }
}

struct FakeDirectory {
    entries: Vec<DirectoryEntry>,
}

struct FakeSession(Vec<DirectoryEntry>);

#[async_trait]
impl Directory for FakeDirectory {
    async fn bind(
        &self,
        _controller: Option<&str>,
        _credential: Option<&Credential>,
    ) -> Result<Box<dyn BoundDirectory>, DirectoryError> {
        Ok(Box::new(FakeSession(self.entries.clone())))
    }
}

#[async_trait]
impl BoundDirectory for FakeSession {
    async fn search(&mut self, query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        match query {
            DirectoryQuery::Spn { host: None } => Ok(self.0.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn close(self: Box<Self>) {}
}

struct DownDirectory;

#[async_trait]
impl Directory for DownDirectory {
    async fn bind(
        &self,
        _controller: Option<&str>,
        _credential: Option<&Credential>,
    ) -> Result<Box<dyn BoundDirectory>, DirectoryError> {
        Err(DirectoryError::NoController)
    }
}

fn collaborators(prober: Arc<FakeProber>, directory: Arc<dyn Directory>) -> Collaborators {
    Collaborators {
        prober,
        connector: Arc::new(NoServer),
        directory,
    }
}

fn options(min: Confidence) -> ScanOptions {
    ScanOptions {
        min_confidence: min,
        concurrency: 4,
        ..ScanOptions::default()
    }
}

fn engine(host: &str, instance: &str, state: ServiceState) -> ServiceInfo {
    ServiceInfo {
        computer_name: host.into(),
        service_name: format!("MSSQL${instance}"),
        instance_name: instance.into(),
        service_type: ServiceType::Engine,
        state,
    }
}

async fn scan(hosts: &[&str], prober: Arc<FakeProber>, opts: &ScanOptions) -> Vec<ScanReport> {
    let (tx, rx) = mpsc::channel(16);
    for h in hosts {
        tx.send(ScanTarget::new(*h)).await.unwrap();
    }
    drop(tx);
    scanner::scan_stream(
        rx,
        opts,
        collaborators(prober, Arc::new(DownDirectory)),
        CancellationToken::new(),
        SharedProgress::new(),
    )
    .await
}

#[tokio::test]
async fn same_host_from_two_sources_is_scanned_once() {
    let prober = Arc::new(FakeProber::default());
    let directory = Arc::new(FakeDirectory {
        entries: vec![DirectoryEntry {
            name: "X".into(),
            dns_host_name: None,
            spns: vec![],
        }],
    });
    let request = DiscoveryRequest {
        hosts: vec!["X".into(), "tcp:x,1433".into()],
        discovery: vec![DiscoveryType::DomainSpn],
        ip_ranges: vec![],
    };
    scanner::discover(
        &request,
        &options(Confidence::None),
        collaborators(prober.clone(), directory),
        CancellationToken::new(),
        SharedProgress::new(),
    )
    .await
    .unwrap();

    let calls = prober.tcp_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
}

#[tokio::test]
async fn failing_directory_source_does_not_stop_other_sources() {
    let prober = Arc::new(FakeProber::with(vec![(
        "SQL9",
        FakeHost {
            open_ports: vec![1433],
            ..Default::default()
        },
    )]));
    let request = DiscoveryRequest {
        hosts: vec!["SQL9".into()],
        discovery: vec![DiscoveryType::DomainSpn, DiscoveryType::DomainServer],
        ip_ranges: vec![],
    };
    let rows = scanner::discover(
        &request,
        &options(Confidence::Low),
        collaborators(prober, Arc::new(DownDirectory)),
        CancellationToken::new(),
        SharedProgress::new(),
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn config_errors_halt_before_scanning() {
    let prober = Arc::new(FakeProber::default());
    let request = DiscoveryRequest {
        hosts: vec!["SQL9".into()],
        discovery: vec![],
        ip_ranges: vec!["10.0.0.0/32".into()],
    };
    let res = scanner::discover(
        &request,
        &options(Confidence::Low),
        collaborators(prober.clone(), Arc::new(DownDirectory)),
        CancellationToken::new(),
        SharedProgress::new(),
    )
    .await;
    assert!(res.is_err());
    assert!(prober.tcp_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn host_scanner_dedups_case_insensitively() {
    let prober = Arc::new(FakeProber::default());
    let scanner = HostScanner::new(prober, ScanOptions::default());
    assert!(scanner.scan_host(ScanTarget::new("Db01")).await.is_some());
    assert!(scanner.scan_host(ScanTarget::new("db01")).await.is_none());
}

#[tokio::test]
async fn spn_lookup_skipped_for_literal_addresses() {
    let prober = Arc::new(FakeProber::default());
    let scanner = HostScanner::new(prober.clone(), ScanOptions::default());
    scanner.scan_host(ScanTarget::new("10.1.1.1")).await;
    scanner.scan_host(ScanTarget::new("db02")).await;
    assert_eq!(*prober.spn_calls.lock().unwrap(), vec!["db02".to_string()]);
}

#[tokio::test]
async fn spn_lookup_uses_resolved_name() {
    let prober = Arc::new(FakeProber::with(vec![(
        "10.1.1.2",
        FakeHost {
            dns: Some(DnsResult {
                host_name: "db03.contoso.com".into(),
                addresses: vec!["10.1.1.2".parse().unwrap()],
            }),
            ..Default::default()
        },
    )]));
    let scanner = HostScanner::new(prober.clone(), ScanOptions::default());
    scanner.scan_host(ScanTarget::new("10.1.1.2")).await;
    assert_eq!(*prober.spn_calls.lock().unwrap(), vec!["db03.contoso.com".to_string()]);
}

#[tokio::test]
async fn ports_are_probed_even_when_tcp_probe_kind_is_off() {
    let prober = Arc::new(FakeProber::default());
    let opts = ScanOptions {
        probes: [ProbeKind::Ping].into_iter().collect::<ProbeSet>(),
        ports: vec![1433, 2433],
        ..ScanOptions::default()
    };
    let scanner = HostScanner::new(prober.clone(), opts);
    let ev = scanner.scan_host(ScanTarget::new("db04")).await.unwrap();
    assert_eq!(ev.ports.len(), 2);
    assert!(prober.spn_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn web01_open_1433_gives_medium_bare_port_row() {
    let prober = Arc::new(FakeProber::with(vec![(
        "WEB01",
        FakeHost {
            ping: true,
            open_ports: vec![1433],
            ..Default::default()
        },
    )]));
    let rows = scan(&["WEB01"], prober, &options(Confidence::Low)).await;
    assert_eq!(rows.len(), 1);
    let r = &rows[0];
    assert_eq!(r.instance_name, None);
    assert_eq!(r.port, Some(1433));
    assert_eq!(r.confidence, Confidence::Medium);
    assert!(r.tcp_connected);
    assert!(r.ping);
}

#[tokio::test]
async fn sql01_browser_reply_gives_medium_instance_row() {
    let reply = BrowserReply {
        machine_name: "SQL01".into(),
        computer_name: "SQL01".into(),
        instance_name: "PROD".into(),
        sql_instance: "SQL01\\PROD".into(),
        version: "15.0.2000.5".into(),
        is_clustered: false,
        tcp_port: Some(1433),
    };
    let prober = Arc::new(FakeProber::with(vec![(
        "SQL01",
        FakeHost {
            open_ports: vec![1433],
            browser: vec![reply],
            ..Default::default()
        },
    )]));
    let rows = scan(&["SQL01"], prober, &options(Confidence::Low)).await;
    assert_eq!(rows.len(), 1);
    let r = &rows[0];
    assert_eq!(r.instance_name.as_deref(), Some("PROD"));
    assert_eq!(r.confidence, Confidence::Medium);
    assert!(r.tcp_connected);
    assert_eq!(r.full_name, "SQL01\\PROD,1433");
}

#[tokio::test]
async fn sql02_running_engine_gives_high_available_row() {
    let prober = Arc::new(FakeProber::with(vec![(
        "SQL02",
        FakeHost {
            services: vec![engine("SQL02", "PROD2", ServiceState::Running)],
            ..Default::default()
        },
    )]));
    let rows = scan(&["SQL02"], prober, &options(Confidence::Low)).await;
    assert_eq!(rows.len(), 1);
    let r = &rows[0];
    assert_eq!(r.instance_name.as_deref(), Some("PROD2"));
    assert_eq!(r.confidence, Confidence::High);
    assert_eq!(r.availability, Availability::Available);
}

#[tokio::test]
async fn ghost_host_yields_nothing_at_any_threshold() {
    for min in [Confidence::None, Confidence::Low, Confidence::Medium, Confidence::High] {
        let prober = Arc::new(FakeProber::default());
        let rows = scan(&["GHOST"], prober, &options(min)).await;
        assert!(rows.is_empty(), "min {min}");
    }
}

#[tokio::test]
async fn reachable_host_without_evidence_only_at_none() {
    let host = FakeHost {
        ping: true,
        ..Default::default()
    };
    let prober = Arc::new(FakeProber::with(vec![("WEB02", host.clone())]));
    assert!(scan(&["WEB02"], prober, &options(Confidence::Low)).await.is_empty());

    let prober = Arc::new(FakeProber::with(vec![("WEB02", host)]));
    let rows = scan(&["WEB02"], prober, &options(Confidence::None)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].confidence, Confidence::None);
}

#[tokio::test]
async fn min_confidence_filters_after_fusion() {
    let prober = Arc::new(FakeProber::with(vec![(
        "DB05",
        FakeHost {
            open_ports: vec![2433],
            spns: vec!["MSSQLsvc/db05:INST2".into()],
            ..Default::default()
        },
    )]));
    let opts = ScanOptions {
        ports: vec![2433],
        ..options(Confidence::Medium)
    };
    assert!(scan(&["DB05"], prober, &opts).await.is_empty());
}

#[tokio::test]
async fn unreachable_connection_leaves_confidence_alone() {
    let prober = Arc::new(FakeProber::with(vec![(
        "WEB03",
        FakeHost {
            open_ports: vec![1433],
            ..Default::default()
        },
    )]));
    let opts = ScanOptions {
        probes: ProbeSet::all(),
        ..options(Confidence::Low)
    };
    let rows = scan(&["WEB03"], prober, &opts).await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].sql_connected);
    assert_eq!(rows[0].confidence, Confidence::Medium);
}
