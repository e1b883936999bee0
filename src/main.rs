use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sql_scan_rs::config::ScanOptions;
use sql_scan_rs::scanner::{self, Collaborators, SharedProgress};
use sql_scan_rs::targets::DiscoveryRequest;
use sql_scan_rs::types::{Confidence, Credential, DiscoveryType, ProbeKind, ProbeSet, ScanReport};
use sql_scan_rs::{ports, server};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// sql-scan-rs: find SQL Server instances on a network and rank how sure we are about each.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sql-scan-rs",
    version,
    about = "Find SQL Server instances via DNS, ping, SPNs, TCP, the Browser service and service enumeration.",
    long_about = None
)]
struct Cli {
    /// Hosts to scan (connection strings like `tcp:HOST\INST,1433` are accepted).
    hosts: Vec<String>,

    /// Discovery sources to expand into hosts.
    #[arg(long, value_enum)]
    discovery: Vec<DiscoveryArg>,

    /// IP range for IpRange discovery: address, `a-b`, CIDR or `ip/mask`. Defaults to local subnets.
    #[arg(long = "ip-range")]
    ip_ranges: Vec<String>,

    /// Probes to run per host.
    #[arg(long = "scan-type", value_enum, default_values_t = [ScanTypeArg::Default])]
    scan_types: Vec<ScanTypeArg>,

    /// TCP ports to probe, e.g. `1433,14330-14339`.
    #[arg(long = "port")]
    ports: Option<String>,

    /// File with one port or range per line; merged with `--port`.
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Drop rows below this confidence (none, low, medium, high).
    #[arg(long = "min-confidence", default_value = "low")]
    min_confidence: Confidence,

    /// Directory controller for SPN and computer sweeps.
    #[arg(long = "domain-controller")]
    domain_controller: Option<String>,

    /// Windows/directory account for SPN lookups and service enumeration.
    #[arg(long)]
    username: Option<String>,

    #[arg(long, env = "SQLSCAN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// SQL login for the SqlConnect probe.
    #[arg(long = "sql-username")]
    sql_username: Option<String>,

    #[arg(long = "sql-password", env = "SQLSCAN_SQL_PASSWORD", hide_env_values = true)]
    sql_password: Option<String>,

    /// TCP connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 1_000)]
    timeout_ms: u64,

    /// Browser (UDP 1434) reply timeout in milliseconds.
    #[arg(long = "browser-timeout-ms", default_value_t = 2_000)]
    browser_timeout_ms: u64,

    /// Max hosts scanned concurrently.
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Report Browser socket errors as warnings instead of ignoring them.
    #[arg(long = "strict-browser-errors", default_value_t = false)]
    strict_browser_errors: bool,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Run the HTTP API instead of a one-shot scan.
    #[arg(long, default_value_t = false)]
    serve: bool,

    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiscoveryArg {
    IpRange,
    DomainSpn,
    DomainServer,
    DataSourceEnumeration,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScanTypeArg {
    Browser,
    SqlConnect,
    SqlService,
    DnsResolve,
    Spn,
    TcpPort,
    Ping,
    Default,
    All,
}

impl Cli {
    fn discovery_types(&self) -> Vec<DiscoveryType> {
        let mut out = Vec::new();
        for d in &self.discovery {
            match d {
                DiscoveryArg::IpRange => out.push(DiscoveryType::IpRange),
                DiscoveryArg::DomainSpn => out.push(DiscoveryType::DomainSpn),
                DiscoveryArg::DomainServer => out.push(DiscoveryType::DomainServer),
                DiscoveryArg::DataSourceEnumeration => out.push(DiscoveryType::DataSourceEnumeration),
                DiscoveryArg::All => out.extend(DiscoveryType::ALL),
            }
        }
        out
    }

    fn probe_set(&self) -> ProbeSet {
        let mut set = ProbeSet::empty();
        for t in &self.scan_types {
            match t {
                ScanTypeArg::Default => ProbeSet::default_set().iter().for_each(|k| set.insert(k)),
                ScanTypeArg::All => ProbeSet::all().iter().for_each(|k| set.insert(k)),
                ScanTypeArg::Browser => set.insert(ProbeKind::Browser),
                ScanTypeArg::SqlConnect => set.insert(ProbeKind::SqlConnect),
                ScanTypeArg::SqlService => set.insert(ProbeKind::SqlService),
                ScanTypeArg::DnsResolve => set.insert(ProbeKind::DnsResolve),
                ScanTypeArg::Spn => set.insert(ProbeKind::Spn),
                ScanTypeArg::TcpPort => set.insert(ProbeKind::TcpPort),
                ScanTypeArg::Ping => set.insert(ProbeKind::Ping),
            }
        }
        set
    }

    fn port_list(&self) -> Result<Vec<u16>> {
        let mut list = Vec::new();
        if let Some(spec) = self.ports.as_deref() {
            list.extend(ports::parse_port_spec(spec).context("invalid --port")?);
        }
        if let Some(path) = self.ports_file.as_deref() {
            list.extend(ports::load_ports_from_path(path)?);
        }
        let mut seen = std::collections::HashSet::new();
        list.retain(|p| seen.insert(*p));
        if list.is_empty() {
            list = ports::default_ports();
        }
        Ok(list)
    }

    fn options(&self) -> Result<ScanOptions> {
        Ok(ScanOptions {
            probes: self.probe_set(),
            ports: self.port_list()?,
            min_confidence: self.min_confidence,
            tcp_timeout_ms: self.timeout_ms,
            browser_timeout_ms: self.browser_timeout_ms,
            concurrency: self.concurrency,
            credential: credential(&self.username, &self.password),
            sql_credential: credential(&self.sql_username, &self.sql_password),
            domain_controller: self.domain_controller.clone(),
            strict_browser_errors: self.strict_browser_errors,
            ..ScanOptions::default()
        })
    }
}

fn credential(user: &Option<String>, password: &Option<String>) -> Option<Credential> {
    user.as_ref().map(|u| Credential {
        username: u.clone(),
        password: password.clone().unwrap_or_default(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if cli.serve {
        println!("Discovery API at http://{}/api (Ctrl+C to stop)", cli.bind);
        tokio::select! {
            res = server::spawn_server(&cli.bind) => res?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(());
    }

    let options = cli.options()?;
    let request = DiscoveryRequest {
        hosts: cli.hosts.clone(),
        discovery: cli.discovery_types(),
        ip_ranges: cli.ip_ranges.clone(),
    };

    // Ctrl-C stops handing out new hosts; hosts already in flight finish.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let collaborators = Collaborators::live(&options);
    let reports = scanner::discover(
        &request,
        &options,
        collaborators,
        cancel,
        SharedProgress::new(),
    )
    .await?;

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &reports)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }
    print_results_table(&reports);
    Ok(())
}

fn print_results_table(reports: &[ScanReport]) {
    let mut name_w = "instance".len();
    for r in reports {
        name_w = name_w.max(r.sql_instance.chars().count().min(NAME_COL_MAX));
    }
    let port_w = "port".len().max(5);
    let conf_w = "confidence".len();
    let avail_w = "availability".len();

    println!("\nInstances found: {}", reports.len());
    println!(
        "{:<name_w$}  {:>port_w$}  {:<conf_w$}  {:<avail_w$}  {:<3}  {:<3}",
        "instance", "port", "confidence", "availability", "tcp", "sql",
    );
    println!(
        "{:-<name_w$}  {:-<port_w$}  {:-<conf_w$}  {:-<avail_w$}  {:-<3}  {:-<3}",
        "", "", "", "", "", "",
    );
    for r in reports {
        let name = clip(&r.sql_instance, NAME_COL_MAX);
        let port = r.port.map(|p| p.to_string()).unwrap_or_default();
        println!(
            "{:<name_w$}  {:>port_w$}  {:<conf_w$}  {:<avail_w$}  {:<3}  {:<3}",
            name,
            port,
            r.confidence.to_string(),
            format!("{:?}", r.availability),
            yes_no(r.tcp_connected),
            yes_no(r.sql_connected),
        );
    }
}

const NAME_COL_MAX: usize = 60;

// Cuts on a char boundary.
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn write_results_json(path: &std::path::Path, reports: &[ScanReport]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, reports)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_multibyte_characters() {
        let name = format!("{}Ü", "a".repeat(59));
        assert_eq!(clip(&name, NAME_COL_MAX), name);
        let long = "Ü".repeat(70);
        assert_eq!(clip(&long, NAME_COL_MAX).chars().count(), 60);
        assert_eq!(clip("sql01", NAME_COL_MAX), "sql01");
    }

    #[test]
    fn table_prints_non_ascii_instance_names() {
        let mut row: ScanReport = serde_json::from_value(serde_json::json!({
            "MachineName": "h", "ComputerName": "h", "InstanceName": null, "SqlInstance": "",
            "FullName": "", "Port": 1433, "DnsResolution": null, "Ping": false,
            "ScanTypes": [], "Services": [], "SystemServices": [], "SPNs": [],
            "BrowseReply": null, "PortsScanned": [], "TcpConnected": true, "SqlConnected": false,
            "Confidence": "Medium", "Availability": "Unknown", "Timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        row.sql_instance = format!("{}Ü{}", "a".repeat(59), "ö".repeat(10));
        print_results_table(&[row]);
    }
}
