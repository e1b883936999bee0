//! Turns one host's evidence into ranked result rows.
//!
//! Named-instance rows are built first (from services, Browser replies and named SPNs),
//! then bare-port rows for open or SPN-registered ports no instance row claimed.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use tracing::debug;

use crate::directory::{parse_spn, SpnSuffix};
use crate::sqlconn::{ConnectOutcome, SqlConnector, SqlTarget};
use crate::types::{
    Availability, Confidence, InstanceEvidence, ProbeSet, ScanReport, ServiceState, ServiceType,
    DEFAULT_SQL_PORT,
};

/// Candidate instance names and ports pulled out of the evidence.
#[derive(Debug, Default)]
struct Candidates {
    /// lowercase key -> name as first seen
    names: IndexMap<String, String>,
    ports: IndexSet<u16>,
    open_ports: IndexSet<u16>,
    spn_ports: HashSet<u16>,
}

impl Candidates {
    fn collect(ev: &InstanceEvidence) -> Self {
        let mut c = Self::default();
        for s in ev.services.iter().filter(|s| s.is_instance_scoped()) {
            c.add_name(&s.instance_name);
        }
        for b in &ev.browser {
            c.add_name(&b.instance_name);
        }

        c.open_ports = ev.ports.iter().filter(|p| p.is_open).map(|p| p.port).collect();
        c.ports.extend(c.open_ports.iter().copied());
        for spn in ev.spns.iter().filter_map(|s| parse_spn(s)) {
            match spn.suffix {
                SpnSuffix::Port(p) => {
                    c.spn_ports.insert(p);
                    c.ports.insert(p);
                }
                SpnSuffix::Instance(name) => c.add_name(&name),
                SpnSuffix::None => {}
            }
        }
        c
    }

    fn add_name(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        self.names
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| name.to_string());
    }
}

fn base_row(ev: &InstanceEvidence, probes: &ProbeSet, timestamp: &str) -> ScanReport {
    let mut row = ScanReport {
        machine_name: ev.machine_name(),
        computer_name: ev.computer_name(),
        instance_name: None,
        sql_instance: String::new(),
        full_name: String::new(),
        port: None,
        dns_resolution: ev.dns.clone(),
        ping: ev.ping,
        scan_types: probes.clone(),
        services: Vec::new(),
        system_services: ev
            .services
            .iter()
            .filter(|s| !s.is_instance_scoped())
            .cloned()
            .collect(),
        spns: ev.spns.clone(),
        browse_reply: None,
        ports_scanned: ev.ports.clone(),
        tcp_connected: false,
        sql_connected: false,
        confidence: Confidence::None,
        availability: Availability::Unknown,
        timestamp: timestamp.to_string(),
    };
    row.refresh_names();
    row
}

fn port_open(ev: &InstanceEvidence, port: u16) -> bool {
    ev.ports.iter().any(|p| p.port == port && p.is_open)
}

fn availability(state: ServiceState) -> Availability {
    match state {
        ServiceState::Running => Availability::Available,
        ServiceState::Stopped => Availability::Unavailable,
        _ => Availability::Unknown,
    }
}

/// Build every result row for one host. `min_confidence` only decides whether the
/// no-evidence row for a reachable host is emitted at all.
pub fn fuse(
    ev: &InstanceEvidence,
    probes: &ProbeSet,
    min_confidence: Confidence,
    timestamp: &str,
) -> Vec<ScanReport> {
    let cand = Candidates::collect(ev);

    if cand.names.is_empty() && cand.ports.is_empty() {
        if ev.reachable() && min_confidence == Confidence::None {
            return vec![base_row(ev, probes, timestamp)];
        }
        return Vec::new();
    }

    let mut rows = Vec::new();
    let mut claimed = HashSet::<u16>::new();

    for name in cand.names.values() {
        let mut row = base_row(ev, probes, timestamp);
        row.instance_name = Some(name.clone());
        row.confidence = Confidence::Low;
        row.services = ev
            .services
            .iter()
            .filter(|s| s.instance_name.eq_ignore_ascii_case(name))
            .cloned()
            .collect();

        if let Some(reply) = ev
            .browser
            .iter()
            .find(|b| b.instance_name.eq_ignore_ascii_case(name))
        {
            row.confidence.raise(Confidence::Medium);
            if let Some(p) = reply.tcp_port {
                row.port = Some(p);
                row.tcp_connected = port_open(ev, p);
            }
            row.browse_reply = Some(reply.clone());
        }

        if !row.services.is_empty() {
            row.confidence.raise(Confidence::High);
            if let Some(engine) = row
                .services
                .iter()
                .find(|s| s.service_type == ServiceType::Engine)
            {
                row.availability = availability(engine.state);
            }
        }

        if let Some(p) = row.port {
            claimed.insert(p);
        }
        row.refresh_names();
        rows.push(row);
    }

    let default_port_open = cand.open_ports.contains(&DEFAULT_SQL_PORT);
    for &port in cand.ports.iter().filter(|p| !claimed.contains(*p)) {
        let mut row = base_row(ev, probes, timestamp);
        row.port = Some(port);
        row.confidence = Confidence::Low;
        if default_port_open {
            row.confidence.raise(Confidence::Medium);
        }
        if cand.open_ports.contains(&port) && cand.spn_ports.contains(&port) {
            row.confidence.raise(Confidence::Medium);
        }
        row.tcp_connected = port_open(ev, port);
        row.refresh_names();
        rows.push(row);
    }

    rows
}

/// Try an authenticated connection for each row, in order.
///
/// Any answer from a server forces `High`. Rows that connect successfully to an
/// already-seen `@@SERVERNAME` are dropped.
pub async fn upgrade_with_connection(
    rows: Vec<ScanReport>,
    connector: &dyn SqlConnector,
) -> Vec<ScanReport> {
    let mut identities = HashSet::<String>::new();
    let mut out = Vec::with_capacity(rows.len());

    for mut row in rows {
        let outcome = connector.connect(&SqlTarget::from_report(&row)).await;
        match outcome {
            ConnectOutcome::Connected { server_identity } => {
                row.sql_connected = true;
                row.confidence.raise(Confidence::High);
                if !identities.insert(server_identity.to_ascii_lowercase()) {
                    debug!(row = %row.full_name, %server_identity, "duplicate of an earlier row");
                    continue;
                }
            }
            ConnectOutcome::Rejected { reason } => {
                debug!(row = %row.full_name, %reason, "server answered but refused login");
                row.sql_connected = true;
                row.confidence.raise(Confidence::High);
            }
            ConnectOutcome::Unreachable { .. } => {
                row.sql_connected = false;
            }
        }
        out.push(row);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrowserReply, PortResult, ScanTarget, ServiceInfo};
    use async_trait::async_trait;

    const TS: &str = "2026-01-01T00:00:00Z";

    fn evidence(host: &str) -> InstanceEvidence {
        InstanceEvidence::for_target(ScanTarget::new(host))
    }

    fn port(host: &str, port: u16, open: bool) -> PortResult {
        PortResult {
            computer_name: host.into(),
            port,
            is_open: open,
        }
    }

    fn service(host: &str, instance: &str, ty: ServiceType, state: ServiceState) -> ServiceInfo {
        ServiceInfo {
            computer_name: host.into(),
            service_name: format!("svc-{instance}-{ty:?}"),
            instance_name: instance.into(),
            service_type: ty,
            state,
        }
    }

    fn reply(host: &str, instance: &str, tcp: Option<u16>) -> BrowserReply {
        BrowserReply {
            machine_name: host.into(),
            computer_name: host.into(),
            instance_name: instance.into(),
            sql_instance: format!("{host}\\{instance}"),
            version: "15.0.2000.5".into(),
            is_clustered: false,
            tcp_port: tcp,
        }
    }

    fn fuse_low(ev: &InstanceEvidence) -> Vec<ScanReport> {
        fuse(ev, &ProbeSet::default_set(), Confidence::Low, TS)
    }

    #[test]
    fn instance_names_merge_case_insensitively() {
        let mut ev = evidence("db");
        ev.services.push(service("db", "Sales", ServiceType::Engine, ServiceState::Running));
        ev.browser.push(reply("db", "SALES", None));
        ev.spns.push("MSSQLsvc/db.contoso.com:sales".into());
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance_name.as_deref(), Some("Sales"));
        assert_eq!(rows[0].confidence, Confidence::High);
        assert!(rows[0].browse_reply.is_some());
    }

    #[test]
    fn system_services_attach_to_every_row() {
        let mut ev = evidence("db");
        ev.services.push(service("db", "A", ServiceType::Engine, ServiceState::Running));
        ev.services.push(service("db", "B", ServiceType::Engine, ServiceState::Stopped));
        ev.services.push(service("db", "", ServiceType::Browser, ServiceState::Running));
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 2);
        for r in &rows {
            assert_eq!(r.system_services.len(), 1);
            assert_eq!(r.services.len(), 1);
        }
        assert_eq!(rows[0].availability, Availability::Available);
        assert_eq!(rows[1].availability, Availability::Unavailable);
    }

    #[test]
    fn agent_only_service_gives_unknown_availability() {
        let mut ev = evidence("db");
        ev.services.push(service("db", "X", ServiceType::Agent, ServiceState::Running));
        let rows = fuse_low(&ev);
        assert_eq!(rows[0].confidence, Confidence::High);
        assert_eq!(rows[0].availability, Availability::Unknown);
    }

    #[test]
    fn spn_named_instance_alone_is_low() {
        let mut ev = evidence("db");
        ev.spns.push("MSSQLsvc/db.contoso.com:INST2".into());
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance_name.as_deref(), Some("INST2"));
        assert_eq!(rows[0].confidence, Confidence::Low);
    }

    #[test]
    fn spn_port_corroborated_by_open_port_is_medium() {
        let mut ev = evidence("db");
        ev.ports.push(port("db", 50000, true));
        ev.spns.push("MSSQLsvc/db.contoso.com:50000".into());
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].port, Some(50000));
        assert_eq!(rows[0].confidence, Confidence::Medium);
        assert!(rows[0].tcp_connected);
    }

    #[test]
    fn uncorroborated_ports_stay_low() {
        let mut ev = evidence("db");
        ev.ports.push(port("db", 50000, true));
        ev.spns.push("MSSQLsvc/db.contoso.com:50001".into());
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.confidence == Confidence::Low));
        assert!(rows[0].tcp_connected);
        assert!(!rows[1].tcp_connected);
    }

    #[test]
    fn open_1433_raises_every_bare_port_row() {
        let mut ev = evidence("db");
        ev.ports.push(port("db", 1433, true));
        ev.ports.push(port("db", 2433, true));
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.confidence == Confidence::Medium));
    }

    #[test]
    fn browser_port_claims_bare_port_row() {
        let mut ev = evidence("db");
        ev.ports.push(port("db", 1433, true));
        ev.browser.push(reply("db", "MSSQLSERVER", Some(1433)));
        let rows = fuse_low(&ev);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sql_instance, "db");
        assert_eq!(rows[0].full_name, "db,1433");
    }

    #[test]
    fn unreachable_host_without_evidence_gives_nothing() {
        let ev = evidence("ghost");
        assert!(fuse(&ev, &ProbeSet::all(), Confidence::None, TS).is_empty());
    }

    #[test]
    fn reachable_host_without_evidence_only_at_none() {
        let mut ev = evidence("web");
        ev.ping = true;
        assert!(fuse_low(&ev).is_empty());
        let rows = fuse(&ev, &ProbeSet::all(), Confidence::None, TS);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].confidence, Confidence::None);
        assert_eq!(rows[0].instance_name, None);
        assert_eq!(rows[0].port, None);
    }

    struct Scripted(Vec<(&'static str, ConnectOutcome)>);

    #[async_trait]
    impl SqlConnector for Scripted {
        async fn connect(&self, target: &SqlTarget) -> ConnectOutcome {
            let key = target
                .instance
                .clone()
                .or_else(|| target.port.map(|p| p.to_string()))
                .unwrap_or_default();
            self.0
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, o)| o.clone())
                .unwrap_or(ConnectOutcome::Unreachable {
                    reason: "no route".into(),
                })
        }
    }

    #[tokio::test]
    async fn connection_upgrade_and_identity_dedup() {
        let rows = vec![
            tests_support::row("db", Some("PROD"), Some(1433)),
            tests_support::row("db", None, Some(1433)),
            tests_support::row("db", None, Some(2433)),
            tests_support::row("db", None, Some(3433)),
        ];
        let connector = Scripted(vec![
            (
                "PROD",
                ConnectOutcome::Connected {
                    server_identity: "DB\\PROD".into(),
                },
            ),
            (
                "1433",
                ConnectOutcome::Connected {
                    server_identity: "db\\prod".into(),
                },
            ),
            (
                "2433",
                ConnectOutcome::Rejected {
                    reason: "Login failed".into(),
                },
            ),
        ]);
        let out = upgrade_with_connection(rows, &connector).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].instance_name.as_deref(), Some("PROD"));
        assert!(out[0].sql_connected);
        assert_eq!(out[0].confidence, Confidence::High);
        assert_eq!(out[1].port, Some(2433));
        assert!(out[1].sql_connected);
        assert_eq!(out[1].confidence, Confidence::High);
        assert_eq!(out[2].port, Some(3433));
        assert!(!out[2].sql_connected);
        assert_eq!(out[2].confidence, Confidence::Low);
    }
}
