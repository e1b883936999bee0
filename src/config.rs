use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Confidence, Credential, ProbeSet, DEFAULT_SQL_PORT};

/// Knobs for one discovery run. Shared by the CLI and the HTTP API.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScanOptions {
    pub probes: ProbeSet,
    pub ports: Vec<u16>,
    pub min_confidence: Confidence,
    pub tcp_timeout_ms: u64,
    pub browser_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub service_timeout_ms: u64,
    /// Max hosts scanned at once.
    pub concurrency: usize,
    /// Windows/directory credential for SPN lookups and service enumeration.
    pub credential: Option<Credential>,
    /// SQL login for the authenticated connection probe.
    pub sql_credential: Option<Credential>,
    pub domain_controller: Option<String>,
    /// Surface Browser probe socket errors instead of swallowing them.
    pub strict_browser_errors: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            probes: ProbeSet::default_set(),
            ports: vec![DEFAULT_SQL_PORT],
            min_confidence: Confidence::Low,
            tcp_timeout_ms: 1_000,
            browser_timeout_ms: 2_000,
            ping_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
            service_timeout_ms: 15_000,
            concurrency: 32,
            credential: None,
            sql_credential: None,
            domain_controller: None,
            strict_browser_errors: false,
        }
    }
}

impl ScanOptions {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    /// Port list actually probed: the caller's list, or 1433 when empty.
    pub fn effective_ports(&self) -> Vec<u16> {
        if self.ports.is_empty() {
            vec![DEFAULT_SQL_PORT]
        } else {
            self.ports.clone()
        }
    }
}
