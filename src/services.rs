//! Remote enumeration of SQL Server related OS services.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::types::{Credential, ServiceInfo, ServiceState, ServiceType, DEFAULT_INSTANCE};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service enumeration timed out for {0}")]
    Timeout(String),
    #[error("failed to run {cmd}: {source}")]
    Spawn {
        cmd: &'static str,
        source: std::io::Error,
    },
    #[error("{cmd} failed for {host}: {detail}")]
    Failed {
        cmd: &'static str,
        host: String,
        detail: String,
    },
}

/// Lists SQL related services on a host.
#[async_trait]
pub trait ServiceEnumerator: Send + Sync {
    async fn list_services(
        &self,
        host: &str,
        credential: Option<&Credential>,
    ) -> Result<Vec<ServiceInfo>, ServiceError>;
}

/// Queries the Windows Service Control Manager of a remote host through `sc.exe`.
///
/// With a credential an IPC$ session is opened with `net use` first and removed afterwards.
#[derive(Debug, Clone)]
pub struct ScServiceEnumerator {
    timeout: Duration,
}

impl ScServiceEnumerator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ServiceEnumerator for ScServiceEnumerator {
    async fn list_services(
        &self,
        host: &str,
        credential: Option<&Credential>,
    ) -> Result<Vec<ServiceInfo>, ServiceError> {
        let unc = format!("\\\\{host}");
        let ipc = format!("{unc}\\IPC$");

        if let Some(c) = credential {
            let user = format!("/user:{}", c.username);
            // `*` makes `net` read the password from stdin instead of argv.
            let password = format!("{}\r\n", c.password);
            run(
                "net",
                &net_use_args(&ipc, &user),
                Some(password.as_str()),
                host,
                self.timeout,
            )
            .await?;
        }

        let res = run(
            "sc.exe",
            &[&unc, "query", "type=", "service", "state=", "all", "bufsize=", "65536"],
            None,
            host,
            self.timeout,
        )
        .await;

        if credential.is_some() {
            if let Err(e) = run("net", &["use", &ipc, "/delete", "/y"], None, host, self.timeout).await {
                debug!(host, error = %e, "failed to drop IPC$ session");
            }
        }

        let services = parse_sc_query(host, &res?);
        debug!(host, count = services.len(), "enumerated sql services");
        Ok(services)
    }
}

fn net_use_args<'a>(ipc: &'a str, user: &'a str) -> [&'a str; 4] {
    ["use", ipc, "*", user]
}

async fn run(
    cmd: &'static str,
    args: &[&str],
    input: Option<&str>,
    host: &str,
    timeout: Duration,
) -> Result<String, ServiceError> {
    let spawned = async {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
        }
        child.wait_with_output().await
    };
    let out = time::timeout(timeout, spawned)
        .await
        .map_err(|_| ServiceError::Timeout(host.to_string()))?
        .map_err(|source| ServiceError::Spawn { cmd, source })?;
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(ServiceError::Failed {
            cmd,
            host: host.to_string(),
            detail,
        });
    }
    Ok(stdout)
}

/// Parse `sc query` output, keeping only SQL Server services.
pub fn parse_sc_query(host: &str, output: &str) -> Vec<ServiceInfo> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines().map(str::trim) {
        if let Some(name) = field(line, "SERVICE_NAME") {
            current = Some(name.to_string());
        } else if let Some(state) = field(line, "STATE") {
            let Some(name) = current.take() else { continue };
            if let Some((service_type, instance_name)) = classify_service(&name) {
                out.push(ServiceInfo {
                    computer_name: host.to_string(),
                    service_name: name,
                    instance_name,
                    service_type,
                    state: parse_state(state),
                });
            }
        }
    }
    out
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
}

// "4  RUNNING" -> Running
fn parse_state(value: &str) -> ServiceState {
    let word = value.split_whitespace().nth(1).unwrap_or("");
    match word.to_ascii_uppercase().as_str() {
        "RUNNING" => ServiceState::Running,
        "STOPPED" => ServiceState::Stopped,
        "PAUSED" => ServiceState::Paused,
        "START_PENDING" => ServiceState::StartPending,
        "STOP_PENDING" => ServiceState::StopPending,
        _ => ServiceState::Unknown,
    }
}

/// Map a Windows service name to its SQL Server service type and instance name.
///
/// Default-instance services get `MSSQLSERVER`; host-wide services get an empty instance name.
/// Returns `None` for services unrelated to SQL Server.
pub fn classify_service(name: &str) -> Option<(ServiceType, String)> {
    let upper = name.to_ascii_uppercase();
    let (base, instance) = match upper.split_once('$') {
        Some((b, _)) => (b.to_string(), name[b.len() + 1..].to_string()),
        None => (upper.clone(), String::new()),
    };
    let named = !instance.is_empty();
    let default_or = |inst: String| if named { inst } else { DEFAULT_INSTANCE.to_string() };

    let classified = match base.as_str() {
        "MSSQLSERVER" if !named => (ServiceType::Engine, DEFAULT_INSTANCE.to_string()),
        "MSSQL" if named => (ServiceType::Engine, instance),
        "SQLSERVERAGENT" if !named => (ServiceType::Agent, DEFAULT_INSTANCE.to_string()),
        "SQLAGENT" if named => (ServiceType::Agent, instance),
        "SQLBROWSER" => (ServiceType::Browser, String::new()),
        "SQLWRITER" => (ServiceType::Writer, String::new()),
        "MSSQLFDLAUNCHER" => (ServiceType::FullText, default_or(instance)),
        "REPORTSERVER" => (ServiceType::ReportingServices, default_or(instance)),
        "SQLSERVERREPORTINGSERVICES" => (ServiceType::ReportingServices, DEFAULT_INSTANCE.to_string()),
        "MSSQLSERVEROLAPSERVICE" if !named => (ServiceType::AnalysisServices, DEFAULT_INSTANCE.to_string()),
        "MSOLAP" if named => (ServiceType::AnalysisServices, instance),
        "SQLTELEMETRY" => (ServiceType::Telemetry, default_or(instance)),
        "MSSQLLAUNCHPAD" => (ServiceType::Launchpad, default_or(instance)),
        b if b.starts_with("MSDTSSERVER") => (ServiceType::IntegrationServices, String::new()),
        _ => return None,
    };
    Some(classified)
}
