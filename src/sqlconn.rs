//! Authenticated connection probe.

use async_trait::async_trait;
use std::time::Duration;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::debug;

use crate::types::{Credential, ScanReport, DEFAULT_INSTANCE};

/// Highest server error class still treated as "a server answered and refused".
const MAX_REJECT_CLASS: u8 = 16;

/// Address of one instance to log in to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTarget {
    pub host: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
}

impl SqlTarget {
    pub fn from_report(row: &ScanReport) -> Self {
        Self {
            host: row.machine_name.clone(),
            instance: row
                .instance_name
                .clone()
                .filter(|i| !i.eq_ignore_ascii_case(DEFAULT_INSTANCE)),
            port: row.port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Logged in; carries `@@SERVERNAME`.
    Connected { server_identity: String },
    /// A server answered but refused (login failed, permission denied, ...).
    Rejected { reason: String },
    /// No server could be reached.
    Unreachable { reason: String },
}

impl ConnectOutcome {
    pub fn reached_server(&self) -> bool {
        !matches!(self, ConnectOutcome::Unreachable { .. })
    }
}

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, target: &SqlTarget) -> ConnectOutcome;
}

/// TDS connector built on tiberius.
#[derive(Debug, Clone)]
pub struct TiberiusConnector {
    credential: Option<Credential>,
    timeout: Duration,
}

impl TiberiusConnector {
    pub fn new(credential: Option<Credential>, timeout: Duration) -> Self {
        Self {
            credential,
            timeout,
        }
    }

    fn config(&self, target: &SqlTarget) -> Config {
        let mut config = Config::new();
        config.host(&target.host);
        if let Some(port) = target.port {
            config.port(port);
        } else if let Some(instance) = &target.instance {
            config.instance_name(instance);
        }
        config.application_name("sql-scan-rs");
        config.trust_cert();
        match &self.credential {
            Some(c) => config.authentication(AuthMethod::sql_server(&c.username, &c.password)),
            None => default_auth(&mut config),
        }
        config
    }

    async fn try_connect(&self, target: &SqlTarget) -> Result<String, ConnectFailure> {
        let config = self.config(target);
        let tcp = if target.port.is_none() && target.instance.is_some() {
            TcpStream::connect_named(&config).await?
        } else {
            TcpStream::connect(config.get_addr()).await?
        };
        tcp.set_nodelay(true)?;

        let mut client = Client::connect(config, tcp.compat_write()).await?;
        let identity = client
            .simple_query("SELECT @@SERVERNAME")
            .await?
            .into_row()
            .await?
            .and_then(|row| row.get::<&str, _>(0).map(str::to_string))
            .unwrap_or_else(|| target.host.clone());
        if let Err(e) = client.close().await {
            debug!(error = %e, "closing sql connection failed");
        }
        Ok(identity)
    }
}

#[cfg(windows)]
fn default_auth(config: &mut Config) {
    config.authentication(AuthMethod::Integrated);
}

// Without integrated auth an empty SQL login still distinguishes "answered" from "unreachable".
#[cfg(not(windows))]
fn default_auth(config: &mut Config) {
    config.authentication(AuthMethod::sql_server("", ""));
}

enum ConnectFailure {
    Io(std::io::Error),
    Tds(TdsError),
}

impl From<std::io::Error> for ConnectFailure {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<TdsError> for ConnectFailure {
    fn from(e: TdsError) -> Self {
        Self::Tds(e)
    }
}

#[async_trait]
impl SqlConnector for TiberiusConnector {
    async fn connect(&self, target: &SqlTarget) -> ConnectOutcome {
        let outcome = match time::timeout(self.timeout, self.try_connect(target)).await {
            Err(_) => ConnectOutcome::Unreachable {
                reason: "connection timed out".into(),
            },
            Ok(Ok(server_identity)) => ConnectOutcome::Connected { server_identity },
            Ok(Err(ConnectFailure::Io(e))) => ConnectOutcome::Unreachable {
                reason: e.to_string(),
            },
            Ok(Err(ConnectFailure::Tds(e))) => classify_error(&e),
        };
        debug!(host = %target.host, instance = ?target.instance, port = ?target.port, ?outcome, "sql connect");
        outcome
    }
}

/// Split TDS failures into "a server answered" and "nothing answered".
pub fn classify_error(e: &TdsError) -> ConnectOutcome {
    match e {
        TdsError::Server(token) => server_error_outcome(token.class(), token.message()),
        TdsError::Routing { host, port } => ConnectOutcome::Rejected {
            reason: format!("routed to {host}:{port}"),
        },
        other => ConnectOutcome::Unreachable {
            reason: other.to_string(),
        },
    }
}

/// Server error tokens at or below class 16 are user-correctable refusals.
pub fn server_error_outcome(class: u8, message: &str) -> ConnectOutcome {
    if class <= MAX_REJECT_CLASS {
        ConnectOutcome::Rejected {
            reason: message.to_string(),
        }
    } else {
        ConnectOutcome::Unreachable {
            reason: format!("severity {class}: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_failure_is_rejected() {
        let o = server_error_outcome(14, "Login failed for user 'probe'.");
        assert!(matches!(o, ConnectOutcome::Rejected { .. }));
        assert!(o.reached_server());
    }

    #[test]
    fn fatal_severity_is_unreachable() {
        let o = server_error_outcome(20, "fatal");
        assert!(!o.reached_server());
    }

    #[test]
    fn io_errors_are_unreachable() {
        let e = TdsError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!classify_error(&e).reached_server());
    }

    #[test]
    fn routing_means_a_server_answered() {
        let e = TdsError::Routing {
            host: "replica".into(),
            port: 1433,
        };
        assert!(classify_error(&e).reached_server());
    }

    #[test]
    fn default_instance_not_passed_as_name() {
        let row = crate::fusion::tests_support::row("SQL01", Some("MSSQLSERVER"), None);
        let t = SqlTarget::from_report(&row);
        assert_eq!(t.instance, None);
        let row = crate::fusion::tests_support::row("SQL01", Some("PROD"), Some(50000));
        let t = SqlTarget::from_report(&row);
        assert_eq!(t.instance.as_deref(), Some("PROD"));
        assert_eq!(t.port, Some(50000));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let c = TiberiusConnector::new(None, Duration::from_secs(2));
        let outcome = c
            .connect(&SqlTarget {
                host: "127.0.0.1".into(),
                instance: None,
                port: Some(port),
            })
            .await;
        assert!(!outcome.reached_server());
    }
}
