//! Directory (Active Directory over LDAP) lookups: SPN sweeps, server sweeps and per-host SPN lists.

use async_trait::async_trait;
use indexmap::IndexSet;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Scope, SearchEntry};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Credential;

const SPN_SERVICE_CLASS: &str = "MSSQLsvc";
const ATTRS: [&str; 3] = ["name", "dNSHostName", "servicePrincipalName"];
/// Below AD's default MaxPageSize of 1000.
const PAGE_SIZE: i32 = 500;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no directory controller given and no domain found in USERDNSDOMAIN")]
    NoController,
    #[error("directory has no default naming context")]
    NoNamingContext,
    #[error("ldap error: {0}")]
    Ldap(#[from] ldap3::LdapError),
}

/// One directory object with the attributes discovery cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    pub name: String,
    pub dns_host_name: Option<String>,
    pub spns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryQuery {
    /// Objects exposing `MSSQLsvc*` SPNs, optionally restricted to one host.
    Spn { host: Option<String> },
    /// Enabled computer objects running a Windows Server OS.
    Servers,
}

impl DirectoryQuery {
    pub fn ldap_filter(&self) -> String {
        match self {
            DirectoryQuery::Spn { host: None } => {
                format!("(servicePrincipalName={SPN_SERVICE_CLASS}*)")
            }
            DirectoryQuery::Spn { host: Some(h) } => {
                let short = h.split('.').next().unwrap_or(h);
                format!(
                    "(&(servicePrincipalName={SPN_SERVICE_CLASS}*)(|(name={})(dNSHostName={})))",
                    ldap_escape(short),
                    ldap_escape(h)
                )
            }
            DirectoryQuery::Servers => "(&(objectCategory=computer)\
                 (!(userAccountControl:1.2.840.113556.1.4.803:=2))\
                 (operatingSystem=*windows*server*))"
                .to_string(),
        }
    }
}

/// Directory service able to produce a bound session.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn bind(
        &self,
        controller: Option<&str>,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn BoundDirectory>, DirectoryError>;
}

#[async_trait]
pub trait BoundDirectory: Send {
    async fn search(&mut self, query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn close(self: Box<Self>);
}

/// LDAP-backed directory client.
#[derive(Debug, Clone)]
pub struct LdapDirectory {
    timeout: Duration,
}

impl LdapDirectory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LdapDirectory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

struct LdapSession {
    ldap: Ldap,
    base: String,
    timeout: Duration,
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn bind(
        &self,
        controller: Option<&str>,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn BoundDirectory>, DirectoryError> {
        let server = controller
            .map(str::to_string)
            .or_else(|| std::env::var("USERDNSDOMAIN").ok())
            .filter(|s| !s.trim().is_empty())
            .ok_or(DirectoryError::NoController)?;
        let url = if server.contains("://") {
            server
        } else {
            format!("ldap://{server}")
        };

        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "ldap connection closed with error");
            }
        });

        if let Some(c) = credential {
            ldap.with_timeout(self.timeout)
                .simple_bind(&c.username, &c.password)
                .await?
                .success()?;
        }

        let (rs, _) = ldap
            .with_timeout(self.timeout)
            .search("", Scope::Base, "(objectClass=*)", vec!["defaultNamingContext"])
            .await?
            .success()?;
        let base = rs
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .and_then(|e| first_attr(&e.attrs, "defaultNamingContext"))
            .ok_or(DirectoryError::NoNamingContext)?;
        debug!(%url, %base, "bound to directory");

        Ok(Box::new(LdapSession {
            ldap,
            base,
            timeout: self.timeout,
        }))
    }
}

#[async_trait]
impl BoundDirectory for LdapSession {
    async fn search(&mut self, query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let filter = query.ldap_filter();
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(PAGE_SIZE)),
        ];
        let mut stream = self
            .ldap
            .with_timeout(self.timeout)
            .streaming_search_with(adapters, &self.base, Scope::Subtree, &filter, ATTRS.to_vec())
            .await?;

        let mut entries = Vec::new();
        while let Some(raw) = stream.next().await? {
            entries.push(entry_from(SearchEntry::construct(raw)));
        }
        accept_search_result(stream.finish().await, entries.len())?;
        debug!(%filter, count = entries.len(), "directory search");
        Ok(entries)
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(error = %e, "ldap unbind failed");
        }
    }
}

fn entry_from(e: SearchEntry) -> DirectoryEntry {
    DirectoryEntry {
        name: first_attr(&e.attrs, "name").unwrap_or_default(),
        dns_host_name: first_attr(&e.attrs, "dNSHostName"),
        spns: all_attr(&e.attrs, "servicePrincipalName"),
    }
}

/// Final status of a search. A size-limit hit keeps what was already received.
fn accept_search_result(res: LdapResult, received: usize) -> Result<(), DirectoryError> {
    if res.rc == RC_SIZE_LIMIT_EXCEEDED {
        warn!(received, "directory size limit reached; keeping partial results");
        return Ok(());
    }
    res.success()?;
    Ok(())
}

// AD returns attribute names in schema case; lookups are case-insensitive.
fn all_attr(attrs: &HashMap<String, Vec<String>>, key: &str) -> Vec<String> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn first_attr(attrs: &HashMap<String, Vec<String>>, key: &str) -> Option<String> {
    all_attr(attrs, key).into_iter().next().filter(|s| !s.is_empty())
}

/// What follows the `:` in an SPN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpnSuffix {
    Port(u16),
    Instance(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spn {
    pub host: String,
    pub suffix: SpnSuffix,
}

/// Parse `MSSQLsvc/<host>[:<port-or-instance>]`. Other service classes yield `None`.
pub fn parse_spn(spn: &str) -> Option<Spn> {
    let (class, rest) = spn.trim().split_once('/')?;
    if !class.eq_ignore_ascii_case(SPN_SERVICE_CLASS) || rest.is_empty() {
        return None;
    }
    let (host, suffix) = match rest.split_once(':') {
        Some((h, s)) if !s.is_empty() => match s.parse::<u16>() {
            Ok(p) => (h, SpnSuffix::Port(p)),
            Err(_) => (h, SpnSuffix::Instance(s.to_string())),
        },
        Some((h, _)) => (h, SpnSuffix::None),
        None => (rest, SpnSuffix::None),
    };
    Some(Spn {
        host: host.to_string(),
        suffix,
    })
}

/// Host names from an SPN sweep: DNS host name, else the SPN host segment, else the object name.
pub fn spn_hosts(entries: &[DirectoryEntry]) -> Vec<String> {
    let mut out = IndexSet::new();
    for e in entries {
        let host = e
            .dns_host_name
            .clone()
            .or_else(|| e.spns.iter().find_map(|s| parse_spn(s)).map(|s| s.host))
            .unwrap_or_else(|| e.name.clone());
        if !host.is_empty() {
            out.insert(host);
        }
    }
    out.into_iter().collect()
}

/// Host names from a server sweep: DNS host name, else object name.
pub fn server_hosts(entries: &[DirectoryEntry]) -> Vec<String> {
    let mut out = IndexSet::new();
    for e in entries {
        let host = e.dns_host_name.clone().unwrap_or_else(|| e.name.clone());
        if !host.is_empty() {
            out.insert(host);
        }
    }
    out.into_iter().collect()
}

/// Raw `MSSQLsvc` SPN strings across all entries.
pub fn raw_spns(entries: &[DirectoryEntry]) -> Vec<String> {
    let mut out = IndexSet::new();
    for e in entries {
        out.extend(e.spns.iter().filter(|s| parse_spn(s).is_some()).cloned());
    }
    out.into_iter().collect()
}

async fn run_query(
    dir: &dyn Directory,
    controller: Option<&str>,
    credential: Option<&Credential>,
    query: DirectoryQuery,
) -> Result<Vec<DirectoryEntry>, DirectoryError> {
    let mut session = dir.bind(controller, credential).await?;
    let res = session.search(&query).await;
    session.close().await;
    res
}

/// Every host in the directory that registers a SQL Server SPN.
pub async fn sweep_spn_hosts(
    dir: &dyn Directory,
    controller: Option<&str>,
    credential: Option<&Credential>,
) -> Result<Vec<String>, DirectoryError> {
    let entries = run_query(dir, controller, credential, DirectoryQuery::Spn { host: None }).await?;
    Ok(spn_hosts(&entries))
}

/// Every enabled Windows Server computer object.
pub async fn sweep_servers(
    dir: &dyn Directory,
    controller: Option<&str>,
    credential: Option<&Credential>,
) -> Result<Vec<String>, DirectoryError> {
    let entries = run_query(dir, controller, credential, DirectoryQuery::Servers).await?;
    Ok(server_hosts(&entries))
}

/// Raw SQL Server SPNs registered for one host.
pub async fn host_spns(
    dir: &dyn Directory,
    host: &str,
    controller: Option<&str>,
    credential: Option<&Credential>,
) -> Result<Vec<String>, DirectoryError> {
    let query = DirectoryQuery::Spn {
        host: Some(host.to_string()),
    };
    let entries = run_query(dir, controller, credential, query).await?;
    Ok(raw_spns(&entries))
}
