//! SQL Server Resolution Protocol (SSRP) client.
//!
//! The Browser service listens on UDP 1434. A one-byte request is answered with a
//! `SVR_RESP` datagram: `0x05`, a little-endian u16 payload length, then ASCII records
//! of the form `ServerName;H;InstanceName;I;IsClustered;No;Version;V;tcp;1433;;`.

use regex::Regex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::ProbeError;
use crate::types::{BrowserReply, DEFAULT_INSTANCE};

pub const SSRP_PORT: u16 = 1434;

const CLNT_BCAST_EX: u8 = 0x02;
const CLNT_UCAST_EX: u8 = 0x03;
const SVR_RESP: u8 = 0x05;

fn record_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"ServerName;([^;]*);InstanceName;([^;]*);IsClustered;([^;]*);Version;([^;]*);?",
        )
        .expect("static regex")
    })
}

fn tcp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|;)tcp;(\d+)(?:;|$)").expect("static regex"))
}

/// Strip the `SVR_RESP` header if present.
fn payload(data: &[u8]) -> &[u8] {
    if data.len() >= 3 && data[0] == SVR_RESP {
        &data[3..]
    } else {
        data
    }
}

/// Parse one SSRP reply into its instance records.
///
/// `machine` is the host the reply came from; malformed records are skipped.
pub fn parse_reply(machine: &str, data: &[u8]) -> Vec<BrowserReply> {
    let text = String::from_utf8_lossy(payload(data));
    text.split(";;")
        .filter_map(|record| parse_record(machine, record.trim_matches(|c: char| c == ';' || c.is_whitespace() || c == '\0')))
        .collect()
}

fn parse_record(machine: &str, record: &str) -> Option<BrowserReply> {
    let caps = record_re().captures(record)?;
    let computer_name = caps[1].to_string();
    let instance_name = caps[2].to_string();
    if computer_name.is_empty() || instance_name.is_empty() {
        return None;
    }
    let tcp_port = tcp_re()
        .captures(record)
        .and_then(|c| c[1].parse::<u16>().ok());
    let sql_instance = if instance_name.eq_ignore_ascii_case(DEFAULT_INSTANCE) {
        computer_name.clone()
    } else {
        format!("{computer_name}\\{instance_name}")
    };
    Some(BrowserReply {
        machine_name: machine.to_string(),
        computer_name,
        sql_instance,
        is_clustered: caps[3].eq_ignore_ascii_case("yes"),
        version: caps[4].to_string(),
        instance_name,
        tcp_port,
    })
}

/// Ask the Browser service on `host` for its instances (`CLNT_UCAST_EX`).
pub async fn probe_browser(host: &str, timeout: Duration) -> Result<Vec<BrowserReply>, ProbeError> {
    let addr = lookup_host((host, SSRP_PORT))
        .await?
        .next()
        .ok_or_else(|| ProbeError::Malformed(format!("no address for {host}")))?;
    probe_browser_at(addr, host, timeout).await
}

/// Unicast probe against an explicit socket address.
pub async fn probe_browser_at(
    addr: SocketAddr,
    machine: &str,
    timeout: Duration,
) -> Result<Vec<BrowserReply>, ProbeError> {
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.send_to(&[CLNT_UCAST_EX], addr).await?;

    let mut buf = vec![0u8; 65_535];
    let (n, _) = time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| ProbeError::Timeout {
            probe: "browser",
            host: machine.to_string(),
        })??;
    let replies = parse_reply(machine, &buf[..n]);
    debug!(host = machine, instances = replies.len(), "browser reply");
    Ok(replies)
}

/// Broadcast `CLNT_BCAST_EX` on the local segment and collect every reply until `window` elapses.
pub async fn enumerate_broadcast(window: Duration) -> Result<Vec<BrowserReply>, ProbeError> {
    enumerate_at((Ipv4Addr::BROADCAST, SSRP_PORT).into(), window).await
}

pub async fn enumerate_at(addr: SocketAddr, window: Duration) -> Result<Vec<BrowserReply>, ProbeError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(&[CLNT_BCAST_EX], addr).await?;

    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; 65_535];
    let mut out = Vec::new();
    loop {
        match time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => out.extend(parse_reply(&from.ip().to_string(), &buf[..n])),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }
    debug!(instances = out.len(), "browser broadcast finished");
    Ok(out)
}
