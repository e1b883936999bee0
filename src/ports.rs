use crate::error::ConfigError;
use crate::types::DEFAULT_SQL_PORT;
use anyhow::{Context, Result};
use indexmap::IndexSet;
use std::fs;
use std::path::Path;

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Entries may be separated by commas or newlines:
/// - single port: `1433`
/// - inclusive range: `14330-14339`
/// - everything after `#` on a line is ignored
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>, ConfigError> {
    let mut out = IndexSet::<u16>::new();

    for raw_line in s.lines() {
        let line = raw_line.split('#').next().unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            match item.split_once('-') {
                Some((a, b)) => {
                    let start = parse_port(a)?;
                    let end = parse_port(b)?;
                    if start > end {
                        return Err(ConfigError::InvalidPorts(format!(
                            "{start}-{end} (start > end)"
                        )));
                    }
                    out.extend(start..=end);
                }
                None => {
                    out.insert(parse_port(item)?);
                }
            }
        }
    }

    Ok(out.into_iter().collect())
}

/// Load a port list from a file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    let ports = parse_port_spec(&content)
        .with_context(|| format!("invalid ports file: {}", path.as_ref().display()))?;
    Ok(ports)
}

/// Ports probed when the caller does not give any.
pub fn default_ports() -> Vec<u16> {
    vec![DEFAULT_SQL_PORT]
}

fn parse_port(s: &str) -> Result<u16, ConfigError> {
    let s = s.trim();
    match s.parse::<u32>() {
        Ok(v) if (1..=65535).contains(&v) => Ok(v as u16),
        _ => Err(ConfigError::InvalidPorts(format!("port out of range: {s}"))),
    }
}
