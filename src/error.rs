use thiserror::Error;

/// Request-level validation errors. Any of these halts a run before scanning starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid IP address: {0}")]
    InvalidIp(String),
    #[error("invalid IP range: {0}")]
    InvalidRange(String),
    #[error("invalid CIDR prefix /{0}: must be between /8 and /31")]
    InvalidCidr(u8),
    #[error("invalid subnet mask: {0}")]
    InvalidMask(String),
    #[error("invalid port list: {0}")]
    InvalidPorts(String),
    #[error("no discovery type and no explicit host list given")]
    NothingToScan,
}

/// Failure of a single probe against a single host. Callers degrade these to "no evidence".
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{probe} timed out for {host}")]
    Timeout { probe: &'static str, host: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed reply: {0}")]
    Malformed(String),
}
