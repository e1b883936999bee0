//! Library crate for sql-scan-rs: multi-source SQL Server instance discovery.
pub mod browser;
pub mod config;
pub mod directory;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod netdetect;
pub mod ports;
pub mod probes;
pub mod scanner;
pub mod server;
pub mod services;
pub mod sqlconn;
pub mod targets;
pub mod types;
