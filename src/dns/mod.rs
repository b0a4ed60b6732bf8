//! DNS over the SSH tunnel
//!
//! Hostnames requested by SOCKS5 clients are resolved by the remote side:
//! a DNS-over-TCP exchange is carried on a forwarded channel to a DNS
//! server reachable from the SSH server.

pub mod message;
pub mod resolver;

pub use message::{DnsAnswer, DnsResponse};
pub use resolver::{exchange, lookup_address, resolve_over_tunnel, DEFAULT_DNS_PORT};

use thiserror::Error;

use crate::ssh::SshError;

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Invalid hostname: {0}")]
    InvalidName(String),

    #[error("Invalid DNS server address: {0}")]
    InvalidServer(String),

    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    #[error("Empty DNS response")]
    EmptyResponse,

    #[error("No address found for {0}")]
    NoAnswer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] SshError),
}
