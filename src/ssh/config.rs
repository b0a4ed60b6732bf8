//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Default SSH port used when a target omits one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH connection configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// Handshake timeout in milliseconds (TCP connect + key exchange + auth)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_timeout_ms() -> u64 {
    1000
}

impl SshConfig {
    /// Build a config from a `host[:port]` target string
    pub fn from_target(
        target: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, SshError> {
        let (host, port) = parse_host_port(target, DEFAULT_SSH_PORT)?;
        Ok(Self {
            host,
            port,
            username: username.into(),
            password: password.into(),
            timeout_ms: default_timeout_ms(),
        })
    }

    /// Set the handshake timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `host:port` for logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Never print the password
impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Split `host[:port]` into its parts.
///
/// Accepts hostnames, IPv4 literals, bracketed IPv6 (`[::1]:53`) and bare
/// IPv6 literals (which never carry a port). A missing port yields
/// `default_port`.
pub fn parse_host_port(input: &str, default_port: u16) -> Result<(String, u16), SshError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SshError::InvalidAddress("empty address".into()));
    }

    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| SshError::InvalidAddress(format!("unterminated '[' in {}", input)))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p),
            None if tail.is_empty() => None,
            None => {
                return Err(SshError::InvalidAddress(format!(
                    "unexpected characters after ']' in {}",
                    input
                )))
            }
        };
        (host, port)
    } else {
        match input.matches(':').count() {
            0 => (input, None),
            1 => {
                let (h, p) = input.split_once(':').unwrap_or((input, ""));
                (h, Some(p))
            }
            // bare IPv6 literal
            _ => (input, None),
        }
    };

    if host.is_empty() {
        return Err(SshError::InvalidAddress(format!("missing host in {}", input)));
    }

    let port = match port {
        None => default_port,
        Some(p) => match p.parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(SshError::InvalidAddress(format!("invalid port in {}", input)))
            }
            Ok(p) => p,
        },
    };

    Ok((host.to_string(), port))
}
