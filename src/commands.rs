//! Boundary request/response types
//!
//! These cross the process boundary as JSON (camelCase), so failures are
//! reported in-band as `{result: false, message}` rather than as errors.

use serde::{Deserialize, Serialize};

use crate::forwarding::TunnelType;

/// Request to open a new SSH connection
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnectParams {
    /// Caller-chosen id; a UUID v4 is generated when absent
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Bastion connection id to chain through
    #[serde(default)]
    pub via: Option<String>,
    /// `host[:port]`
    pub target: String,
    pub username: String,
    pub password: String,
    /// Register before the first attempt and keep retrying if it fails
    #[serde(default)]
    pub force: bool,
}

impl std::fmt::Debug for NewConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewConnectParams")
            .field("connection_id", &self.connection_id)
            .field("via", &self.via)
            .field("target", &self.target)
            .field("username", &self.username)
            .field("force", &self.force)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub result: bool,
    pub message: String,
    pub connection_id: String,
}

impl ConnectResult {
    pub fn ok(connection_id: impl Into<String>) -> Self {
        Self {
            result: true,
            message: String::new(),
            connection_id: connection_id.into(),
        }
    }

    pub fn failed(message: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            connection_id: connection_id.into(),
        }
    }
}

/// Request to start a tunnel on an existing connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTunnelParams {
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    /// Owning connection id
    pub via: String,
    pub name: String,
    /// `host:port`, required for tcp tunnels
    #[serde(default)]
    pub target: Option<String>,
    /// 0 picks an ephemeral port
    #[serde(default)]
    pub local_port: u16,
    /// `host[:port]` of a DNS server reachable from the SSH server
    #[serde(default)]
    pub dns_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTunnelResult {
    pub result: bool,
    pub message: String,
    /// Bound port, -1 on failure
    pub local_port: i32,
}

impl AddTunnelResult {
    pub fn ok(local_port: u16) -> Self {
        Self {
            result: true,
            message: String::new(),
            local_port: local_port as i32,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            local_port: -1,
        }
    }
}
