//! Tunnel lifecycle
//!
//! A `Tunnel` owns a bound local listener and the task serving it. The
//! listener task runs until the tunnel is closed; closing cancels the
//! accept loop and every in-flight client of that tunnel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{dynamic, local};
use crate::dns::DEFAULT_DNS_PORT;
use crate::ssh::config::parse_host_port;
use crate::ssh::{HandleController, SshError};

/// Where a tunnel gets its session from at the time a client arrives.
///
/// The owning connection may reconnect while the tunnel stays up, so the
/// controller is looked up per client rather than captured once.
pub trait SessionSource: Send + Sync {
    /// Controller for the live session, `None` while not connected
    fn current_session(&self) -> Option<HandleController>;
}

impl SessionSource for HandleController {
    fn current_session(&self) -> Option<HandleController> {
        self.is_connected().then(|| self.clone())
    }
}

/// Tunnel type as named at the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    #[serde(alias = "socksv5")]
    Socks5,
}

/// What a tunnel does with accepted clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelKind {
    /// Forward every client to a fixed remote target
    Tcp { host: String, port: u16 },
    /// SOCKS5 proxy; hostnames are resolved through `dns_server` when set,
    /// otherwise handed to the SSH server as-is
    Socks5 { dns_server: Option<String> },
}

impl TunnelKind {
    /// Validate boundary parameters into a tunnel kind
    pub fn from_params(
        tunnel_type: TunnelType,
        target: Option<&str>,
        dns_server: Option<&str>,
    ) -> Result<Self, SshError> {
        match tunnel_type {
            TunnelType::Tcp => {
                let target = target
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| SshError::InvalidAddress("tcp tunnel requires a target".into()))?;
                let (host, port) = parse_host_port(target, 0)?;
                if port == 0 {
                    return Err(SshError::InvalidAddress(format!(
                        "missing port in target {}",
                        target
                    )));
                }
                Ok(TunnelKind::Tcp { host, port })
            }
            TunnelType::Socks5 => {
                let dns_server = match dns_server.map(str::trim).filter(|s| !s.is_empty()) {
                    Some(server) => {
                        parse_host_port(server, DEFAULT_DNS_PORT)?;
                        Some(server.to_string())
                    }
                    None => None,
                };
                Ok(TunnelKind::Socks5 { dns_server })
            }
        }
    }

    pub fn tunnel_type(&self) -> TunnelType {
        match self {
            TunnelKind::Tcp { .. } => TunnelType::Tcp,
            TunnelKind::Socks5 { .. } => TunnelType::Socks5,
        }
    }
}

/// Bind a local listener, mapping failures to `BindFailed`
pub async fn bind_listener(bind_host: &str, local_port: u16) -> Result<TcpListener, SshError> {
    let addr = if bind_host.contains(':') {
        format!("[{}]:{}", bind_host, local_port)
    } else {
        format!("{}:{}", bind_host, local_port)
    };

    TcpListener::bind(&addr).await.map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::AddrInUse => "port already in use".to_string(),
            std::io::ErrorKind::PermissionDenied => {
                "permission denied (ports below 1024 require elevated privileges)".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "address not available on this system".to_string()
            }
            _ => e.to_string(),
        };
        SshError::BindFailed { addr, reason }
    })
}

/// A running tunnel
pub struct Tunnel {
    name: String,
    owner_id: String,
    kind: TunnelKind,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    closed: AtomicBool,
}

impl Tunnel {
    /// Bind the listener and start serving it
    pub async fn start(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        kind: TunnelKind,
        bind_host: &str,
        local_port: u16,
        source: Arc<dyn SessionSource>,
    ) -> Result<Arc<Self>, SshError> {
        let listener = bind_listener(bind_host, local_port).await?;
        let local_addr = listener.local_addr()?;

        let tunnel = Arc::new(Self {
            name: name.into(),
            owner_id: owner_id.into(),
            kind,
            local_addr,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        info!(
            "Tunnel '{}' ({:?}) listening on {} for connection {}",
            tunnel.name,
            tunnel.kind.tunnel_type(),
            local_addr,
            tunnel.owner_id
        );

        let shutdown = tunnel.shutdown.clone();
        let stopped = tunnel.stopped.clone();
        let name = tunnel.name.clone();
        match &tunnel.kind {
            TunnelKind::Tcp { host, port } => {
                let (host, port) = (host.clone(), *port);
                tokio::spawn(async move {
                    local::run_tcp_forward(listener, source, host, port, shutdown).await;
                    info!("Tunnel '{}' listener closed", name);
                    stopped.cancel();
                });
            }
            TunnelKind::Socks5 { dns_server } => {
                let dns_server = dns_server.clone();
                tokio::spawn(async move {
                    dynamic::run_socks5_proxy(listener, source, dns_server, shutdown).await;
                    info!("Tunnel '{}' listener closed", name);
                    stopped.cancel();
                });
            }
        }

        Ok(tunnel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn kind(&self) -> &TunnelKind {
        &self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and tear down in-flight clients.
    ///
    /// Returns `true` only for the call that actually closed the tunnel.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Closing tunnel '{}' on {}", self.name, self.local_addr);
        self.shutdown.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the listener task has exited and the port is released
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name)
            .field("owner_id", &self.owner_id)
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
