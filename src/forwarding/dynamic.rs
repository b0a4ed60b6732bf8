//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination
//!
//! Only the CONNECT command with the "no authentication" method is served.
//! Hostnames are resolved on the far side of the tunnel, either through a
//! configured DNS server (DNS over TCP on a forwarded channel) or by the
//! SSH server itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::splice::splice;
use super::tunnel::SessionSource;
use crate::dns;
use crate::ssh::HandleController;

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 session errors, each scoped to a single client
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("Unsupported SOCKS version: {0}")]
    BadVersion(u8),

    #[error("Client doesn't support NO AUTH method")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS5 command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Resolution of {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: dns::DnsError,
    },

    #[error("Forward-out to {host}:{port} failed: {reason}")]
    Forward {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Socks5Error {
    /// Reply code sent before closing, if the protocol has reached the
    /// request phase
    fn reply_code(&self) -> Option<u8> {
        match self {
            Socks5Error::UnsupportedCommand(_) => Some(socks5::REP_CMD_NOT_SUPPORTED),
            Socks5Error::UnsupportedAddressType(_) => Some(socks5::REP_ADDR_NOT_SUPPORTED),
            Socks5Error::Resolve { .. } | Socks5Error::Forward { .. } => {
                Some(socks5::REP_HOST_UNREACHABLE)
            }
            _ => None,
        }
    }
}

/// Requested CONNECT destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(IpAddr, u16),
    Domain(String, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Destination::Ip(_, port) | Destination::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Destination::Ip(ip, _) => ip.to_string(),
            Destination::Domain(name, _) => name.clone(),
        }
    }
}

/// Accept loop for a SOCKS5 tunnel. Returns when `shutdown` is cancelled.
pub async fn run_socks5_proxy(
    listener: TcpListener,
    source: Arc<dyn SessionSource>,
    dns_server: Option<String>,
    shutdown: CancellationToken,
) {
    let dns_server: Option<Arc<str>> = dns_server.map(Into::into);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("SOCKS5 proxy stopped");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("SOCKS5: accepted client {}", peer_addr);

                        let source = source.clone();
                        let dns_server = dns_server.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = client_shutdown.cancelled() => {
                                    debug!("SOCKS5 client {} torn down by tunnel close", peer_addr);
                                }
                                result = handle_socks5_connection(source, stream, dns_server.as_deref()) => {
                                    if let Err(e) = result {
                                        warn!("SOCKS5 client {} failed: {}", peer_addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Handle a single SOCKS5 client:
/// negotiate -> read request -> resolve -> open channel -> reply -> splice
async fn handle_socks5_connection(
    source: Arc<dyn SessionSource>,
    mut stream: TcpStream,
    dns_server: Option<&str>,
) -> Result<(), Socks5Error> {
    negotiate(&mut stream).await?;

    let channel = match connect_destination(&source, &mut stream, dns_server).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Some(code) = e.reply_code() {
                let _ = send_socks5_reply(&mut stream, code).await;
            }
            return Err(e);
        }
    };

    send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;

    let stats = splice(stream, channel).await;
    debug!(
        "SOCKS5 session finished: {} bytes sent, {} bytes received",
        stats.a_to_b, stats.b_to_a
    );
    Ok(())
}

async fn connect_destination(
    source: &Arc<dyn SessionSource>,
    stream: &mut TcpStream,
    dns_server: Option<&str>,
) -> Result<crate::ssh::TunnelChannel, Socks5Error> {
    let destination = read_request(stream).await?;
    let port = destination.port();

    let controller = source
        .current_session()
        .ok_or_else(|| Socks5Error::Forward {
            host: destination.host(),
            port,
            reason: "session not connected".into(),
        })?;

    let host = resolve_destination(&controller, &destination, dns_server).await?;
    debug!("SOCKS5: Connecting to {}:{}", host, port);

    controller
        .forward_out("127.0.0.1", 0, &host, port as u32)
        .await
        .map_err(|e| Socks5Error::Forward {
            host,
            port,
            reason: e.to_string(),
        })
}

/// Method negotiation; only "no authentication" is offered
async fn negotiate<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != socks5::VERSION {
        return Err(Socks5Error::BadVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&socks5::AUTH_NONE) {
        let _ = stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await;
        return Err(Socks5Error::NoAcceptableMethod);
    }

    stream.write_all(&[socks5::VERSION, socks5::AUTH_NONE]).await?;
    Ok(())
}

/// Read a CONNECT request. Domain names that are IP literals come back as
/// `Destination::Ip`.
async fn read_request<S>(stream: &mut S) -> Result<Destination, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp] = header;

    if version != socks5::VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    if cmd != socks5::CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let destination = match atyp {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Destination::Ip(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        socks5::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let name = String::from_utf8_lossy(&name).into_owned();
            match name.parse::<IpAddr>() {
                Ok(ip) => Destination::Ip(ip, port),
                Err(_) => Destination::Domain(name, port),
            }
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Destination::Ip(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    Ok(destination)
}

/// Host string to hand to the forward-out request
async fn resolve_destination(
    controller: &HandleController,
    destination: &Destination,
    dns_server: Option<&str>,
) -> Result<String, Socks5Error> {
    match (destination, dns_server) {
        (Destination::Ip(..), _) | (Destination::Domain(..), None) => Ok(destination.host()),
        (Destination::Domain(name, _), Some(server)) => {
            let addr = dns::lookup_address(controller, server, name)
                .await
                .map_err(|source| Socks5Error::Resolve {
                    host: name.clone(),
                    source,
                })?;
            debug!("SOCKS5: {} resolved to {} via {}", name, addr, server);
            Ok(addr.to_string())
        }
    }
}

/// Send a SOCKS5 reply
async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    // Bound address is always reported as 0.0.0.0:0
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}
