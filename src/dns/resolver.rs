//! DNS-over-TCP exchange carried on a forward-out channel

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::message::{build_query, DnsResponse};
use super::DnsError;
use crate::ssh::config::parse_host_port;
use crate::ssh::HandleController;

pub const DEFAULT_DNS_PORT: u16 = 53;

/// Send one length-prefixed query on `stream` and read the reply.
///
/// The write side is shut down after the query so servers that wait for
/// EOF before answering still respond.
pub async fn exchange<S>(stream: &mut S, query: &[u8]) -> Result<DnsResponse, DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| DnsError::Malformed("query too large".into()))?;

    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;
    stream.flush().await?;
    stream.shutdown().await?;

    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(DnsError::EmptyResponse);
        }
        Err(e) => return Err(e.into()),
    }

    let resp_len = u16::from_be_bytes(len_buf) as usize;
    if resp_len == 0 {
        return Err(DnsError::EmptyResponse);
    }

    let mut resp = vec![0u8; resp_len];
    stream.read_exact(&mut resp).await?;
    DnsResponse::parse(&resp)
}

/// Resolve `hostname` through the DNS server at `dns_server`
/// (`host[:port]`), reached via a forward-out channel on the session
pub async fn resolve_over_tunnel(
    controller: &HandleController,
    dns_server: &str,
    hostname: &str,
) -> Result<DnsResponse, DnsError> {
    let (server_host, server_port) = parse_host_port(dns_server, DEFAULT_DNS_PORT)
        .map_err(|_| DnsError::InvalidServer(dns_server.to_string()))?;

    let query = build_query(rand::random::<u16>(), hostname)?;

    debug!(
        "Resolving {} via {}:{} over tunnel",
        hostname, server_host, server_port
    );
    let mut channel = controller
        .forward_out("127.0.0.1", 0, &server_host, server_port as u32)
        .await?;

    exchange(&mut channel, &query).await
}

/// Resolve `hostname` to the first address found in the answers
pub async fn lookup_address(
    controller: &HandleController,
    dns_server: &str,
    hostname: &str,
) -> Result<IpAddr, DnsError> {
    let response = resolve_over_tunnel(controller, dns_server, hostname).await?;
    response
        .first_address()
        .ok_or_else(|| DnsError::NoAnswer(hostname.to_string()))
}
