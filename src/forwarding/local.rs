//! Local TCP Forwarding
//!
//! Forwards connections from a local port to a fixed remote host:port
//! through the owner's SSH session.
//! Example: 127.0.0.1:15432 -> SSH tunnel -> db.internal:5432

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::splice::splice;
use super::tunnel::SessionSource;
use crate::ssh::SshError;

/// Accept loop for a tcp tunnel. Returns when `shutdown` is cancelled.
pub async fn run_tcp_forward(
    listener: TcpListener,
    source: Arc<dyn SessionSource>,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    let remote_host: Arc<str> = remote_host.into();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Local forward to {}:{} stopped", remote_host, remote_port);
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted connection from {} for forward", peer_addr);

                        let source = source.clone();
                        let remote_host = remote_host.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = client_shutdown.cancelled() => {
                                    debug!("Forward client {} torn down by tunnel close", peer_addr);
                                }
                                result = handle_forward_connection(source, stream, &remote_host, remote_port) => {
                                    if let Err(e) = result {
                                        warn!("Forward connection error: {}", e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        // Small delay before retrying
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Handle a single forwarded connection
async fn handle_forward_connection(
    source: Arc<dyn SessionSource>,
    local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), SshError> {
    let controller = source.current_session().ok_or(SshError::Disconnected)?;

    let channel = controller
        .forward_out("127.0.0.1", 0, remote_host, remote_port as u32)
        .await?;

    debug!(
        "Opened channel for forward to {}:{}",
        remote_host, remote_port
    );

    let stats = splice(local_stream, channel).await;
    debug!(
        "Forward to {}:{} finished: {} bytes sent, {} bytes received",
        remote_host, remote_port, stats.a_to_b, stats.b_to_a
    );
    Ok(())
}
