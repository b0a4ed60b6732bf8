//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Every other component
//! (TCP forwards, the SOCKS5 proxy, the DNS resolver, chained sessions)
//! talks to it through a cloneable `HandleController` that sends commands
//! over an mpsc channel.
//!
//! When the session dies the owner task exits and drops its receiver, so
//! `HandleController::closed()` resolves. The connection supervisor uses
//! that as its transport-loss signal.
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, connection_id, Duration::from_secs(1));
//!
//! // Open a forward-out channel
//! let channel = controller.forward_out("127.0.0.1", 0, "10.0.0.9", 80).await?;
//! ```

use std::time::Duration;

use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Byte stream carried by a forwarded channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A forward-out channel, type-erased so that the SSH channel stream and
/// test doubles look the same to callers
pub type TunnelChannel = Box<dyn ChannelIo>;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel to `host:port`
    ForwardOut {
        originator_host: String,
        originator_port: u32,
        host: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<TunnelChannel, SshError>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

impl std::fmt::Debug for HandleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleCommand::ForwardOut { host, port, .. } => f
                .debug_struct("ForwardOut")
                .field("host", host)
                .field("port", port)
                .finish(),
            HandleCommand::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it only copies the sender). Anything holding a
/// controller can open channels on the session or tear it down.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing command sender.
    ///
    /// Production code uses `spawn_handle_owner_task`; this lets tests
    /// serve the command channel themselves.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Ask the remote end to open a TCP connection to `host:port` and
    /// relay it over a new channel
    pub async fn forward_out(
        &self,
        originator_host: &str,
        originator_port: u32,
        host: &str,
        port: u32,
    ) -> Result<TunnelChannel, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ForwardOut {
                originator_host: originator_host.to_string(),
                originator_port,
                host: host.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Resolves once the session is gone (owner task exited)
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for
/// sending commands. The task exits on `Disconnect`, when every controller
/// is dropped, or when the session is found closed on a liveness tick.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    connection_id: String,
    liveness_check: Duration,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle; // Move into task, becomes sole owner
        let mut liveness = tokio::time::interval(liveness_check);

        info!("Handle owner task started for connection {}", connection_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ForwardOut {
                        originator_host,
                        originator_port,
                        host,
                        port,
                        reply_tx,
                    }) => {
                        let result = handle
                            .channel_open_direct_tcpip(
                                &host,
                                port,
                                &originator_host,
                                originator_port,
                            )
                            .await
                            .map(|channel| Box::new(channel.into_stream()) as TunnelChannel)
                            .map_err(|e| SshError::ChannelError(format!(
                                "forward-out to {}:{} refused: {}",
                                host, port, e
                            )));
                        if reply_tx.send(result).is_err() {
                            // Channel will be dropped, SSH server will close it
                            warn!("Caller dropped before receiving forward-out result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for connection {}", connection_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for connection {}", connection_id);
                        break;
                    }
                },

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH transport lost for connection {}", connection_id);
                        break;
                    }
                }
            }
        }

        // Fail everything still queued, then close the session
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for connection {}", connection_id);
    });

    HandleController { cmd_tx }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ForwardOut { reply_tx, .. } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
