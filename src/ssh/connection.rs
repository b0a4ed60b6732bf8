//! SSH Connection lifecycle
//!
//! # State machine
//!
//! ```text
//! Connecting ──ok──▶ Connected ◀──ok── Reconnecting ◀─┐
//!     │                  │                  │         │
//!     │             transport lost ─────────┘    attempt failed
//!     │                                             (retry after delay)
//!     └── any state ── explicit disconnect ──▶ Closed
//! ```
//!
//! A connection may ride on a bastion: every attempt then waits for the
//! bastion to be connected and runs the SSH handshake over a forward-out
//! channel of the bastion's session.
//!
//! # Locks
//!
//! `lifecycle` (state, controller, ready waiters) and `tunnels` are
//! `parking_lot` mutexes and are never held across `.await`. When both are
//! needed the order is `tunnels` then `lifecycle`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::connector::{SessionConnector, Transport};
use super::error::SshError;
use super::handle_owner::HandleController;
use crate::events::{ConnectStatus, EventEmitter};
use crate::forwarding::{SessionSource, Tunnel};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct Lifecycle {
    state: ConnectionState,
    controller: Option<HandleController>,
    /// One-shot subscribers to the next readiness
    ready_waiters: Vec<oneshot::Sender<HandleController>>,
}

/// One managed SSH connection
pub struct SshConnection {
    id: String,
    /// Connect target as given by the caller; used as the event key
    target: String,
    config: SshConfig,
    bastion: Option<Arc<SshConnection>>,
    connector: Arc<dyn SessionConnector>,
    events: EventEmitter,
    reconnect_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    supervisor: CancellationToken,
}

impl SshConnection {
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        config: SshConfig,
        bastion: Option<Arc<SshConnection>>,
        connector: Arc<dyn SessionConnector>,
        events: EventEmitter,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            config,
            bastion,
            connector,
            events,
            reconnect_delay,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                controller: None,
                ready_waiters: Vec::new(),
            }),
            tunnels: Mutex::new(Vec::new()),
            supervisor: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn bastion_id(&self) -> Option<&str> {
        self.bastion.as_deref().map(SshConnection::id)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// Names of the tunnels currently owned by this connection
    pub fn tunnel_names(&self) -> Vec<String> {
        self.tunnels
            .lock()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Controller of the live session, waiting for the next readiness if
    /// the connection is not connected right now.
    ///
    /// Fails with `Disconnected` if the connection is closed, either
    /// already or while waiting.
    pub async fn wait_ready(&self) -> Result<HandleController, SshError> {
        let rx = {
            let mut lifecycle = self.lifecycle.lock();
            match (lifecycle.state, &lifecycle.controller) {
                (ConnectionState::Closed, _) => return Err(SshError::Disconnected),
                (ConnectionState::Connected, Some(controller)) => return Ok(controller.clone()),
                _ => {
                    let (tx, rx) = oneshot::channel();
                    lifecycle.ready_waiters.push(tx);
                    rx
                }
            }
        };

        debug!("Waiting for connection {} to become ready", self.id);
        rx.await.map_err(|_| SshError::Disconnected)
    }

    /// One connect attempt: wait for the bastion (if any), open the
    /// transport and run the handshake within the configured timeout
    pub(crate) async fn attempt(&self) -> Result<HandleController, SshError> {
        let bastion_controller = match &self.bastion {
            Some(bastion) => Some(bastion.wait_ready().await.map_err(|_| {
                SshError::ConnectionFailed(format!("bastion {} is closed", bastion.id()))
            })?),
            None => None,
        };

        let timeout = self.config.timeout();
        let handshake = async {
            let transport = match bastion_controller {
                Some(bastion) => {
                    debug!(
                        "Opening forward-out to {} through bastion for {}",
                        self.config.address(),
                        self.id
                    );
                    let channel = bastion
                        .forward_out("127.0.0.1", 0, &self.config.host, self.config.port as u32)
                        .await?;
                    Transport::Channel(channel)
                }
                None => Transport::Direct,
            };
            self.connector
                .connect(&self.id, &self.config, transport)
                .await
        };

        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "handshake with {} timed out after {} ms",
                    self.config.address(),
                    timeout.as_millis()
                ))
            })?
    }

    /// Record a live session and wake every ready waiter.
    ///
    /// Returns `false` if the connection was closed meanwhile; the caller
    /// then owns the controller and must disconnect it.
    pub(crate) fn mark_connected(&self, controller: HandleController) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Closed {
            return false;
        }
        lifecycle.state = ConnectionState::Connected;
        lifecycle.controller = Some(controller.clone());
        for waiter in lifecycle.ready_waiters.drain(..) {
            let _ = waiter.send(controller.clone());
        }
        true
    }

    /// Returns `false` if the connection is closed
    fn mark_reconnecting(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Closed {
            return false;
        }
        lifecycle.state = ConnectionState::Reconnecting;
        lifecycle.controller = None;
        true
    }

    /// Attach a tunnel; refused once the connection is closed
    pub(crate) fn attach_tunnel(&self, tunnel: Arc<Tunnel>) -> bool {
        let mut tunnels = self.tunnels.lock();
        if self.lifecycle.lock().state == ConnectionState::Closed {
            return false;
        }
        tunnels.push(tunnel);
        true
    }

    /// Stop the supervisor, mark closed, fail pending ready waiters and
    /// hand back the session controller and owned tunnels for teardown
    pub(crate) fn close(&self) -> (Option<HandleController>, Vec<Arc<Tunnel>>) {
        self.supervisor.cancel();

        let controller = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ConnectionState::Closed;
            // dropping the senders fails every pending wait_ready
            lifecycle.ready_waiters.clear();
            lifecycle.controller.take()
        };

        let tunnels = std::mem::take(&mut *self.tunnels.lock());
        (controller, tunnels)
    }

    /// Resolves once the connection has been closed
    pub(crate) async fn cancelled(&self) {
        self.supervisor.cancelled().await
    }

    /// Start the reconnect supervisor.
    ///
    /// With `connected`, it first waits for the current session to drop;
    /// otherwise it goes straight into the retry loop.
    pub(crate) fn spawn_supervisor(self: &Arc<Self>, connected: bool) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.supervise(connected).await;
            debug!("Supervisor for connection {} exited", conn.id);
        });
    }

    async fn supervise(&self, mut connected: bool) {
        loop {
            if connected {
                if let Some(controller) = self.current_session() {
                    tokio::select! {
                        _ = self.supervisor.cancelled() => return,
                        _ = controller.closed() => {}
                    }
                }
                warn!("SSH transport lost for connection {} ({})", self.id, self.target);
            }

            if !self.mark_reconnecting() {
                return;
            }
            self.events
                .emit_ssh_update(&self.target, ConnectStatus::Reconnecting);

            tokio::select! {
                _ = self.supervisor.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            info!("Reconnecting {} ({})", self.id, self.target);
            let result = tokio::select! {
                _ = self.supervisor.cancelled() => return,
                result = self.attempt() => result,
            };

            match result {
                Ok(controller) => {
                    if !self.mark_connected(controller.clone()) {
                        controller.disconnect().await;
                        return;
                    }
                    info!("Connection {} ({}) re-established", self.id, self.target);
                    self.events
                        .emit_ssh_update(&self.target, ConnectStatus::Connected);
                    connected = true;
                }
                Err(e) => {
                    if self.supervisor.is_cancelled() {
                        return;
                    }
                    warn!("Reconnect of {} ({}) failed: {}", self.id, self.target, e);
                    self.events
                        .emit_ssh_update(&self.target, ConnectStatus::Closed);
                    self.events.emit_error(e.to_string(), Some(false));
                    connected = false;
                }
            }
        }
    }
}

impl SessionSource for SshConnection {
    fn current_session(&self) -> Option<HandleController> {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Connected => lifecycle.controller.clone(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("bastion", &self.bastion_id())
            .field("state", &self.state())
            .finish()
    }
}
