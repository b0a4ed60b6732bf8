//! Engine Event System
//!
//! Asynchronous, not request-scoped notifications for the presentation
//! layer. Subscribers receive every event emitted after they subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Backlog kept per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection status reported in `ssh.update` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// Events emitted to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Session status change, keyed by the connect target string
    #[serde(rename = "ssh.update")]
    SshUpdate { target: String, status: ConnectStatus },

    /// Asynchronous failure not tied to a pending request
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        closed: Option<bool>,
    },
}

/// Event emitter shared by the registry and its connections
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscribers is fine
    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!("Emitting {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn emit_ssh_update(&self, target: &str, status: ConnectStatus) {
        self.emit(EngineEvent::SshUpdate {
            target: target.to_string(),
            status,
        });
    }

    pub fn emit_error(&self, message: impl Into<String>, closed: Option<bool>) {
        self.emit(EngineEvent::Error {
            message: message.into(),
            closed,
        });
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
