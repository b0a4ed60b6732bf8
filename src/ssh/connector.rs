//! Session establishment seam
//!
//! `SshConnection` never talks to russh directly; it asks a
//! `SessionConnector` for a running session over a given transport. The
//! production connector performs the russh handshake and spawns the
//! Handle Owner Task; tests plug in a scripted connector.

use std::time::Duration;

use async_trait::async_trait;

use super::client::{connect_direct, connect_over_channel, SessionSettings};
use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, TunnelChannel};

/// What the SSH handshake runs over
pub enum Transport {
    /// A TCP socket opened to `config.host:config.port`
    Direct,
    /// A forward-out channel obtained from a bastion session
    Channel(TunnelChannel),
}

impl Transport {
    pub fn is_direct(&self) -> bool {
        matches!(self, Transport::Direct)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Direct => f.write_str("Direct"),
            Transport::Channel(_) => f.write_str("Channel"),
        }
    }
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Perform handshake and authentication, returning a controller for
    /// the live session
    async fn connect(
        &self,
        connection_id: &str,
        config: &SshConfig,
        transport: Transport,
    ) -> Result<HandleController, SshError>;
}

/// Connector backed by russh
#[derive(Debug, Clone, Default)]
pub struct RusshConnector {
    settings: SessionSettings,
    liveness_check: Duration,
}

impl RusshConnector {
    pub fn new(settings: SessionSettings, liveness_check: Duration) -> Self {
        Self {
            settings,
            liveness_check,
        }
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(
        &self,
        connection_id: &str,
        config: &SshConfig,
        transport: Transport,
    ) -> Result<HandleController, SshError> {
        let handle = match transport {
            Transport::Direct => connect_direct(config, &self.settings).await?,
            Transport::Channel(stream) => {
                connect_over_channel(config, &self.settings, stream).await?
            }
        };

        let liveness = if self.liveness_check.is_zero() {
            Duration::from_secs(1)
        } else {
            self.liveness_check
        };
        Ok(spawn_handle_owner_task(
            handle,
            connection_id.to_string(),
            liveness,
        ))
    }
}
