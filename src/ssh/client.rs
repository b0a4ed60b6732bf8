//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::TunnelChannel;

/// Session-level settings shared by every handshake
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// SSH keepalive interval
    pub keepalive_interval: Duration,
    /// Missed keepalives before russh drops the session
    pub keepalive_max: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_max: 3,
        }
    }
}

impl SessionSettings {
    fn russh_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None, // liveness is tracked by keepalives
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        })
    }
}

/// Connect over a fresh TCP socket and authenticate with a password
pub async fn connect_direct(
    config: &SshConfig,
    settings: &SessionSettings,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Connecting to SSH server at {}", config.address());

    let handler = ClientHandler::new(config.host.clone(), config.port);
    let handle = client::connect(
        settings.russh_config(),
        (config.host.as_str(), config.port),
        handler,
    )
    .await
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake completed with {}", config.address());
    authenticate(handle, config).await
}

/// Connect over an already-open byte stream (SSH-over-SSH)
///
/// The stream is usually a direct-tcpip channel forwarded by a bastion
/// session, so no socket to `config.host` is ever opened from here.
pub async fn connect_over_channel(
    config: &SshConfig,
    settings: &SessionSettings,
    stream: TunnelChannel,
) -> Result<Handle<ClientHandler>, SshError> {
    info!(
        "Connecting via stream to {} (SSH-over-SSH)",
        config.address()
    );

    let handler = ClientHandler::new(config.host.clone(), config.port);
    let handle = client::connect_stream(settings.russh_config(), stream, handler)
        .await
        .map_err(|e| {
            SshError::ConnectionFailed(format!(
                "Failed to connect via stream to {}: {}",
                config.address(),
                e
            ))
        })?;

    debug!("SSH handshake via stream completed");
    authenticate(handle, config).await
}

async fn authenticate(
    mut handle: Handle<ClientHandler>,
    config: &SshConfig,
) -> Result<Handle<ClientHandler>, SshError> {
    let authenticated = handle
        .authenticate_password(&config.username, &config.password)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "Authentication to {} rejected",
            config.host
        )));
    }

    info!("Authenticated to {} as {}", config.address(), config.username);
    Ok(handle)
}

/// Client handler for russh callbacks
///
/// Host keys are accepted as presented: the engine authenticates with
/// passwords only and keeps no known_hosts store.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Accepting unverified {} host key {} for {}:{}",
            server_public_key.algorithm(),
            server_public_key.fingerprint(HashAlg::Sha256),
            self.host,
            self.port
        );
        Ok(true)
    }
}
