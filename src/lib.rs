//! TunnelHub - SSH connection and tunnel orchestration engine
//!
//! Manages multiplexed SSH sessions (optionally chained through a bastion
//! session), local TCP forwards and a SOCKS5 proxy whose hostnames are
//! resolved by DNS carried over the tunnel.
//!
//! The entry point is [`ConnectionRegistry`]; its `connect`, `disconnect`
//! and `add_tunnel` operations take and return the boundary types in
//! [`commands`], and status changes are published on the event stream
//! returned by `subscribe`.

pub mod commands;
pub mod config;
pub mod dns;
pub mod events;
pub mod forwarding;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::{AddTunnelParams, AddTunnelResult, ConnectResult, NewConnectParams};
pub use config::EngineConfig;
pub use events::{ConnectStatus, EngineEvent};
pub use ssh::ConnectionRegistry;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once;
/// only the first call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
