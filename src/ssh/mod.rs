//! SSH module - connections, chaining and the session seam
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Direct SSH connections with password authentication
//! - Chained connections: SSH-over-SSH through a bastion's forward-out channel
//! - Reconnect supervision with a fixed retry delay
//! - Connection registry owning connections and their tunnels

mod client;
pub mod config;
mod connection;
pub mod connection_registry;
mod connector;
mod error;
mod handle_owner;

pub use client::{connect_direct, connect_over_channel, ClientHandler, SessionSettings};
pub use config::{parse_host_port, SshConfig, DEFAULT_SSH_PORT};
pub use connection::{ConnectionState, SshConnection};
pub use connection_registry::ConnectionRegistry;
pub use connector::{RusshConnector, SessionConnector, Transport};
pub use error::SshError;
pub use handle_owner::{
    spawn_handle_owner_task, ChannelIo, HandleCommand, HandleController, TunnelChannel,
};
