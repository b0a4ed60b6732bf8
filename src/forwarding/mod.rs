//! Port Forwarding Module
//!
//! Local listeners that carry client streams through an SSH session:
//! fixed-target TCP forwards and a SOCKS5 proxy whose hostnames are
//! resolved over the tunnel.

pub mod dynamic;
pub mod local;
pub mod splice;
pub mod tunnel;

pub use splice::{splice, SpliceStats};
pub use tunnel::{bind_listener, SessionSource, Tunnel, TunnelKind, TunnelType};
