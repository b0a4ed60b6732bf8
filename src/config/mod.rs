//! Configuration Management Module
//!
//! Engine tunables (reconnect backoff, handshake timeout, listener bind
//! host, keepalive) and loading them from a JSON file.

pub mod engine;

pub use engine::{ConfigError, EngineConfig};
