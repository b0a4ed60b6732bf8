//! SSH Connection Registry
//!
//! Owns every connection and tunnel of one engine instance and exposes the
//! boundary operations (`connect`, `disconnect`, `add_tunnel`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConnectionRegistry                                         │
//! │  ├── connections: DashMap<id, Arc<SshConnection>>           │
//! │  │        └── bastion: Option<Arc<SshConnection>>           │
//! │  ├── tunnels:     DashMap<name, Arc<Tunnel>>                │
//! │  ├── events:      EventEmitter (broadcast)                  │
//! │  └── connector:   Arc<dyn SessionConnector>                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A tunnel is registered by name first and then attached to its
//! connection; the connection refuses attachment once closed, in which case
//! the name registration is rolled back. Disconnect removes the connection
//! from the map before tearing anything down, so concurrent disconnects of
//! the same id do the teardown exactly once.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::connection::{ConnectionState, SshConnection};
use super::connector::{RusshConnector, SessionConnector};
use crate::commands::{AddTunnelParams, AddTunnelResult, ConnectResult, NewConnectParams};
use crate::config::EngineConfig;
use crate::events::{ConnectStatus, EngineEvent, EventEmitter};
use crate::forwarding::{SessionSource, Tunnel, TunnelKind};

const MSG_NO_SERVER: &str = "no server";
const MSG_NO_CONNECTION: &str = "no connection";
const MSG_DUPLICATE_ID: &str = "connection id already exists";
const MSG_DUPLICATE_TUNNEL: &str = "tunnel name already exists";
const MSG_CLOSED_DURING_CONNECT: &str = "connection closed during connect";

/// Registry of SSH connections and their tunnels
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<SshConnection>>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    events: EventEmitter,
    connector: Arc<dyn SessionConnector>,
    config: EngineConfig,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Registry backed by russh with the given tunables
    pub fn with_config(config: EngineConfig) -> Self {
        let connector = RusshConnector::new(config.session_settings(), config.liveness_check());
        Self::with_connector(config, Arc::new(connector))
    }

    /// Registry with a custom session connector
    pub fn with_connector(config: EngineConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connections: DashMap::new(),
            tunnels: DashMap::new(),
            events: EventEmitter::new(),
            connector,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to `ssh.update` and `error` events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Open a connection, directly or through a registered bastion.
    ///
    /// Resolves after the first attempt. Later transport losses are
    /// handled by the connection's supervisor and reported as events.
    pub async fn connect(&self, params: NewConnectParams) -> ConnectResult {
        let id = params
            .connection_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.connections.contains_key(&id) {
            return ConnectResult::failed(MSG_DUPLICATE_ID, "");
        }

        let bastion = match params.via.as_deref().filter(|v| !v.is_empty()) {
            Some(via) => match self.connections.get(via) {
                Some(entry) => Some(entry.value().clone()),
                None => {
                    warn!("Connect to {} via unknown bastion {}", params.target, via);
                    return ConnectResult::failed(MSG_NO_SERVER, "");
                }
            },
            None => None,
        };

        let config = match SshConfig::from_target(&params.target, params.username, params.password)
        {
            Ok(config) => config.with_timeout(self.config.handshake_timeout()),
            Err(e) => return ConnectResult::failed(e.to_string(), ""),
        };

        info!(
            "Creating SSH connection {} -> {}@{}{}",
            id,
            config.username,
            config.address(),
            bastion
                .as_ref()
                .map(|b| format!(" via {}", b.id()))
                .unwrap_or_default()
        );

        let conn = Arc::new(SshConnection::new(
            id.clone(),
            params.target,
            config,
            bastion,
            self.connector.clone(),
            self.events.clone(),
            self.config.reconnect_delay(),
        ));

        if params.force && !self.try_register(&conn) {
            return ConnectResult::failed(MSG_DUPLICATE_ID, "");
        }

        let result = tokio::select! {
            _ = conn.cancelled() => {
                debug!("Connection {} closed before its first attempt finished", id);
                return ConnectResult::failed(MSG_CLOSED_DURING_CONNECT, "");
            }
            result = conn.attempt() => result,
        };

        match result {
            Ok(controller) => {
                if !params.force && !self.try_register(&conn) {
                    controller.disconnect().await;
                    return ConnectResult::failed(MSG_DUPLICATE_ID, "");
                }
                if !conn.mark_connected(controller.clone()) {
                    // disconnected while the handshake was running
                    controller.disconnect().await;
                    return ConnectResult::failed(MSG_CLOSED_DURING_CONNECT, "");
                }
                info!("SSH connection {} established", id);
                conn.spawn_supervisor(true);
                ConnectResult::ok(id)
            }
            Err(e) => {
                warn!("SSH connection {} to {} failed: {}", id, conn.target(), e);
                if params.force && conn.state() != ConnectionState::Closed {
                    conn.spawn_supervisor(false);
                    ConnectResult::failed(e.to_string(), id)
                } else {
                    ConnectResult::failed(e.to_string(), "")
                }
            }
        }
    }

    fn try_register(&self, conn: &Arc<SshConnection>) -> bool {
        match self.connections.entry(conn.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
                true
            }
        }
    }

    /// Tear down a connection and its tunnels. Unknown ids are ignored.
    ///
    /// Connections chained through this one are left registered; their
    /// supervisors keep retrying.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            debug!("Disconnect of unknown connection {} ignored", connection_id);
            return;
        };

        info!("Disconnecting {} ({})", connection_id, conn.target());
        let (controller, tunnels) = conn.close();

        for tunnel in tunnels {
            self.tunnels
                .remove_if(tunnel.name(), |_, registered| Arc::ptr_eq(registered, &tunnel));
            tunnel.close();
        }

        self.events
            .emit_ssh_update(conn.target(), ConnectStatus::Closed);

        if let Some(controller) = controller {
            controller.disconnect().await;
        }
    }

    /// Disconnect everything (shutdown)
    pub async fn disconnect_all(&self) {
        let ids = self.connection_ids();
        info!("Disconnecting all {} connections", ids.len());
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Start a tcp or SOCKS5 tunnel on an existing connection
    pub async fn add_tunnel(&self, params: AddTunnelParams) -> AddTunnelResult {
        let Some(conn) = self
            .connections
            .get(&params.via)
            .map(|entry| entry.value().clone())
        else {
            return AddTunnelResult::failed(MSG_NO_CONNECTION);
        };

        let kind = match TunnelKind::from_params(
            params.tunnel_type,
            params.target.as_deref(),
            params.dns_server.as_deref(),
        ) {
            Ok(kind) => kind,
            Err(e) => return AddTunnelResult::failed(e.to_string()),
        };

        if params.name.is_empty() {
            return AddTunnelResult::failed("tunnel name is required");
        }
        if self.tunnels.contains_key(&params.name) {
            return AddTunnelResult::failed(MSG_DUPLICATE_TUNNEL);
        }

        let source: Arc<dyn SessionSource> = conn.clone();
        let tunnel = match Tunnel::start(
            params.name.clone(),
            conn.id(),
            kind,
            &self.config.bind_host,
            params.local_port,
            source,
        )
        .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Tunnel '{}' failed to start: {}", params.name, e);
                return AddTunnelResult::failed(e.to_string());
            }
        };

        // name may have been taken while binding
        let registered = match self.tunnels.entry(params.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tunnel.clone());
                true
            }
        };
        if !registered {
            tunnel.close();
            return AddTunnelResult::failed(MSG_DUPLICATE_TUNNEL);
        }

        if !conn.attach_tunnel(tunnel.clone()) {
            // connection was disconnected while the listener was binding
            self.tunnels
                .remove_if(tunnel.name(), |_, registered| Arc::ptr_eq(registered, &tunnel));
            tunnel.close();
            return AddTunnelResult::failed(MSG_NO_CONNECTION);
        }

        AddTunnelResult::ok(tunnel.local_port())
    }

    pub fn connection_state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().state())
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn tunnel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn tunnel_local_port(&self, name: &str) -> Option<u16> {
        self.tunnels.get(name).map(|entry| entry.value().local_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::TunnelType;
    use crate::testing::{echo_server, FakeConnector, Outcome, Route};
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn registry() -> (ConnectionRegistry, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::new());
        let config = EngineConfig {
            reconnect_delay_ms: 20,
            handshake_timeout_ms: 500,
            ..Default::default()
        };
        (
            ConnectionRegistry::with_connector(config, connector.clone()),
            connector,
        )
    }

    fn connect_params(id: Option<&str>, via: Option<&str>, target: &str, force: bool) -> NewConnectParams {
        NewConnectParams {
            connection_id: id.map(str::to_string),
            via: via.map(str::to_string),
            target: target.to_string(),
            username: "ops".into(),
            password: "secret".into(),
            force,
        }
    }

    fn tcp_tunnel(via: &str, name: &str, target: &str) -> AddTunnelParams {
        AddTunnelParams {
            tunnel_type: TunnelType::Tcp,
            via: via.into(),
            name: name.into(),
            target: Some(target.into()),
            local_port: 0,
            dns_server: None,
        }
    }

    fn socks_tunnel(via: &str, name: &str, dns_server: Option<&str>) -> AddTunnelParams {
        AddTunnelParams {
            tunnel_type: TunnelType::Socks5,
            via: via.into(),
            name: name.into(),
            target: None,
            local_port: 0,
            dns_server: dns_server.map(str::to_string),
        }
    }

    async fn next_status(rx: &mut broadcast::Receiver<EngineEvent>) -> ConnectStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .unwrap();
            if let EngineEvent::SshUpdate { status, .. } = event {
                return status;
            }
        }
    }

    /// Greet a SOCKS5 proxy and send a CONNECT request; returns the stream
    /// and the reply code
    async fn socks_connect(port: u16, request: &[u8]) -> (TcpStream, u8) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        stream.write_all(request).await.unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        (stream, reply[1])
    }

    fn ipv4_request(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    fn domain_request(name: &str, port: u16) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
        req.extend_from_slice(name.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn test_connect_registers_connection() {
        let (reg, connector) = registry();

        let res = reg.connect(connect_params(None, None, "host-a:2222", false)).await;
        assert!(res.result, "{}", res.message);
        assert!(uuid::Uuid::parse_str(&res.connection_id).is_ok());
        assert_eq!(reg.connection_ids(), vec![res.connection_id.clone()]);
        assert_eq!(
            reg.connection_state(&res.connection_id),
            Some(ConnectionState::Connected)
        );

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!((attempts[0].host.as_str(), attempts[0].port), ("host-a", 2222));
        assert!(attempts[0].direct);
    }

    #[tokio::test]
    async fn test_unreachable_connect_is_not_registered() {
        let (reg, connector) = registry();
        connector.script("down", [Outcome::Fail]);

        let res = reg.connect(connect_params(Some("c1"), None, "down:22", false)).await;
        assert!(!res.result);
        assert!(!res.message.is_empty());
        assert_eq!(res.connection_id, "");
        assert!(reg.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn test_forced_connect_stays_registered_and_retries() {
        let (reg, connector) = registry();
        connector.script("later", [Outcome::Fail]);
        let mut rx = reg.subscribe();

        let res = reg.connect(connect_params(Some("c1"), None, "later:22", true)).await;
        assert!(!res.result);
        assert_eq!(res.connection_id, "c1");
        assert_eq!(reg.connection_ids(), vec!["c1".to_string()]);

        assert_eq!(next_status(&mut rx).await, ConnectStatus::Reconnecting);
        assert_eq!(next_status(&mut rx).await, ConnectStatus::Connected);
        assert_eq!(reg.connection_state("c1"), Some(ConnectionState::Connected));

        reg.disconnect("c1").await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_bounds_first_attempt() {
        let (reg, connector) = registry();
        connector.script("tarpit", [Outcome::Hang]);

        let started = Instant::now();
        let res = reg.connect(connect_params(None, None, "tarpit:22", false)).await;
        assert!(!res.result);
        assert_eq!(res.connection_id, "");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unknown_bastion_fails_without_network() {
        let (reg, connector) = registry();

        let res = reg
            .connect(connect_params(None, Some("missing"), "10.0.0.5:22", false))
            .await;
        assert_eq!(res, ConnectResult::failed("no server", ""));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_rejected() {
        let (reg, _connector) = registry();
        assert!(reg.connect(connect_params(Some("c1"), None, "a:22", false)).await.result);

        let res = reg.connect(connect_params(Some("c1"), None, "b:22", false)).await;
        assert_eq!(res, ConnectResult::failed("connection id already exists", ""));
        assert_eq!(reg.connection_ids(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_chained_connect_uses_bastion_channel() {
        let (reg, connector) = registry();
        assert!(reg.connect(connect_params(Some("b"), None, "bastion.example", false)).await.result);

        let res = reg
            .connect(connect_params(Some("d"), Some("b"), "10.0.0.5:22", false))
            .await;
        assert!(res.result, "{}", res.message);

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].host, "10.0.0.5");
        assert!(!attempts[1].direct);
        assert_eq!(
            connector.session_for("b").unwrap().requests(),
            vec![("10.0.0.5".to_string(), 22)]
        );
    }

    #[tokio::test]
    async fn test_dependent_waits_for_bastion_readiness() {
        let (reg, connector) = registry();
        connector.script("bastion", [Outcome::Fail]);
        let reg = Arc::new(reg);

        let res = reg.connect(connect_params(Some("b"), None, "bastion:22", true)).await;
        assert!(!res.result);

        let dependent = {
            let reg = reg.clone();
            tokio::spawn(async move {
                reg.connect(connect_params(Some("d"), Some("b"), "10.0.0.5:22", false))
                    .await
            })
        };

        let res = tokio::time::timeout(Duration::from_secs(5), dependent)
            .await
            .unwrap()
            .unwrap();
        assert!(res.result, "{}", res.message);

        let hosts: Vec<(String, bool)> = connector
            .attempts()
            .into_iter()
            .map(|a| (a.host, a.direct))
            .collect();
        assert_eq!(
            hosts,
            vec![
                ("bastion".to_string(), true),
                ("bastion".to_string(), true),
                ("10.0.0.5".to_string(), false),
            ]
        );

        reg.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_disconnect_ends_pending_chained_connect() {
        let (reg, connector) = registry();
        connector.script("bastion", [Outcome::Fail; 1000]);
        let reg = Arc::new(reg);

        let res = reg.connect(connect_params(Some("b"), None, "bastion:22", true)).await;
        assert!(!res.result);

        let dependent = {
            let reg = reg.clone();
            tokio::spawn(async move {
                reg.connect(connect_params(Some("d"), Some("b"), "10.0.0.5:22", true))
                    .await
            })
        };
        while reg.connection_state("d").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        reg.disconnect("d").await;
        let res = tokio::time::timeout(Duration::from_secs(3), dependent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, ConnectResult::failed("connection closed during connect", ""));
        assert_eq!(reg.connection_ids(), vec!["b".to_string()]);
        assert!(connector.attempts().iter().all(|a| a.host == "bastion"));

        reg.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_bastion_disconnect_does_not_cascade() {
        let (reg, _connector) = registry();
        assert!(reg.connect(connect_params(Some("b"), None, "bastion:22", false)).await.result);
        assert!(
            reg.connect(connect_params(Some("d"), Some("b"), "10.0.0.5:22", false))
                .await
                .result
        );

        reg.disconnect("b").await;
        assert_eq!(reg.connection_ids(), vec!["d".to_string()]);

        reg.disconnect_all().await;
        assert!(reg.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn test_add_tunnel_unknown_connection() {
        let (reg, _connector) = registry();
        let res = reg.add_tunnel(tcp_tunnel("nope", "web", "10.0.0.9:80")).await;
        assert_eq!(
            res,
            AddTunnelResult {
                result: false,
                message: "no connection".into(),
                local_port: -1,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let (reg, _connector) = registry();
        let mut rx = reg.subscribe();

        reg.disconnect("ghost").await;
        assert!(rx.try_recv().is_err());

        // still usable
        assert!(reg.connect(connect_params(None, None, "a:22", false)).await.result);
    }

    #[tokio::test]
    async fn test_tcp_tunnel_on_ephemeral_port_splices() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("db.internal", 5432, Route::Tcp(echo));
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let res = reg.add_tunnel(tcp_tunnel("c", "db", "db.internal:5432")).await;
        assert!(res.result, "{}", res.message);
        assert!(res.local_port > 0);
        assert_eq!(reg.tunnel_local_port("db"), Some(res.local_port as u16));

        let mut client = TcpStream::connect(("127.0.0.1", res.local_port as u16))
            .await
            .unwrap();
        assert_echo(&mut client, b"hello through the tunnel").await;
    }

    #[tokio::test]
    async fn test_tcp_tunnel_requires_target() {
        let (reg, _connector) = registry();
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let mut params = tcp_tunnel("c", "db", "x:1");
        params.target = None;
        let res = reg.add_tunnel(params).await;
        assert!(!res.result);
        assert_eq!(res.local_port, -1);
        assert!(reg.tunnel_names().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (reg, _connector) = registry();
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut params = tcp_tunnel("c", "db", "db:5432");
        params.local_port = taken.local_addr().unwrap().port();
        let res = reg.add_tunnel(params).await;
        assert!(!res.result);
        assert_eq!(res.local_port, -1);
        assert!(reg.tunnel_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_tunnel_name_rejected() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("web", 80, Route::Tcp(echo));
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let first = reg.add_tunnel(tcp_tunnel("c", "web", "web:80")).await;
        assert!(first.result);
        let second = reg.add_tunnel(tcp_tunnel("c", "web", "other:80")).await;
        assert_eq!(second, AddTunnelResult::failed("tunnel name already exists"));

        // the first tunnel is unaffected
        let mut client = TcpStream::connect(("127.0.0.1", first.local_port as u16))
            .await
            .unwrap();
        assert_echo(&mut client, b"still here").await;
    }

    #[tokio::test]
    async fn test_concurrent_disconnect_closes_tunnels_once() {
        let (reg, _connector) = registry();
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);
        assert!(reg.add_tunnel(tcp_tunnel("c", "t1", "a:1")).await.result);
        assert!(reg.add_tunnel(socks_tunnel("c", "t2", None)).await.result);

        let tunnels: Vec<Arc<Tunnel>> = ["t1", "t2"]
            .iter()
            .map(|name| reg.tunnels.get(*name).unwrap().value().clone())
            .collect();
        let mut rx = reg.subscribe();

        tokio::join!(reg.disconnect("c"), reg.disconnect("c"));

        assert!(reg.connection_ids().is_empty());
        assert!(reg.tunnel_names().is_empty());
        for tunnel in &tunnels {
            assert!(tunnel.is_closed());
            // a further close is a no-op
            assert!(!tunnel.close());
            tunnel.stopped().await;
            assert!(TcpStream::connect(tunnel.local_addr()).await.is_err());
        }

        let mut closed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                EngineEvent::SshUpdate {
                    status: ConnectStatus::Closed,
                    ..
                }
            ) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }

    #[tokio::test]
    async fn test_socks5_ipv4_destination_skips_dns() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("10.0.0.9", 80, Route::Tcp(echo));
        connector.route("10.0.0.2", 53, Route::DnsAnswer(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let res = reg.add_tunnel(socks_tunnel("c", "proxy", Some("10.0.0.2"))).await;
        assert!(res.result, "{}", res.message);
        let port = res.local_port as u16;

        let (mut stream, rep) = socks_connect(port, &ipv4_request([10, 0, 0, 9], 80)).await;
        assert_eq!(rep, 0x00);
        assert_echo(&mut stream, b"GET / HTTP/1.0\r\n\r\n").await;

        // an IP literal sent as a domain name is not resolved either
        let (mut stream, rep) = socks_connect(port, &domain_request("10.0.0.9", 80)).await;
        assert_eq!(rep, 0x00);
        assert_echo(&mut stream, b"again").await;

        let requests = connector.session_for("c").unwrap().requests();
        assert_eq!(
            requests,
            vec![("10.0.0.9".to_string(), 80), ("10.0.0.9".to_string(), 80)]
        );
    }

    #[tokio::test]
    async fn test_socks5_hostname_resolved_once_over_tunnel() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("10.0.0.2", 53, Route::DnsAnswer(Ipv4Addr::new(10, 0, 0, 9)));
        connector.route("10.0.0.9", 443, Route::Tcp(echo));
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let res = reg.add_tunnel(socks_tunnel("c", "proxy", Some("10.0.0.2"))).await;
        let (mut stream, rep) =
            socks_connect(res.local_port as u16, &domain_request("git.corp", 443)).await;
        assert_eq!(rep, 0x00);
        assert_echo(&mut stream, b"hello git").await;

        let requests = connector.session_for("c").unwrap().requests();
        assert_eq!(
            requests,
            vec![("10.0.0.2".to_string(), 53), ("10.0.0.9".to_string(), 443)]
        );
    }

    #[tokio::test]
    async fn test_socks5_empty_dns_response_denies_only_that_client() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("10.0.0.2", 53, Route::DnsEmpty);
        connector.route("10.0.0.9", 80, Route::Tcp(echo));
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let res = reg.add_tunnel(socks_tunnel("c", "proxy", Some("10.0.0.2"))).await;
        let port = res.local_port as u16;

        let (_denied, rep) = socks_connect(port, &domain_request("ghost.corp", 80)).await;
        assert_eq!(rep, 0x04);

        // listener keeps serving
        let (mut stream, rep) = socks_connect(port, &ipv4_request([10, 0, 0, 9], 80)).await;
        assert_eq!(rep, 0x00);
        assert_echo(&mut stream, b"ok").await;

        let dns_queries = connector
            .session_for("c")
            .unwrap()
            .requests()
            .into_iter()
            .filter(|(_, port)| *port == 53)
            .count();
        assert_eq!(dns_queries, 1);
    }

    #[tokio::test]
    async fn test_socks5_refused_forward_replies_host_unreachable() {
        let (reg, connector) = registry();
        connector.route("10.0.0.66", 22, Route::Refuse);
        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);

        let res = reg.add_tunnel(socks_tunnel("c", "proxy", None)).await;
        let (_stream, rep) =
            socks_connect(res.local_port as u16, &ipv4_request([10, 0, 0, 66], 22)).await;
        assert_eq!(rep, 0x04);
    }

    #[tokio::test]
    async fn test_tunnel_survives_reconnect() {
        let (reg, connector) = registry();
        let echo = echo_server().await;
        connector.route("web", 80, Route::Tcp(echo));
        let mut rx = reg.subscribe();

        assert!(reg.connect(connect_params(Some("c"), None, "jump:22", false)).await.result);
        let res = reg.add_tunnel(tcp_tunnel("c", "web", "web:80")).await;
        let port = res.local_port as u16;

        connector.session_for("c").unwrap().kill();
        assert_eq!(next_status(&mut rx).await, ConnectStatus::Reconnecting);
        assert_eq!(next_status(&mut rx).await, ConnectStatus::Connected);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_echo(&mut client, b"after reconnect").await;
        assert_eq!(connector.session(1).requests(), vec![("web".to_string(), 80)]);

        reg.disconnect("c").await;
    }

    #[tokio::test]
    async fn test_russh_connect_to_refused_port() {
        let config = EngineConfig {
            handshake_timeout_ms: 500,
            ..Default::default()
        };
        let reg = ConnectionRegistry::with_config(config);
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let res = reg
            .connect(connect_params(None, None, &format!("127.0.0.1:{}", port), false))
            .await;
        assert!(!res.result);
        assert_eq!(res.connection_id, "");
        assert!(reg.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn test_russh_connect_to_unroutable_host_is_bounded() {
        let config = EngineConfig {
            handshake_timeout_ms: 300,
            ..Default::default()
        };
        let reg = ConnectionRegistry::with_config(config);

        let started = Instant::now();
        let res = reg
            .connect(connect_params(None, None, "203.0.113.5:22", false))
            .await;
        assert!(!res.result);
        assert_eq!(res.connection_id, "");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
