//! Test doubles for the SSH layer
//!
//! `FakeConnector` stands in for russh: each successful connect spawns a
//! `FakeSession` that serves the Handle Owner command channel. Forward-out
//! requests are routed by destination to local TCP servers, an in-memory
//! DNS server, a sink, or refused.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dns::message::tests::answer_for;
use crate::dns::message::TYPE_A;
use crate::ssh::{
    HandleCommand, HandleController, SessionConnector, SshConfig, SshError, Transport,
    TunnelChannel,
};

/// Scripted result of one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    /// Never completes (exercises the handshake timeout)
    Hang,
}

/// How a forward-out destination is served
#[derive(Debug, Clone)]
pub enum Route {
    /// Connect to a real local TCP server
    Tcp(SocketAddr),
    /// DNS-over-TCP server answering every query with this address
    DnsAnswer(Ipv4Addr),
    /// DNS server that reads the query and closes without answering
    DnsEmpty,
    /// Reject the channel open
    Refuse,
}

/// One recorded connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub connection_id: String,
    pub host: String,
    pub port: u16,
    pub direct: bool,
}

type Routes = Arc<Mutex<HashMap<(String, u32), Route>>>;

#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    attempts: Mutex<Vec<Attempt>>,
    sessions: Mutex<Vec<(String, FakeSession)>>,
    routes: Routes,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for attempts against `host`; once exhausted,
    /// attempts succeed
    pub fn script(&self, host: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.scripts
            .lock()
            .entry(host.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Route forward-outs to `host:port` on every session
    pub fn route(&self, host: &str, port: u32, route: Route) {
        self.routes.lock().insert((host.to_string(), port), route);
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    /// Session created by the `index`-th successful connect
    pub fn session(&self, index: usize) -> FakeSession {
        self.sessions.lock()[index].1.clone()
    }

    /// Most recent session of `connection_id`
    pub fn session_for(&self, connection_id: &str) -> Option<FakeSession> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == connection_id)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        connection_id: &str,
        config: &SshConfig,
        transport: Transport,
    ) -> Result<HandleController, SshError> {
        self.attempts.lock().push(Attempt {
            connection_id: connection_id.to_string(),
            host: config.host.clone(),
            port: config.port,
            direct: transport.is_direct(),
        });

        let outcome = self
            .scripts
            .lock()
            .get_mut(&config.host)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => {
                let (session, controller) = FakeSession::spawn(self.routes.clone());
                self.sessions
                    .lock()
                    .push((connection_id.to_string(), session));
                Ok(controller)
            }
            Outcome::Fail => Err(SshError::ConnectionFailed(format!(
                "connection refused by {}",
                config.address()
            ))),
            Outcome::Hang => std::future::pending::<Result<HandleController, SshError>>().await,
        }
    }
}

/// Server side of a fake session
#[derive(Clone)]
pub struct FakeSession {
    requests: Arc<Mutex<Vec<(String, u32)>>>,
    kill: CancellationToken,
}

impl FakeSession {
    fn spawn(routes: Routes) -> (Self, HandleController) {
        let (tx, mut rx) = mpsc::channel::<HandleCommand>(16);
        let session = Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            kill: CancellationToken::new(),
        };

        let requests = session.requests.clone();
        let kill = session.kill.clone();
        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = kill.cancelled() => break,
                    cmd = rx.recv() => cmd,
                };
                match cmd {
                    Some(HandleCommand::ForwardOut {
                        host,
                        port,
                        reply_tx,
                        ..
                    }) => {
                        requests.lock().push((host.clone(), port));
                        let route = routes.lock().get(&(host.clone(), port)).cloned();
                        let _ = reply_tx.send(open_route(route, &host, port).await);
                    }
                    Some(HandleCommand::Disconnect) | None => break,
                }
            }
            // receiver dropped here: controllers observe the loss
        });

        (session, HandleController::new(tx))
    }

    /// Forward-out destinations requested so far
    pub fn requests(&self) -> Vec<(String, u32)> {
        self.requests.lock().clone()
    }

    /// Simulate transport loss
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

async fn open_route(route: Option<Route>, host: &str, port: u32) -> Result<TunnelChannel, SshError> {
    match route {
        Some(Route::Tcp(addr)) => {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream))
        }
        Some(Route::DnsAnswer(addr)) => {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let Some(query) = read_dns_query(&mut far).await else {
                    return;
                };
                let resp = answer_for(&query, &[(TYPE_A, addr.octets().to_vec())]);
                let _ = far.write_all(&(resp.len() as u16).to_be_bytes()).await;
                let _ = far.write_all(&resp).await;
            });
            Ok(Box::new(near))
        }
        Some(Route::DnsEmpty) => {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let _ = read_dns_query(&mut far).await;
            });
            Ok(Box::new(near))
        }
        Some(Route::Refuse) => Err(SshError::ChannelError(format!(
            "forward-out to {}:{} refused",
            host, port
        ))),
        // unrouted destinations accept and discard everything
        None => {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = far.read_to_end(&mut sink).await;
            });
            Ok(Box::new(near))
        }
    }
}

async fn read_dns_query(stream: &mut tokio::io::DuplexStream) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.ok()?;
    let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut query).await.ok()?;
    Some(query)
}

/// TCP server that echoes every connection back
pub async fn echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}
