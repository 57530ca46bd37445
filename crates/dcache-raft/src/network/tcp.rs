//! TCP transport and RPC server

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::RaftCodec;
use super::Transport;
use crate::config::RaftConfig;
use crate::error::{RaftError, RaftResult};
use crate::message::{RaftRequest, RaftResponse};
use crate::raft::Raft;
use dcache_core::Server;

type ClientConn = Framed<TcpStream, RaftCodec<RaftResponse>>;

const MAX_IDLE_PER_PEER: usize = 4;

/// Transport over pooled TCP connections
pub struct TcpTransport {
    /// Request timeout
    timeout: Duration,
    /// Sizes the timeouts of forwarded operations, which wait for commit on the leader
    settings: RaftConfig,
    idle: Mutex<HashMap<String, Vec<ClientConn>>>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            settings: RaftConfig::default(),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Transport with the RPC and forwarding timeouts of `config`
    pub fn with_config(config: &RaftConfig) -> Self {
        Self {
            timeout: config.rpc_timeout,
            settings: config.clone(),
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn checkout(&self, address: &str) -> Option<ClientConn> {
        self.idle.lock().get_mut(address).and_then(Vec::pop)
    }

    fn checkin(&self, address: &str, conn: ClientConn) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(address.to_string()).or_default();
        if conns.len() < MAX_IDLE_PER_PEER {
            conns.push(conn);
        }
    }

    async fn connect(address: &str) -> RaftResult<ClientConn> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RaftError::TransientNetwork(format!("Failed to connect to {}: {}", address, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RaftError::TransientNetwork(e.to_string()))?;
        Ok(Framed::new(stream, RaftCodec::new()))
    }

    async fn exchange(conn: &mut ClientConn, request: RaftRequest) -> RaftResult<RaftResponse> {
        conn.send(request)
            .await
            .map_err(|e| RaftError::TransientNetwork(format!("Failed to send request: {}", e)))?;
        match conn.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(RaftError::TransientNetwork(format!("Failed to read response: {}", e))),
            None => Err(RaftError::TransientNetwork("Connection closed".to_string())),
        }
    }

    async fn round_trip(&self, address: &str, request: RaftRequest) -> RaftResult<RaftResponse> {
        // A pooled connection may have been closed by the peer; retry once on a fresh one.
        if let Some(mut conn) = self.checkout(address) {
            match Self::exchange(&mut conn, request.clone()).await {
                Ok(response) => {
                    self.checkin(address, conn);
                    return Ok(response);
                }
                Err(e) => debug!("Pooled connection to {} failed: {}", address, e),
            }
        }

        let mut conn = Self::connect(address).await?;
        let response = Self::exchange(&mut conn, request).await?;
        self.checkin(address, conn);
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, target: &Server, request: RaftRequest) -> RaftResult<RaftResponse> {
        let timeout = match &request {
            RaftRequest::Forward(forward) => self.settings.forward_timeout(forward),
            _ => self.timeout,
        };
        tokio::time::timeout(timeout, self.round_trip(&target.address, request))
            .await
            .map_err(|_| RaftError::TransientNetwork(format!("Request to {} timed out", target.id)))?
    }
}

/// Raft RPC server - handles incoming RPC requests from peers
pub struct RaftRpcServer {
    listener: TcpListener,
    raft: Raft,
}

impl RaftRpcServer {
    pub async fn bind(address: &str, raft: Raft) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, raft })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!("Raft RPC server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let raft = self.raft.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, raft, shutdown).await;
                            debug!("Raft connection from {} closed", addr);
                        });
                    }
                    Err(e) => warn!("Failed to accept raft connection: {}", e),
                },
            }
        }

        info!("Raft RPC server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, raft: Raft, shutdown: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, RaftCodec::<RaftRequest>::new());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = framed.next() => frame,
        };
        let request = match frame {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                warn!("Failed to decode raft request: {}", e);
                return;
            }
            None => return,
        };

        let response = raft.handle_rpc(request).await;
        if let Err(e) = framed.send(response).await {
            debug!("Failed to send raft response: {}", e);
            return;
        }
    }
}
