//! A cache node: the replicated store, its Raft instance and the RPC listener

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::metrics::NodeMetrics;
use dcache_core::{Command, Configuration, KvStore, Server};
use dcache_raft::network::{RaftRpcServer, TcpTransport};
use dcache_raft::{Raft, RaftError, RaftEvent, RaftMetrics, RaftResult, RaftStorage, Transport};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CacheNode {
    config: ServerConfig,
    raft: Raft,
    store: KvStore,
    metrics: NodeMetrics,
    /// Address peers use to reach this node's Raft listener
    raft_addr: String,
    shutdown: CancellationToken,
}

impl CacheNode {
    /// Start a node on disk with a TCP transport, then bootstrap or join as configured
    pub async fn start(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let data_dir = config.data_dir();
        let storage = dcache_storage::open_storage(&data_dir, config.raft.snapshot_retain)
            .with_context(|| format!("failed to open storage in {:?}", data_dir))?;

        let transport = TcpTransport::with_config(&config.raft_config());

        let node = Self::new(config, storage, Arc::new(transport)).await?;

        let server = RaftRpcServer::bind(&node.config.node.raft_addr, node.raft.clone())
            .await
            .with_context(|| format!("failed to bind raft address {}", node.config.node.raft_addr))?;
        let shutdown = node.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(shutdown).await {
                error!("Raft RPC server error: {}", e);
            }
        });

        if node.config.node.bootstrap {
            node.bootstrap().await?;
        }
        if let Some(join_addr) = node.config.node.join.clone() {
            node.join_cluster(&join_addr).await?;
        }
        Ok(node)
    }

    /// Create a node over the given storage and transport without listening for RPCs
    pub async fn new(
        config: ServerConfig,
        storage: RaftStorage,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = KvStore::new();
        let raft = Raft::new(config.raft_config(), storage, transport, Arc::new(store.clone())).await?;

        let node = Arc::new(CacheNode {
            raft_addr: config.node.raft_addr.clone(),
            config,
            raft,
            store,
            metrics: NodeMetrics::new()?,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(node.clone().monitor());

        info!("Cache node {} started", node.id());
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.config.node.id
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Fires when the node stops, either on request or after a fatal error
    pub fn stopped(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Log leadership changes and stop the node on a fatal error
    async fn monitor(self: Arc<Self>) {
        let mut events = self.raft.subscribe();
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(RaftEvent::BecameLeader { term }) => {
                    info!(leader = true, term, "leader change");
                    self.metrics.raft_leader.set(1);
                }
                Ok(RaftEvent::BecameFollower { term, leader }) => {
                    info!(leader = false, term, new_leader = ?leader, "leader change");
                    self.metrics.raft_leader.set(0);
                }
                Ok(RaftEvent::Fatal { reason }) => {
                    error!("Stopping node {}: {}", self.id(), reason);
                    self.shutdown.cancel();
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} raft events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Bootstrap a single-node cluster unless this node already has state
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let metrics = self.raft.metrics().await;
        if metrics.current_term > 0 || metrics.last_log_index > 0 {
            info!("Node {} already initialized, skipping bootstrap", self.id());
            return Ok(());
        }
        let configuration = Configuration::new(vec![Server::voter(self.id(), self.raft_addr.clone())]);
        self.raft.bootstrap(configuration).await?;
        Ok(())
    }

    /// Ask the node serving HTTP at `join_addr` to add this node as a voter
    pub async fn join_cluster(&self, join_addr: &str) -> anyhow::Result<()> {
        let url = format!("http://{}/v1/join", join_addr);
        info!("Joining cluster through {}", url);

        let client = reqwest::Client::builder().timeout(JOIN_TIMEOUT).build()?;
        let body = client
            .get(&url)
            .query(&[("peerAddress", self.raft_addr.as_str()), ("node", self.id())])
            .send()
            .await?
            .text()
            .await?;
        if body != "ok" {
            bail!("error joining cluster: {}", body);
        }
        info!("Node {} joined the cluster", self.id());
        Ok(())
    }

    /// Value of `key` in the local cache, empty if absent
    pub fn get(&self, key: &str) -> String {
        self.store.get(key)
    }

    /// Replicate a write. Returns once it is committed and applied.
    pub async fn put(&self, key: &str, value: &str) -> RaftResult<u64> {
        let result = self.raft.client_write(Command::put(key, value)).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(RaftError::NotLeader { .. }) => "not_leader",
            Err(e) if e.is_ambiguous() => "ambiguous",
            Err(_) => "error",
        };
        self.metrics.record_write(outcome);
        if let Err(e) = &result {
            error!("raft apply error: {}", e);
        }
        result
    }

    /// Add `node` at raft address `address` as a voter
    pub async fn add_voter(&self, node: &str, address: &str) -> RaftResult<u64> {
        let result = self.raft.add_voter(node, address).await;
        if let Err(e) = &result {
            error!("raft add voter failed: {}", e);
        }
        result
    }

    pub async fn remove_server(&self, node: &str) -> RaftResult<u64> {
        self.raft.remove_server(node).await
    }

    /// Current consensus state, also copied into the Prometheus gauges
    pub async fn status(&self) -> RaftMetrics {
        let metrics = self.raft.metrics().await;
        self.metrics.observe(&metrics);
        metrics
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.raft.shutdown().await?;
        info!("Cache node {} stopped", self.id());
        Ok(())
    }
}
