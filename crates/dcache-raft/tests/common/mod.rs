//! Test harness for in-process clusters connected by a `MemoryRouter`

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use dcache_core::{Command, Configuration, KvStore, Server};
use dcache_raft::network::MemoryRouter;
use dcache_raft::{Raft, RaftConfig, RaftStorage, Role};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast timings for tests
pub fn test_config(id: &str) -> RaftConfig {
    RaftConfig {
        node_id: id.to_string(),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(40),
        rpc_timeout: Duration::from_millis(500),
        apply_timeout: Duration::from_secs(2),
        snapshot_interval: Duration::from_secs(60),
        snapshot_threshold: 1000,
        trailing_logs: 0,
        max_append_entries: 64,
        snapshot_chunk_size: 64 * 1024,
        learner_catchup_lag: 4,
        learner_catchup_timeout: Duration::from_secs(5),
    }
}

pub fn address(id: &str) -> String {
    format!("mem://{}", id)
}

pub struct TestNode {
    pub raft: Raft,
    pub store: KvStore,
    pub storage: RaftStorage,
}

/// Manages a cluster of in-process Raft nodes
pub struct TestCluster {
    pub router: MemoryRouter,
    pub nodes: BTreeMap<String, TestNode>,
    configure: fn(&str) -> RaftConfig,
}

impl TestCluster {
    /// Start `size` voters, all bootstrapped with the same configuration
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, test_config).await
    }

    pub async fn with_config(size: usize, configure: fn(&str) -> RaftConfig) -> Self {
        init_tracing();
        let mut cluster = Self {
            router: MemoryRouter::new(),
            nodes: BTreeMap::new(),
            configure,
        };

        let ids: Vec<String> = (0..size).map(|i| format!("node{}", i)).collect();
        let config = Configuration::new(ids.iter().map(|id| Server::voter(id.clone(), address(id))).collect());
        for id in &ids {
            let raft = cluster.start_node(id, RaftStorage::in_memory()).await;
            raft.bootstrap(config.clone()).await.unwrap();
        }
        cluster
    }

    /// Start a node on `storage` and connect it to the router
    pub async fn start_node(&mut self, id: &str, storage: RaftStorage) -> Raft {
        let store = KvStore::new();
        let raft = Raft::new(
            (self.configure)(id),
            storage.clone(),
            self.router.transport(id),
            Arc::new(store.clone()),
        )
        .await
        .unwrap();
        self.router.register(id, raft.clone());
        self.nodes.insert(
            id.to_string(),
            TestNode {
                raft: raft.clone(),
                store,
                storage,
            },
        );
        raft
    }

    /// Shut a node down and disconnect it; its storage survives in the returned node
    pub async fn stop_node(&mut self, id: &str) -> TestNode {
        let node = self.nodes.remove(id).unwrap();
        self.router.remove(id);
        node.raft.shutdown().await.unwrap();
        node
    }

    pub fn raft(&self, id: &str) -> &Raft {
        &self.nodes[id].raft
    }

    pub fn store(&self, id: &str) -> &KvStore {
        &self.nodes[id].store
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Wait until every node in `among` agrees on one leader in one term
    pub async fn wait_for_leader(&self, among: &[&str], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.agreed_leader(among).await {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader agreed among {:?}", among);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn agreed_leader(&self, among: &[&str]) -> Option<String> {
        let mut agreed: Option<(String, u64)> = None;
        for id in among {
            let metrics = self.raft(id).metrics().await;
            let leader = metrics.leader_id?;
            match &agreed {
                None => agreed = Some((leader, metrics.current_term)),
                Some((l, term)) if *l == leader && *term == metrics.current_term => {}
                Some(_) => return None,
            }
        }
        let (leader, _) = agreed?;
        if !among.contains(&leader.as_str()) {
            return None;
        }
        (self.raft(&leader).metrics().await.role == Role::Leader).then_some(leader)
    }

    pub async fn wait_for_any_leader(&self, timeout: Duration) -> String {
        let ids = self.ids();
        let among: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.wait_for_leader(&among, timeout).await
    }

    /// Write through the current leader, retrying across leader changes
    pub async fn write(&self, key: &str, value: &str) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader = self.wait_for_any_leader(Duration::from_secs(5)).await;
            match self.raft(&leader).client_write(Command::put(key, value)).await {
                Ok(index) => return index,
                Err(e) => {
                    assert!(Instant::now() < deadline, "write {}={} kept failing: {}", key, value, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    pub async fn wait_applied(&self, among: &[&str], index: u64) {
        for id in among {
            self.raft(id)
                .wait_for_applied(index, Duration::from_secs(5))
                .await
                .unwrap_or_else(|e| panic!("{} did not apply {}: {}", id, index, e));
        }
    }
}
