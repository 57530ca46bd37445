//! Raft over real TCP connections on localhost

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{init_tracing, test_config};
use dcache_core::{Command, Configuration, KvStore, Server};
use dcache_raft::network::{RaftRpcServer, TcpTransport};
use dcache_raft::*;

struct TcpNode {
    raft: Raft,
    store: KvStore,
}

async fn start_cluster(size: usize, shutdown: &CancellationToken) -> Vec<TcpNode> {
    init_tracing();
    let mut nodes = Vec::new();
    let mut servers = Vec::new();
    for i in 0..size {
        let id = format!("node{}", i);
        let store = KvStore::new();
        let config = test_config(&id);
        let transport = Arc::new(TcpTransport::with_config(&config));
        let raft = Raft::new(config, RaftStorage::in_memory(), transport, Arc::new(store.clone()))
            .await
            .unwrap();
        let server = RaftRpcServer::bind("127.0.0.1:0", raft.clone()).await.unwrap();
        servers.push(Server::voter(id, server.local_addr().unwrap().to_string()));
        tokio::spawn(server.serve(shutdown.clone()));
        nodes.push(TcpNode { raft, store });
    }

    let config = Configuration::new(servers);
    for node in &nodes {
        node.raft.bootstrap(config.clone()).await.unwrap();
    }
    nodes
}

async fn wait_for_leader(nodes: &[TcpNode]) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if node.raft.is_leader().await {
                return i;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected over tcp");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_over_tcp() {
    let shutdown = CancellationToken::new();
    let nodes = start_cluster(3, &shutdown).await;
    let leader = wait_for_leader(&nodes).await;
    let follower = (leader + 1) % nodes.len();

    // Sent to a follower, which forwards it over the same transport
    let mut index = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while index == 0 {
        match nodes[follower].raft.client_write(Command::put("tcp", "works")).await {
            Ok(i) => index = i,
            Err(e) => {
                assert!(Instant::now() < deadline, "forwarded write failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    for node in &nodes {
        node.raft.wait_for_applied(index, Duration::from_secs(5)).await.unwrap();
        assert_eq!(node.store.get("tcp"), "works");
    }

    shutdown.cancel();
    for node in &nodes {
        node.raft.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_unreachable_peer_is_transient() {
    let transport = TcpTransport::new(Duration::from_millis(200));
    // Bind then drop to get a port with nothing listening
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let target = Server::voter("ghost", address);
    let request = RequestVoteRequest {
        term: 1,
        candidate_id: "node0".to_string(),
        last_log_index: 0,
        last_log_term: 0,
    };

    let err = transport.request_vote(&target, request).await.unwrap_err();
    assert!(matches!(err, RaftError::TransientNetwork(_)), "unexpected error: {}", err);
}
