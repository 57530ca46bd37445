use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use dcache_raft::network::MemoryRouter;
use dcache_raft::RaftStorage;
use dcache_server::{create_api, CacheNode, ServerConfig};

fn config(id: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.node.id = id.to_string();
    config.node.raft_addr = format!("mem://{}", id);
    config.raft.election_timeout_min_ms = 150;
    config.raft.election_timeout_max_ms = 300;
    config.raft.heartbeat_interval_ms = 40;
    config.raft.rpc_timeout_ms = 500;
    config.raft.write_timeout_ms = 2000;
    config.raft.learner_catchup_lag = 4;
    config
}

async fn start_node(router: &MemoryRouter, id: &str) -> Arc<CacheNode> {
    let node = CacheNode::new(config(id), RaftStorage::in_memory(), router.transport(id))
        .await
        .unwrap();
    router.register(id, node.raft().clone());
    node
}

async fn leader_node(router: &MemoryRouter) -> Arc<CacheNode> {
    let node = start_node(router, "node0").await;
    node.bootstrap().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !node.raft().is_leader().await {
        assert!(tokio::time::Instant::now() < deadline, "node0 never became leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    node
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_then_get() {
    let router = MemoryRouter::new();
    let app = create_api(leader_node(&router).await);

    let (status, body) = call(&app, "POST", "/v1/value?key=k1&value=v1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, body) = call(&app, "GET", "/v1/value?key=k1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "v1");

    // Routes are also served without the version prefix
    let (_, body) = call(&app, "GET", "/value?key=k1").await;
    assert_eq!(body, "v1");

    let (status, body) = call(&app, "GET", "/value?key=missing").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_without_leader_fails() {
    let router = MemoryRouter::new();
    let node = start_node(&router, "node0").await;
    let app = create_api(node);

    let (status, body) = call(&app, "POST", "/value?key=k&value=v").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("Not the leader"), "unexpected body: {}", body);

    let (_, body) = call(&app, "GET", "/metrics").await;
    assert!(body.contains("dcache_writes_total{outcome=\"not_leader\"} 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_parameter_validation() {
    let router = MemoryRouter::new();
    let app = create_api(leader_node(&router).await);

    let (status, body) = call(&app, "GET", "/v1/join?node=node1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "invaild peerAdress");

    let (status, body) = call(&app, "GET", "/v1/join?peerAddress=mem://node1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "invaild node");

    let (status, body) = call(&app, "GET", "/v1/leave").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "invaild node");

    let (status, _) = call(&app, "GET", "/v1/leave?node=ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_replicates_to_new_node() {
    let router = MemoryRouter::new();
    let leader = leader_node(&router).await;
    let app = create_api(leader.clone());
    for i in 0..5 {
        let (status, _) = call(&app, "POST", &format!("/v1/value?key=key{}&value=value{}", i, i)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let follower = start_node(&router, "node1").await;
    let (status, body) = call(&app, "GET", "/v1/join?peerAddress=mem://node1&node=node1").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "ok"));

    let (status, _) = call(&app, "POST", "/v1/value?key=after&value=join").await;
    assert_eq!(status, StatusCode::OK);

    let applied = leader.raft().applied_index();
    follower
        .raft()
        .wait_for_applied(applied, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(follower.get("key3"), "value3");
    assert_eq!(follower.get("after"), "join");

    let follower_app = create_api(follower.clone());
    let (_, body) = call(&follower_app, "GET", "/v1/value?key=after").await;
    assert_eq!(body, "join");

    // Writes sent to the follower are forwarded to the leader
    let (status, body) = call(&follower_app, "POST", "/v1/value?key=via&value=follower").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "ok"));
    assert_eq!(leader.get("via"), "follower");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_and_metrics() {
    let router = MemoryRouter::new();
    let app = create_api(leader_node(&router).await);
    call(&app, "POST", "/value?key=a&value=1").await;

    let (status, body) = call(&app, "GET", "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["role"], "Leader");
    assert_eq!(json["leader_id"], "node0");
    assert!(json["applied_index"].as_u64().unwrap() >= 3);
    assert_eq!(json["membership"]["servers"][0]["id"], "node0");

    let (status, body) = call(&app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("dcache_raft_leader 1"));
    assert!(body.contains("dcache_raft_term "));
    assert!(body.contains("dcache_writes_total{outcome=\"ok\"} 1"));
}
