//! In-process transport for multi-node tests
//!
//! Routes requests directly to registered [`Raft`] handles and can simulate
//! partitions, latency and duplicate delivery.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::Transport;
use crate::error::{RaftError, RaftResult};
use crate::message::{RaftRequest, RaftResponse};
use crate::raft::Raft;
use dcache_core::{NodeId, Server};

#[derive(Default)]
struct RouterInner {
    nodes: RwLock<HashMap<NodeId, Raft>>,
    isolated: RwLock<HashSet<NodeId>>,
    delay: RwLock<Option<(Duration, Duration)>>,
    duplicate_rate: RwLock<f64>,
}

/// Shared switchboard connecting in-process nodes
#[derive(Clone, Default)]
pub struct MemoryRouter {
    inner: Arc<RouterInner>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport used by node `from`
    pub fn transport(&self, from: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            from: from.into(),
            router: self.clone(),
        })
    }

    pub fn register(&self, id: impl Into<NodeId>, raft: Raft) {
        self.inner.nodes.write().insert(id.into(), raft);
    }

    pub fn remove(&self, id: &str) -> Option<Raft> {
        self.inner.nodes.write().remove(id)
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: &str) {
        self.inner.isolated.write().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.inner.isolated.write().remove(id);
    }

    /// Delay every delivery by a random duration in `min..=max`
    pub fn set_delay(&self, min: Duration, max: Duration) {
        *self.inner.delay.write() = Some((min, max));
    }

    /// Deliver each request a second time with probability `rate`
    pub fn set_duplicate_rate(&self, rate: f64) {
        *self.inner.duplicate_rate.write() = rate.clamp(0.0, 1.0);
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        let isolated = self.inner.isolated.read();
        !isolated.contains(from) && !isolated.contains(to)
    }

    fn pick_delay(&self) -> Option<Duration> {
        let (min, max) = (*self.inner.delay.read())?;
        if max <= min {
            return Some(min);
        }
        Some(rand::thread_rng().gen_range(min..=max))
    }

    fn should_duplicate(&self) -> bool {
        let rate = *self.inner.duplicate_rate.read();
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}

/// Transport handle bound to one sending node
pub struct MemoryTransport {
    from: NodeId,
    router: MemoryRouter,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, target: &Server, request: RaftRequest) -> RaftResult<RaftResponse> {
        let unreachable = || RaftError::TransientNetwork(format!("{} is unreachable from {}", target.id, self.from));

        if !self.router.reachable(&self.from, &target.id) {
            return Err(unreachable());
        }
        let raft = self
            .router
            .inner
            .nodes
            .read()
            .get(&target.id)
            .cloned()
            .ok_or_else(unreachable)?;

        if let Some(delay) = self.router.pick_delay() {
            tokio::time::sleep(delay).await;
        }

        if self.router.should_duplicate() {
            let duplicate = raft.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let _ = duplicate.handle_rpc(request).await;
            });
        }

        let response = raft.handle_rpc(request).await;

        // A partition may have formed while the request was in flight
        if !self.router.reachable(&self.from, &target.id) {
            return Err(unreachable());
        }
        Ok(response)
    }
}
