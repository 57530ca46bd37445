use dcache_raft::{RaftMetrics, Role};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for a cache node
pub struct NodeMetrics {
    pub registry: Registry,

    // Raft metrics
    pub raft_term: IntGauge,
    pub raft_leader: IntGauge,
    pub commit_index: IntGauge,
    pub applied_index: IntGauge,

    // Write outcomes
    pub writes_total: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let raft_term = IntGauge::new("dcache_raft_term", "Current Raft term number")?;
        registry.register(Box::new(raft_term.clone()))?;

        let raft_leader = IntGauge::new("dcache_raft_leader", "1 if this node is leader, 0 otherwise")?;
        registry.register(Box::new(raft_leader.clone()))?;

        let commit_index = IntGauge::new("dcache_raft_commit_index", "Highest log index known committed")?;
        registry.register(Box::new(commit_index.clone()))?;

        let applied_index = IntGauge::new("dcache_raft_applied_index", "Highest log index applied to the cache")?;
        registry.register(Box::new(applied_index.clone()))?;

        let writes_total = IntCounterVec::new(
            Opts::new("dcache_writes_total", "Client writes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(writes_total.clone()))?;

        Ok(NodeMetrics {
            registry,
            raft_term,
            raft_leader,
            commit_index,
            applied_index,
            writes_total,
        })
    }

    /// Copy the consensus state into the gauges
    pub fn observe(&self, metrics: &RaftMetrics) {
        self.raft_term.set(metrics.current_term as i64);
        self.raft_leader.set(i64::from(metrics.role == Role::Leader));
        self.commit_index.set(metrics.commit_index as i64);
        self.applied_index.set(metrics.applied_index as i64);
    }

    pub fn record_write(&self, outcome: &str) {
        self.writes_total.with_label_values(&[outcome]).inc();
    }

    /// Text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcache_core::Configuration;

    #[test]
    fn test_render_after_observe() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.observe(&RaftMetrics {
            id: "node0".into(),
            role: Role::Leader,
            current_term: 7,
            leader_id: Some("node0".into()),
            commit_index: 42,
            applied_index: 40,
            last_log_index: 42,
            snapshot_index: 0,
            membership: Configuration::default(),
        });
        metrics.record_write("ok");
        metrics.record_write("ok");
        metrics.record_write("not_leader");

        let text = metrics.render().unwrap();
        assert!(text.contains("dcache_raft_term 7"));
        assert!(text.contains("dcache_raft_leader 1"));
        assert!(text.contains("dcache_raft_commit_index 42"));
        assert!(text.contains("dcache_raft_applied_index 40"));
        assert!(text.contains("dcache_writes_total{outcome=\"ok\"} 2"));
        assert!(text.contains("dcache_writes_total{outcome=\"not_leader\"} 1"));
    }
}
