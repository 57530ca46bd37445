use dcache_raft::RaftConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node: NodeConfig,
    pub raft: RaftSettings,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub http_addr: String,
    pub raft_addr: String,
    /// Defaults to `./data/<id>`
    pub data_dir: Option<PathBuf>,
    /// Initialize a new single-node cluster if this node has no state
    pub bootstrap: bool,
    /// HTTP address of a cluster member to join through
    pub join: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
    pub trailing_logs: u64,
    pub max_append_entries: usize,
    pub snapshot_chunk_size: usize,
    pub learner_catchup_lag: u64,
    pub learner_catchup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: "node0".to_string(),
            http_addr: "127.0.0.1:6000".to_string(),
            raft_addr: "127.0.0.1:7000".to_string(),
            data_dir: None,
            bootstrap: false,
            join: None,
        }
    }
}

impl Default for RaftSettings {
    fn default() -> Self {
        let defaults = RaftConfig::default();
        RaftSettings {
            election_timeout_min_ms: defaults.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: defaults.election_timeout_max.as_millis() as u64,
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            rpc_timeout_ms: defaults.rpc_timeout.as_millis() as u64,
            write_timeout_ms: defaults.apply_timeout.as_millis() as u64,
            snapshot_interval_secs: defaults.snapshot_interval.as_secs(),
            snapshot_threshold: defaults.snapshot_threshold,
            snapshot_retain: dcache_storage::DEFAULT_RETAIN,
            trailing_logs: defaults.trailing_logs,
            max_append_entries: defaults.max_append_entries,
            snapshot_chunk_size: defaults.snapshot_chunk_size,
            learner_catchup_lag: defaults.learner_catchup_lag,
            learner_catchup_timeout_ms: defaults.learner_catchup_timeout.as_millis() as u64,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.node
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data").join(&self.node.id))
    }

    pub fn raft_config(&self) -> RaftConfig {
        let raft = &self.raft;
        RaftConfig {
            node_id: self.node.id.clone(),
            election_timeout_min: Duration::from_millis(raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(raft.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(raft.rpc_timeout_ms),
            apply_timeout: Duration::from_millis(raft.write_timeout_ms),
            snapshot_interval: Duration::from_secs(raft.snapshot_interval_secs),
            snapshot_threshold: raft.snapshot_threshold,
            trailing_logs: raft.trailing_logs,
            max_append_entries: raft.max_append_entries,
            snapshot_chunk_size: raft.snapshot_chunk_size,
            learner_catchup_lag: raft.learner_catchup_lag,
            learner_catchup_timeout: Duration::from_millis(raft.learner_catchup_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.node.http_addr, "127.0.0.1:6000");
        assert_eq!(config.node.raft_addr, "127.0.0.1:7000");
        assert_eq!(config.data_dir(), PathBuf::from("./data/node0"));

        let raft = config.raft_config();
        assert_eq!(raft.snapshot_interval, Duration::from_secs(30));
        assert_eq!(raft.snapshot_threshold, 5);
        assert_eq!(raft.apply_timeout, Duration::from_secs(5));
        raft.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
node:
  id: node2
  raft_addr: 10.0.0.2:7000
raft:
  snapshot_threshold: 100
monitoring:
  json_logs: true
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.node.id, "node2");
        assert_eq!(config.node.http_addr, "127.0.0.1:6000");
        assert_eq!(config.data_dir(), PathBuf::from("./data/node2"));
        assert_eq!(config.raft.snapshot_threshold, 100);
        assert_eq!(config.raft.snapshot_retain, 2);
        assert!(config.monitoring.json_logs);
        assert_eq!(config.monitoring.log_level, "info");
        assert_eq!(config.raft_config().node_id, "node2");
    }

    #[test]
    fn test_zero_snapshot_interval_is_rejected() {
        let config: ServerConfig = serde_yaml::from_str("raft:\n  snapshot_interval_secs: 0\n").unwrap();
        assert!(config.raft_config().validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dcache.yaml");
        std::fs::write(&path, "node:\n  data_dir: /var/lib/dcache\n  bootstrap: true\n").unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert!(config.node.bootstrap);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/dcache"));
    }
}
