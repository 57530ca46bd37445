//! Raft consensus for dcache
//!
//! This crate implements the consensus-replicated state machine:
//! - Leader election with persisted term and vote
//! - Log replication with fast conflict back-off
//! - Commit and in-order apply to a [`StateMachine`]
//! - Snapshotting with log compaction and chunked InstallSnapshot
//! - Single-server membership changes through the replicated log

mod applier;
mod consensus;
mod handlers;
mod membership;
mod replication;

pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod message;
pub mod network;
pub mod raft;
pub mod storage;

pub use config::RaftConfig;
pub use error::{RaftError, RaftResult, RemoteError};
pub use event::{RaftEvent, RaftMetrics, Role};
pub use fsm::StateMachine;
pub use message::*;
pub use network::Transport;
pub use raft::{Raft, RaftStorage};
pub use storage::{LogState, LogStore, SnapshotStore, StableStore};
