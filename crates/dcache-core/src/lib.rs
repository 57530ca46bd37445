//! dcache core library
//!
//! Shared data model for the replicated cache: log entries, cluster
//! configuration, snapshots, the replicated command set and the local
//! key-value store the commands are applied to.

pub mod cache;
pub mod command;
pub mod error;
pub mod types;

pub use cache::KvStore;
pub use command::Command;
pub use error::{StorageError, StorageResult};
pub use types::*;
