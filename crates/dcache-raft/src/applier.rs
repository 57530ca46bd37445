//! FSM applier
//!
//! The only consumer of the commit stream. Applies committed entries in index
//! order, resolves waiting proposers, takes snapshots and compacts the log.
//! Never touches the consensus lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{RaftError, RaftResult};
use crate::fsm::{Decoded, StateMachine};
use crate::raft::Shared;
use crate::storage::term_at;
use dcache_core::{Configuration, LogEntry, LogId, Snapshot, SnapshotMeta, StorageError};

const APPLY_BATCH: u64 = 128;

pub(crate) enum ApplierMsg {
    /// Replace the state machine with a snapshot received from the leader
    Install {
        snapshot: Snapshot,
        ack: oneshot::Sender<RaftResult<()>>,
    },
    /// Take a snapshot now
    Snapshot {
        ack: oneshot::Sender<RaftResult<Option<LogId>>>,
    },
}

pub(crate) struct Applier {
    shared: Arc<Shared>,
    fsm: Arc<dyn StateMachine>,
    rx: mpsc::UnboundedReceiver<ApplierMsg>,
    commit_rx: watch::Receiver<u64>,
    applied_tx: watch::Sender<u64>,
    applied: LogId,
    /// Configuration in effect at `applied`, with the index that carried it
    config: (u64, Configuration),
    last_snapshot: LogId,
}

impl Applier {
    pub(crate) fn new(
        shared: Arc<Shared>,
        fsm: Arc<dyn StateMachine>,
        rx: mpsc::UnboundedReceiver<ApplierMsg>,
        commit_rx: watch::Receiver<u64>,
        applied_tx: watch::Sender<u64>,
        applied: LogId,
        config: (u64, Configuration),
    ) -> Self {
        Self {
            shared,
            fsm,
            rx,
            commit_rx,
            applied_tx,
            applied,
            config,
            last_snapshot: applied,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut interval = tokio::time::interval(self.shared.config.snapshot_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                changed = self.commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if self.applied.index > self.last_snapshot.index {
                        if let Err(e) = self.take_snapshot() {
                            self.shared.fatal(e.to_string());
                            break;
                        }
                    }
                }
            }

            if let Err(e) = self.apply_committed() {
                self.shared.fatal(e.to_string());
                break;
            }
        }
        debug!("Applier for {} stopped at {}", self.shared.id, self.applied);
    }

    fn handle(&mut self, msg: ApplierMsg) {
        match msg {
            ApplierMsg::Install { snapshot, ack } => {
                let result = self.install(snapshot);
                if let Err(e) = &result {
                    self.shared.fatal(e.to_string());
                }
                let _ = ack.send(result);
            }
            ApplierMsg::Snapshot { ack } => {
                let result = self.take_snapshot();
                if let Err(e) = &result {
                    self.shared.fatal(e.to_string());
                }
                let _ = ack.send(result);
            }
        }
    }

    /// Apply every committed entry, then snapshot if the threshold is reached
    fn apply_committed(&mut self) -> RaftResult<()> {
        loop {
            let commit = *self.commit_rx.borrow_and_update();
            if self.applied.index >= commit {
                break;
            }

            let lo = self.applied.index + 1;
            let hi = commit.min(self.applied.index + APPLY_BATCH) + 1;
            let entries = self.shared.log.range(lo, hi)?;
            if entries.is_empty() {
                // A snapshot install is replacing this range; it arrives as a message
                warn!("Committed entries {}..{} are not in the log", lo, hi);
                break;
            }
            for entry in &entries {
                self.apply_entry(entry);
            }
            self.applied_tx.send_replace(self.applied.index);
        }

        if self.applied.index.saturating_sub(self.last_snapshot.index) >= self.shared.config.snapshot_threshold {
            self.take_snapshot()?;
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: &LogEntry) {
        match Decoded::decode(entry) {
            Ok(Decoded::Blank) => {}
            Ok(Decoded::Command(command)) => self.fsm.apply(&command),
            Ok(Decoded::Configuration(config)) => self.config = (entry.index, config),
            Err(e) => warn!("Skipping entry {}: {}", entry.index, e),
        }
        self.applied = entry.log_id();
        self.resolve(entry.index, entry.term);
    }

    /// Answer the proposer of `index`, if any
    fn resolve(&self, index: u64, term: u64) {
        let Some(waiter) = self.shared.waiters.lock().remove(&index) else {
            return;
        };
        let result = if waiter.term == term {
            Ok(index)
        } else {
            Err(RaftError::LeadershipLost { index })
        };
        let _ = waiter.tx.send(result);
    }

    fn install(&mut self, snapshot: Snapshot) -> RaftResult<()> {
        let meta = snapshot.meta;
        let id = meta.last_included;
        if id.index <= self.applied.index {
            return Ok(());
        }

        self.fsm
            .restore(&snapshot.data)
            .map_err(|e| RaftError::SnapshotIo(format!("failed to restore snapshot {}: {}", id, e)))?;

        self.applied = id;
        self.config = (meta.configuration_index, meta.configuration);
        self.last_snapshot = id;
        self.shared.snapshot_index.store(id.index, Ordering::Relaxed);

        // Proposals covered by the snapshot cannot be matched to their entries
        let covered: Vec<_> = {
            let mut waiters = self.shared.waiters.lock();
            let indexes: Vec<u64> = waiters.keys().copied().filter(|i| *i <= id.index).collect();
            indexes.into_iter().filter_map(|i| waiters.remove(&i).map(|w| (i, w))).collect()
        };
        for (index, waiter) in covered {
            let _ = waiter.tx.send(Err(RaftError::LeadershipLost { index }));
        }

        self.applied_tx.send_replace(id.index);
        info!("Node {} restored state machine from snapshot {}", self.shared.id, id);
        Ok(())
    }

    /// Snapshot the state machine at the applied index and compact the log
    fn take_snapshot(&mut self) -> RaftResult<Option<LogId>> {
        if self.applied.index == 0 || self.applied.index <= self.last_snapshot.index {
            return Ok(None);
        }

        let data = self
            .fsm
            .snapshot()
            .map_err(|e| RaftError::SnapshotIo(format!("failed to serialize state: {}", e)))?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included: self.applied,
                configuration: self.config.1.clone(),
                configuration_index: self.config.0,
            },
            data,
        };
        self.shared
            .snapshots
            .save(&snapshot)
            .map_err(|e| RaftError::SnapshotIo(format!("failed to persist snapshot {}: {}", self.applied, e)))?;

        self.last_snapshot = self.applied;
        self.shared.snapshot_index.store(self.applied.index, Ordering::Relaxed);
        info!(
            "Node {} took snapshot {} ({} bytes)",
            self.shared.id,
            self.applied,
            snapshot.data.len()
        );

        self.compact_log()?;
        Ok(Some(self.applied))
    }

    /// Drop log entries covered by the snapshot, keeping `trailing_logs` behind it
    fn compact_log(&self) -> RaftResult<()> {
        let log = &*self.shared.log;
        let upto = self.applied.index.saturating_sub(self.shared.config.trailing_logs);
        if upto <= log.state()?.last_purged.index {
            return Ok(());
        }
        let term = term_at(log, upto)?
            .ok_or_else(|| StorageError::Corrupt(format!("entry {} missing during compaction", upto)))?;
        log.truncate_prefix(LogId::new(term, upto))?;
        debug!("Node {} compacted log through {}", self.shared.id, upto);
        Ok(())
    }
}
