//! Per-follower replication task
//!
//! Each follower gets one replicator while this node leads. A replicator has at
//! most one RPC outstanding: it sends AppendEntries (or snapshot chunks when the
//! follower is behind the compacted prefix), waits for the answer, and then
//! either continues immediately or waits for new entries or the heartbeat.

use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consensus::{Progress, RaftCore};
use crate::error::{RaftError, RaftResult};
use crate::event::Role;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest};
use crate::raft::Raft;
use crate::storage::term_at;
use dcache_core::{Server, Snapshot};

/// Consecutive failures after which a removed server is given up on
const RETIRE_AFTER_FAILURES: u32 = 3;

enum Step {
    /// Send again right away
    More,
    /// Wait for new entries or the next heartbeat
    Idle,
    Stop,
}

enum Plan {
    Append(AppendEntriesRequest),
    Snapshot,
}

/// Snapshot being streamed to the follower
struct Transfer {
    snapshot: Snapshot,
    offset: u64,
}

pub(crate) struct Replicator {
    raft: Raft,
    target: Server,
    term: u64,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    transfer: Option<Transfer>,
    failures: u32,
}

impl Replicator {
    pub(crate) fn new(raft: Raft, target: Server, term: u64, notify: Arc<Notify>, cancel: CancellationToken) -> Self {
        Self {
            raft,
            target,
            term,
            notify,
            cancel,
            transfer: None,
            failures: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Replicating to {} for term {}", self.target.id, self.term);
        let heartbeat = self.raft.shared.config.heartbeat_interval;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let step = match self.replicate_once().await {
                Ok(step) => {
                    self.failures = 0;
                    step
                }
                Err(e) => {
                    self.failures += 1;
                    debug!("Replication to {} failed ({} in a row): {}", self.target.id, self.failures, e);
                    Step::Idle
                }
            };

            match step {
                Step::More => continue,
                Step::Stop => break,
                Step::Idle => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }
        debug!("Replicator for {} stopped", self.target.id);
    }

    async fn replicate_once(&mut self) -> RaftResult<Step> {
        let plan = {
            let mut guard = self.raft.shared.core.lock().await;
            self.plan(&mut guard)?
        };

        match plan {
            None => Ok(Step::Stop),
            Some(Plan::Append(request)) => {
                self.transfer = None;
                let prev_index = request.prev_log_index;
                let response = self.raft.shared.transport.append_entries(&self.target, request).await?;
                let mut guard = self.raft.shared.core.lock().await;
                self.on_append_response(&mut guard, prev_index, response)
            }
            Some(Plan::Snapshot) => self.send_snapshot_chunk().await,
        }
    }

    /// Decide what to send next. `None` means this replicator should exit.
    fn plan(&self, core: &mut RaftCore) -> RaftResult<Option<Plan>> {
        if core.role != Role::Leader || core.hard.current_term != self.term {
            return Ok(None);
        }
        let last_index = core.last_log.index;
        let leader_commit = core.commit_index;
        let config_index = core.membership.latest_index();
        let is_member = core.membership.latest().map_or(false, |c| c.contains(&self.target.id));
        let Some(leader) = core.leader.as_mut() else {
            return Ok(None);
        };

        let progress = *leader.progress.entry(self.target.id.clone()).or_insert(Progress {
            next_index: last_index + 1,
            match_index: 0,
        });

        if !is_member && (progress.match_index >= config_index || self.failures >= RETIRE_AFTER_FAILURES) {
            info!("Stopped replicating to removed server {}", self.target.id);
            leader.progress.remove(&self.target.id);
            leader.replicators.remove(&self.target.id);
            return Ok(None);
        }

        let log = &*self.raft.shared.log;
        let next_index = progress.next_index.min(last_index + 1).max(1);
        let prev_index = next_index - 1;
        if prev_index < log.state()?.last_purged.index {
            return Ok(Some(Plan::Snapshot));
        }
        let Some(prev_log_term) = term_at(log, prev_index)? else {
            return Ok(Some(Plan::Snapshot));
        };

        let hi = (last_index + 1).min(next_index + self.raft.shared.config.max_append_entries as u64);
        let entries = log.range(next_index, hi)?;

        Ok(Some(Plan::Append(AppendEntriesRequest {
            term: self.term,
            leader_id: self.raft.shared.id.clone(),
            prev_log_index: prev_index,
            prev_log_term,
            entries,
            leader_commit,
        })))
    }

    /// Step down on a newer term; otherwise return whether we still lead in our term
    fn still_leading(&self, core: &mut RaftCore, remote_term: u64) -> RaftResult<bool> {
        if remote_term > core.hard.current_term {
            let conflict = RaftError::TermConflict {
                local: core.hard.current_term,
                remote: remote_term,
            };
            info!("Follower {} reported a newer term: {}", self.target.id, conflict);
            self.raft.become_follower(core, remote_term, None)?;
            return Ok(false);
        }
        Ok(core.role == Role::Leader && core.hard.current_term == self.term)
    }

    fn on_append_response(
        &self,
        core: &mut RaftCore,
        prev_index: u64,
        response: AppendEntriesResponse,
    ) -> RaftResult<Step> {
        if !self.still_leading(core, response.term)? {
            return Ok(Step::Stop);
        }
        let last_index = core.last_log.index;
        let Some(progress) = core
            .leader
            .as_mut()
            .and_then(|leader| leader.progress.get_mut(&self.target.id))
        else {
            return Ok(Step::Stop);
        };

        if response.success {
            progress.match_index = progress.match_index.max(response.last_log_index);
            progress.next_index = progress.match_index + 1;
            let more = progress.next_index <= last_index;
            self.raft.advance_commit(core)?;
            return Ok(if more { Step::More } else { Step::Idle });
        }

        let retry_from = match response.conflict_term {
            Some(term) => self
                .last_index_of_term(term, prev_index)?
                .map(|index| index + 1)
                .unwrap_or(response.conflict_index),
            None => response.conflict_index,
        };
        let previous = progress.next_index;
        progress.next_index = retry_from.min(prev_index).max(progress.match_index + 1).max(1);
        debug!(
            "Follower {} rejected entries after {}, retrying from {}",
            self.target.id, prev_index, progress.next_index
        );
        Ok(if progress.next_index < previous { Step::More } else { Step::Idle })
    }

    /// Last index at or below `from` whose entry has `term`
    fn last_index_of_term(&self, term: u64, from: u64) -> RaftResult<Option<u64>> {
        let log = &*self.raft.shared.log;
        let floor = log.state()?.last_purged.index;
        let mut index = from;
        while index > floor {
            match term_at(log, index)? {
                Some(t) if t == term => return Ok(Some(index)),
                Some(t) if t < term => return Ok(None),
                _ => index -= 1,
            }
        }
        Ok(None)
    }

    async fn send_snapshot_chunk(&mut self) -> RaftResult<Step> {
        if self.transfer.is_none() {
            let snapshot = self
                .raft
                .shared
                .snapshots
                .latest()?
                .ok_or_else(|| RaftError::SnapshotIo("no snapshot available to send".to_string()))?;
            info!(
                "Sending snapshot {} ({} bytes) to {}",
                snapshot.meta.last_included,
                snapshot.data.len(),
                self.target.id
            );
            self.transfer = Some(Transfer { snapshot, offset: 0 });
        }
        let Some(transfer) = self.transfer.as_ref() else {
            return Ok(Step::Idle);
        };

        let len = transfer.snapshot.data.len();
        let start = (transfer.offset as usize).min(len);
        let end = (start + self.raft.shared.config.snapshot_chunk_size).min(len);
        let done = end == len;
        let last_included = transfer.snapshot.meta.last_included;
        let request = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.raft.shared.id.clone(),
            meta: transfer.snapshot.meta.clone(),
            offset: start as u64,
            data: transfer.snapshot.data[start..end].to_vec(),
            done,
        };

        // On error the transfer keeps its offset and the same chunk is retried
        let response = self.raft.shared.transport.install_snapshot(&self.target, request).await?;

        let mut guard = self.raft.shared.core.lock().await;
        let core = &mut *guard;
        if !self.still_leading(core, response.term)? {
            return Ok(Step::Stop);
        }

        if response.next_offset != end as u64 {
            let resume = if response.next_offset as usize <= len { response.next_offset } else { 0 };
            debug!("Follower {} expects snapshot offset {}", self.target.id, resume);
            let progressed = resume != start as u64;
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.offset = resume;
            }
            return Ok(if progressed { Step::More } else { Step::Idle });
        }
        if !done {
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.offset = end as u64;
            }
            return Ok(Step::More);
        }

        self.transfer = None;
        let last_index = core.last_log.index;
        let Some(progress) = core
            .leader
            .as_mut()
            .and_then(|leader| leader.progress.get_mut(&self.target.id))
        else {
            return Ok(Step::Stop);
        };
        progress.match_index = progress.match_index.max(last_included.index);
        progress.next_index = progress.match_index + 1;
        let more = progress.next_index <= last_index;
        info!("Follower {} installed snapshot {}", self.target.id, last_included);

        self.raft.advance_commit(core)?;
        Ok(if more { Step::More } else { Step::Idle })
    }
}
