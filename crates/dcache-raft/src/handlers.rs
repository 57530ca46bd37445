//! Follower-side RPC handlers

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::applier::ApplierMsg;
use crate::consensus::{IncomingSnapshot, RaftCore};
use crate::error::{RaftError, RaftResult};
use crate::event::Role;
use crate::message::*;
use crate::raft::{align_log_to_snapshot, Raft};
use crate::storage::term_at;
use dcache_core::{Configuration, EntryKind, LogEntry, Snapshot};

impl Raft {
    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RaftResult<RequestVoteResponse> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if core.shutting_down {
            return Err(RaftError::ShuttingDown);
        }

        if req.term > core.hard.current_term {
            self.become_follower(core, req.term, None)?;
        }
        if req.term < core.hard.current_term {
            return Ok(RequestVoteResponse {
                term: core.hard.current_term,
                vote_granted: false,
            });
        }

        let up_to_date = (req.last_log_term, req.last_log_index) >= (core.last_log.term, core.last_log.index);
        let can_vote = core
            .hard
            .voted_for
            .as_ref()
            .map_or(true, |voted| *voted == req.candidate_id);

        let vote_granted = up_to_date && can_vote;
        if vote_granted {
            core.hard.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state(core)?;
            self.reset_election_deadline(core);
            info!("Granted vote to candidate {} for term {}", req.candidate_id, req.term);
        }

        Ok(RequestVoteResponse {
            term: core.hard.current_term,
            vote_granted,
        })
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if core.shutting_down {
            return Err(RaftError::ShuttingDown);
        }

        if req.term < core.hard.current_term {
            return Ok(AppendEntriesResponse {
                term: core.hard.current_term,
                success: false,
                last_log_index: core.last_log.index,
                conflict_index: 0,
                conflict_term: None,
            });
        }
        if req.term > core.hard.current_term || core.role != Role::Follower {
            self.become_follower(core, req.term, Some(req.leader_id.clone()))?;
        }
        core.leader_id = Some(req.leader_id.clone());
        self.reset_election_deadline(core);

        match self.check_prev(core, req.prev_log_index, req.prev_log_term) {
            Ok(()) => {}
            Err(RaftError::LogConflict { index, term }) => {
                debug!(
                    "Rejecting entries after {}: conflict at {} (term {:?})",
                    req.prev_log_index, index, term
                );
                return Ok(AppendEntriesResponse {
                    term: core.hard.current_term,
                    success: false,
                    last_log_index: core.last_log.index,
                    conflict_index: index,
                    conflict_term: term,
                });
            }
            Err(e) => return Err(e),
        }

        let last_verified = req.prev_log_index + req.entries.len() as u64;
        self.merge_entries(core, req.entries)?;

        if req.leader_commit > core.commit_index {
            self.set_commit(core, req.leader_commit.min(last_verified))?;
        }

        Ok(AppendEntriesResponse {
            term: core.hard.current_term,
            success: true,
            last_log_index: last_verified,
            conflict_index: 0,
            conflict_term: None,
        })
    }

    /// Check that the local log holds the leader's previous entry.
    ///
    /// Entries inside the compacted prefix are committed and therefore match.
    fn check_prev(&self, core: &RaftCore, prev_index: u64, prev_term: u64) -> RaftResult<()> {
        if prev_index == 0 {
            return Ok(());
        }
        if prev_index > core.last_log.index {
            return Err(RaftError::LogConflict {
                index: core.last_log.index + 1,
                term: None,
            });
        }

        let log = &*self.shared.log;
        let state = log.state()?;
        if prev_index < state.last_purged.index {
            return Ok(());
        }
        match term_at(log, prev_index)? {
            Some(term) if term == prev_term => Ok(()),
            Some(term) => {
                let mut first = prev_index;
                while first > state.last_purged.index + 1 && term_at(log, first - 1)? == Some(term) {
                    first -= 1;
                }
                Err(RaftError::LogConflict {
                    index: first,
                    term: Some(term),
                })
            }
            None => Err(RaftError::LogConflict {
                index: state.last_purged.index + 1,
                term: None,
            }),
        }
    }

    /// Append the leader's entries, truncating the first conflicting suffix
    fn merge_entries(&self, core: &mut RaftCore, entries: Vec<LogEntry>) -> RaftResult<()> {
        let log = &*self.shared.log;
        let last_purged = log.state()?.last_purged.index;

        let mut first_new = entries.len();
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index <= last_purged {
                continue;
            }
            if entry.index > core.last_log.index {
                first_new = pos;
                break;
            }
            if term_at(log, entry.index)? != Some(entry.term) {
                if entry.index <= core.commit_index {
                    return Err(RaftError::LogConflict {
                        index: entry.index,
                        term: Some(entry.term),
                    });
                }
                warn!(
                    "Truncating conflicting entries from index {} (leader term {})",
                    entry.index, entry.term
                );
                log.truncate_suffix(entry.index)?;
                core.membership.truncate(entry.index);
                core.last_log = log.state()?.last;
                first_new = pos;
                break;
            }
        }

        let new_entries = &entries[first_new..];
        if new_entries.is_empty() {
            return Ok(());
        }
        log.append(new_entries)?;
        for entry in new_entries.iter().filter(|e| e.kind == EntryKind::Configuration) {
            match Configuration::decode(&entry.payload) {
                Ok(config) => core.membership.push(entry.index, config),
                Err(e) => warn!("Ignoring undecodable configuration at {}: {}", entry.index, e),
            }
        }
        if let Some(last) = new_entries.last() {
            core.last_log = last.log_id();
        }
        Ok(())
    }

    pub async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if core.shutting_down {
            return Err(RaftError::ShuttingDown);
        }

        if req.term < core.hard.current_term {
            return Ok(InstallSnapshotResponse {
                term: core.hard.current_term,
                next_offset: 0,
            });
        }
        if req.term > core.hard.current_term || core.role != Role::Follower {
            self.become_follower(core, req.term, Some(req.leader_id.clone()))?;
        }
        core.leader_id = Some(req.leader_id.clone());
        self.reset_election_deadline(core);

        let term = core.hard.current_term;
        let id = req.meta.last_included;
        let end = req.offset + req.data.len() as u64;

        if req.offset == 0 {
            core.incoming = Some(IncomingSnapshot {
                meta: req.meta.clone(),
                buf: Vec::new(),
            });
        }
        let incoming = match core.incoming.as_mut() {
            Some(incoming) if incoming.meta.last_included == id && incoming.buf.len() as u64 == req.offset => incoming,
            Some(incoming) if incoming.meta.last_included == id => {
                let expected = incoming.buf.len() as u64;
                debug!("Snapshot {} chunk at {} out of order, expecting {}", id, req.offset, expected);
                return Ok(InstallSnapshotResponse {
                    term,
                    next_offset: expected,
                });
            }
            _ => {
                debug!("Snapshot {} chunk at {} without a transfer in progress", id, req.offset);
                return Ok(InstallSnapshotResponse { term, next_offset: 0 });
            }
        };
        incoming.buf.extend_from_slice(&req.data);

        if !req.done {
            return Ok(InstallSnapshotResponse { term, next_offset: end });
        }

        let Some(incoming) = core.incoming.take() else {
            return Ok(InstallSnapshotResponse { term, next_offset: 0 });
        };
        if id.index <= *self.shared.applied_rx.borrow() {
            debug!("Snapshot {} already covered by applied state", id);
            return Ok(InstallSnapshotResponse { term, next_offset: end });
        }

        let snapshot = Snapshot {
            meta: incoming.meta,
            data: incoming.buf,
        };
        self.install_snapshot(core, snapshot).await?;
        Ok(InstallSnapshotResponse { term, next_offset: end })
    }

    /// Persist a snapshot received from the leader and fast-forward to it
    async fn install_snapshot(&self, core: &mut RaftCore, snapshot: Snapshot) -> RaftResult<()> {
        let meta = snapshot.meta.clone();
        let id = meta.last_included;

        if let Err(e) = self.shared.snapshots.save(&snapshot) {
            return Err(self.shared.fatal(format!("failed to persist snapshot {}: {}", id, e)));
        }

        let (ack, rx) = oneshot::channel();
        self.shared
            .applier_tx
            .send(ApplierMsg::Install { snapshot, ack })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)??;

        let kept_suffix = align_log_to_snapshot(&*self.shared.log, id)?;
        if !kept_suffix {
            core.membership.truncate(id.index + 1);
        }
        core.membership.reset(meta.configuration_index, meta.configuration);
        core.last_log = self.shared.log.state()?.last;
        if id.index > core.commit_index {
            core.commit_index = id.index;
            self.shared.commit_tx.send_replace(id.index);
        }

        info!(
            "Node {} installed snapshot {} (log {})",
            self.shared.id,
            id,
            if kept_suffix { "kept" } else { "reset" }
        );
        Ok(())
    }
}
