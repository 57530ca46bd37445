//! Consensus state, role transitions and commit advancement

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RaftResult;
use crate::event::{RaftEvent, Role};
use crate::membership::Membership;
use crate::message::RequestVoteRequest;
use crate::raft::Raft;
use crate::replication::Replicator;
use crate::storage::term_at;
use dcache_core::{Configuration, EntryKind, HardState, LogEntry, LogId, NodeId, Server, SnapshotMeta};

/// Replication progress of one follower
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    pub next_index: u64,
    pub match_index: u64,
}

/// State that only exists while leading
pub(crate) struct LeaderState {
    pub progress: HashMap<NodeId, Progress>,
    /// Wake-up handle of each running replicator
    pub replicators: HashMap<NodeId, Arc<Notify>>,
    /// Cancelled when this leadership ends
    pub cancel: CancellationToken,
}

/// Snapshot chunks received so far from the leader
pub(crate) struct IncomingSnapshot {
    pub meta: SnapshotMeta,
    pub buf: Vec<u8>,
}

/// Internal state of a Raft node, guarded by one async mutex
pub(crate) struct RaftCore {
    pub hard: HardState,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_log: LogId,
    pub membership: Membership,
    pub election_deadline: Instant,
    pub votes: HashSet<NodeId>,
    pub leader: Option<LeaderState>,
    pub incoming: Option<IncomingSnapshot>,
    pub shutting_down: bool,
}

impl RaftCore {
    pub(crate) fn new(hard: HardState, last_log: LogId, commit_index: u64, membership: Membership) -> Self {
        Self {
            hard,
            role: Role::Follower,
            leader_id: None,
            commit_index,
            last_log,
            membership,
            election_deadline: Instant::now(),
            votes: HashSet::new(),
            leader: None,
            incoming: None,
            shutting_down: false,
        }
    }
}

impl Raft {
    fn random_election_timeout(&self) -> Duration {
        let config = &self.shared.config;
        let min = config.election_timeout_min.as_millis() as u64;
        let max = config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub(crate) fn reset_election_deadline(&self, core: &mut RaftCore) {
        core.election_deadline = Instant::now() + self.random_election_timeout();
    }

    pub(crate) fn persist_hard_state(&self, core: &RaftCore) -> RaftResult<()> {
        self.shared.stable.save_hard_state(&core.hard)?;
        Ok(())
    }

    /// Adopt `term` (persisting it when newer) and become a follower of `leader`
    pub(crate) fn become_follower(&self, core: &mut RaftCore, term: u64, leader: Option<NodeId>) -> RaftResult<()> {
        if term > core.hard.current_term {
            core.hard.current_term = term;
            core.hard.voted_for = None;
            self.persist_hard_state(core)?;
        }

        let was_leader = core.role == Role::Leader;
        if let Some(state) = core.leader.take() {
            state.cancel.cancel();
        }
        if core.role != Role::Follower {
            info!(
                "Node {} stepping down to follower in term {}",
                self.shared.id, core.hard.current_term
            );
        }

        core.role = Role::Follower;
        core.votes.clear();
        core.leader_id = leader;
        self.reset_election_deadline(core);

        if was_leader {
            self.shared.emit(RaftEvent::BecameFollower {
                term: core.hard.current_term,
                leader: core.leader_id.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn start_election(&self, core: &mut RaftCore) -> RaftResult<()> {
        core.hard.current_term += 1;
        core.hard.voted_for = Some(self.shared.id.clone());
        self.persist_hard_state(core)?;

        core.role = Role::Candidate;
        core.leader_id = None;
        core.votes = HashSet::from([self.shared.id.clone()]);
        self.reset_election_deadline(core);

        let term = core.hard.current_term;
        info!("Node {} starting election for term {}", self.shared.id, term);

        let config = core.membership.config();
        if core.votes.len() >= config.quorum() {
            return self.become_leader(core);
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.shared.id.clone(),
            last_log_index: core.last_log.index,
            last_log_term: core.last_log.term,
        };
        for peer in config.voters().filter(|s| s.id != self.shared.id) {
            let raft = self.clone();
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move { raft.request_vote_from(peer, request).await });
        }
        Ok(())
    }

    async fn request_vote_from(self, peer: Server, request: RequestVoteRequest) {
        let term = request.term;
        let response = match self.shared.transport.request_vote(&peer, request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Failed to send RequestVote to {}: {}", peer.id, e);
                return;
            }
        };

        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if response.term > core.hard.current_term {
            if let Err(e) = self.become_follower(core, response.term, None) {
                warn!("Failed to adopt term {}: {}", response.term, e);
            }
            return;
        }
        if core.role != Role::Candidate || core.hard.current_term != term || !response.vote_granted {
            return;
        }

        debug!("Received vote from {} for term {}", peer.id, term);
        core.votes.insert(peer.id);
        let config = core.membership.config();
        let granted = core.votes.iter().filter(|id| config.is_voter(id)).count();
        if granted >= config.quorum() {
            if let Err(e) = self.become_leader(core) {
                warn!("Node {} failed to take leadership: {}", self.shared.id, e);
            }
        }
    }

    fn become_leader(&self, core: &mut RaftCore) -> RaftResult<()> {
        let term = core.hard.current_term;
        core.role = Role::Leader;
        core.leader_id = Some(self.shared.id.clone());
        core.votes.clear();
        core.incoming = None;
        core.leader = Some(LeaderState {
            progress: HashMap::new(),
            replicators: HashMap::new(),
            cancel: self.shared.cancel.child_token(),
        });
        info!("Node {} became leader for term {}", self.shared.id, term);

        self.sync_replicators(core);
        // Entries from earlier terms only commit through an entry of this term
        self.append_local(core, EntryKind::Blank, Vec::new())?;
        self.shared.emit(RaftEvent::BecameLeader { term });
        self.advance_commit(core)
    }

    /// Append an entry with the current term to the local log and wake the replicators
    pub(crate) fn append_local(&self, core: &mut RaftCore, kind: EntryKind, payload: Vec<u8>) -> RaftResult<LogEntry> {
        let entry = LogEntry {
            index: core.last_log.index + 1,
            term: core.hard.current_term,
            kind,
            payload,
        };
        self.shared.log.append(std::slice::from_ref(&entry))?;
        core.last_log = entry.log_id();

        if kind == EntryKind::Configuration {
            core.membership.push(entry.index, Configuration::decode(&entry.payload)?);
            self.sync_replicators(core);
        }
        self.notify_replicators(core);
        Ok(entry)
    }

    /// Start a replicator for every member of the latest configuration that lacks one
    pub(crate) fn sync_replicators(&self, core: &mut RaftCore) {
        let term = core.hard.current_term;
        let next_index = core.last_log.index + 1;
        let config = core.membership.config();
        let Some(leader) = core.leader.as_mut() else {
            return;
        };

        for server in config.servers.iter().filter(|s| s.id != self.shared.id) {
            if leader.replicators.contains_key(&server.id) {
                continue;
            }
            leader.progress.entry(server.id.clone()).or_insert(Progress {
                next_index,
                match_index: 0,
            });
            let notify = Arc::new(Notify::new());
            leader.replicators.insert(server.id.clone(), notify.clone());

            let replicator = Replicator::new(self.clone(), server.clone(), term, notify, leader.cancel.clone());
            tokio::spawn(replicator.run());
        }
    }

    pub(crate) fn notify_replicators(&self, core: &RaftCore) {
        if let Some(leader) = core.leader.as_ref() {
            for notify in leader.replicators.values() {
                notify.notify_one();
            }
        }
    }

    /// Commit the highest index stored on a quorum of voters, if it belongs to the current term
    pub(crate) fn advance_commit(&self, core: &mut RaftCore) -> RaftResult<()> {
        let Some(leader) = core.leader.as_ref() else {
            return Ok(());
        };
        let Some(config) = core.membership.latest() else {
            return Ok(());
        };

        let mut matched: Vec<u64> = config
            .voters()
            .map(|server| {
                if server.id == self.shared.id {
                    core.last_log.index
                } else {
                    leader.progress.get(&server.id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return Ok(());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[config.quorum() - 1];

        if candidate <= core.commit_index {
            return Ok(());
        }
        if term_at(&*self.shared.log, candidate)? != Some(core.hard.current_term) {
            return Ok(());
        }
        self.set_commit(core, candidate)
    }

    pub(crate) fn set_commit(&self, core: &mut RaftCore, index: u64) -> RaftResult<()> {
        if index <= core.commit_index {
            return Ok(());
        }
        debug!("Node {} commit index advanced to {}", self.shared.id, index);
        core.commit_index = index;
        self.shared.commit_tx.send_replace(index);
        core.membership.compact(index);

        // A leader removed from the configuration steps down once the removal commits
        if core.role == Role::Leader
            && core.membership.latest_index() <= index
            && !core.membership.config().is_voter(&self.shared.id)
        {
            info!(
                "Node {} is no longer a voter, stepping down at index {}",
                self.shared.id, index
            );
            let term = core.hard.current_term;
            self.become_follower(core, term, None)?;
        }
        Ok(())
    }
}
