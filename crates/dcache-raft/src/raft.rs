//! Raft node handle
//!
//! [`Raft`] is a cheap, cloneable handle over the shared node state. Creating
//! one spawns two background tasks:
//! - the ticker, which starts elections when the election deadline passes
//! - the applier, which applies committed entries and takes snapshots
//!
//! While leading, one replicator task per follower is also running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::applier::{Applier, ApplierMsg};
use crate::config::RaftConfig;
use crate::consensus::RaftCore;
use crate::error::{RaftError, RaftResult};
use crate::event::{RaftEvent, RaftMetrics, Role};
use crate::fsm::StateMachine;
use crate::membership::Membership;
use crate::message::*;
use crate::network::Transport;
use crate::storage::{
    term_at, LogStore, MemLogStore, MemSnapshotStore, MemStableStore, SnapshotStore, StableStore,
};
use dcache_core::{Command, Configuration, EntryKind, LogEntry, LogId, NodeId, Server, StorageResult};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const REPLAY_BATCH: u64 = 256;

/// The durable stores a node runs on
#[derive(Clone)]
pub struct RaftStorage {
    pub log: Arc<dyn LogStore>,
    pub stable: Arc<dyn StableStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl RaftStorage {
    pub fn in_memory() -> Self {
        Self {
            log: Arc::new(MemLogStore::new()),
            stable: Arc::new(MemStableStore::new()),
            snapshots: Arc::new(MemSnapshotStore::new()),
        }
    }
}

/// A proposer waiting for its entry to be applied
pub(crate) struct Waiter {
    pub term: u64,
    pub tx: oneshot::Sender<RaftResult<u64>>,
}

pub(crate) struct Shared {
    pub id: NodeId,
    pub config: RaftConfig,
    pub core: Mutex<RaftCore>,
    pub log: Arc<dyn LogStore>,
    pub stable: Arc<dyn StableStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn Transport>,
    pub waiters: parking_lot::Mutex<HashMap<u64, Waiter>>,
    pub commit_tx: watch::Sender<u64>,
    pub applied_rx: watch::Receiver<u64>,
    pub snapshot_index: AtomicU64,
    pub applier_tx: mpsc::UnboundedSender<ApplierMsg>,
    pub events: broadcast::Sender<RaftEvent>,
    pub cancel: CancellationToken,
    pub tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: RaftEvent) {
        let _ = self.events.send(event);
    }

    /// Report an unrecoverable error and stop the node's background tasks
    pub(crate) fn fatal(&self, reason: String) -> RaftError {
        error!("Raft node {} hit a fatal error: {}", self.id, reason);
        self.emit(RaftEvent::Fatal { reason: reason.clone() });
        self.cancel.cancel();
        RaftError::SnapshotIo(reason)
    }
}

/// Handle to a Raft node
#[derive(Clone)]
pub struct Raft {
    pub(crate) shared: Arc<Shared>,
}

impl Raft {
    /// Open a node on `storage`, restoring the latest snapshot and the
    /// membership recorded in the log, and start its background tasks.
    pub async fn new(
        config: RaftConfig,
        storage: RaftStorage,
        transport: Arc<dyn Transport>,
        fsm: Arc<dyn StateMachine>,
    ) -> RaftResult<Self> {
        config.validate()?;
        let RaftStorage { log, stable, snapshots } = storage;

        let hard = stable.load_hard_state()?;
        let mut applied = LogId::default();
        let mut applied_config = (0, Configuration::default());
        let mut membership = Membership::default();

        if let Some(snapshot) = snapshots.latest()? {
            let meta = &snapshot.meta;
            fsm.restore(&snapshot.data)
                .map_err(|e| RaftError::SnapshotIo(format!("failed to restore snapshot {}: {}", meta.last_included, e)))?;
            align_log_to_snapshot(&*log, meta.last_included)?;
            applied = meta.last_included;
            applied_config = (meta.configuration_index, meta.configuration.clone());
            membership = Membership::new(meta.configuration_index, meta.configuration.clone());
            info!(
                "Node {} restored snapshot {} ({} bytes)",
                config.node_id,
                meta.last_included,
                snapshot.data.len()
            );
        }

        let state = log.state()?;
        replay_configurations(&*log, state.last_purged.index + 1, state.last.index, &mut membership)?;

        let (commit_tx, commit_rx) = watch::channel(applied.index);
        let (applied_tx, applied_rx) = watch::channel(applied.index);
        let (applier_tx, applier_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let core = RaftCore::new(hard, state.last, applied.index, membership);

        info!(
            "Starting Raft node {} (term {}, last log {}, applied {})",
            config.node_id, core.hard.current_term, state.last, applied
        );

        let shared = Arc::new(Shared {
            id: config.node_id.clone(),
            config,
            core: Mutex::new(core),
            log,
            stable,
            snapshots,
            transport,
            waiters: parking_lot::Mutex::new(HashMap::new()),
            commit_tx,
            applied_rx,
            snapshot_index: AtomicU64::new(applied.index),
            applier_tx,
            events,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        let raft = Raft { shared };

        {
            let mut core = raft.shared.core.lock().await;
            raft.reset_election_deadline(&mut core);
        }

        let applier = Applier::new(
            raft.shared.clone(),
            fsm,
            applier_rx,
            commit_rx,
            applied_tx,
            applied,
            applied_config,
        );
        let applier_task = tokio::spawn(applier.run());
        let ticker_task = tokio::spawn(raft.clone().run_ticker());
        raft.shared.tasks.lock().extend([applier_task, ticker_task]);

        Ok(raft)
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.shared.config
    }

    /// Initialize a fresh node with the cluster's first configuration.
    ///
    /// Writes the configuration at index 1, term 1. Fails when the node already
    /// has a term or log entries.
    pub async fn bootstrap(&self, configuration: Configuration) -> RaftResult<()> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        if core.shutting_down {
            return Err(RaftError::ShuttingDown);
        }
        if core.hard.current_term != 0 || core.last_log.index != 0 {
            return Err(RaftError::Config(format!(
                "node {} already has state (term {}, last log {})",
                self.shared.id, core.hard.current_term, core.last_log
            )));
        }
        if !configuration.is_voter(&self.shared.id) {
            return Err(RaftError::Config(format!(
                "bootstrap configuration must include {} as a voter",
                self.shared.id
            )));
        }

        core.hard.current_term = 1;
        self.persist_hard_state(core)?;
        let entry = LogEntry::configuration(1, 1, &configuration)?;
        self.shared.log.append(std::slice::from_ref(&entry))?;
        core.last_log = entry.log_id();
        core.membership.push(1, configuration);

        info!("Node {} bootstrapped cluster", self.shared.id);
        Ok(())
    }

    /// Replicate a command. Returns the log index once the entry is committed
    /// and applied; followers forward the write to the leader.
    pub async fn client_write(&self, command: Command) -> RaftResult<u64> {
        self.execute(ForwardRequest::Write(command)).await
    }

    /// Add a non-voting member that receives the log
    pub async fn add_learner(&self, id: impl Into<NodeId>, address: impl Into<String>) -> RaftResult<u64> {
        self.execute(ForwardRequest::AddLearner {
            id: id.into(),
            address: address.into(),
        })
        .await
    }

    /// Add a voting member: joins as a learner, catches up, then gets promoted
    pub async fn add_voter(&self, id: impl Into<NodeId>, address: impl Into<String>) -> RaftResult<u64> {
        self.execute(ForwardRequest::AddVoter {
            id: id.into(),
            address: address.into(),
        })
        .await
    }

    pub async fn remove_server(&self, id: impl Into<NodeId>) -> RaftResult<u64> {
        self.execute(ForwardRequest::RemoveServer { id: id.into() }).await
    }

    /// Run locally when leading, otherwise forward to the known leader
    async fn execute(&self, request: ForwardRequest) -> RaftResult<u64> {
        match self.execute_local(request.clone()).await {
            Err(RaftError::NotLeader { leader: Some(leader) }) if leader != self.shared.id => {
                self.forward_to(&leader, request).await
            }
            other => other,
        }
    }

    pub(crate) async fn execute_local(&self, request: ForwardRequest) -> RaftResult<u64> {
        match request {
            ForwardRequest::Write(command) => {
                let payload = command
                    .encode()
                    .map_err(|e| RaftError::Decode(e.to_string()))?;
                let (index, rx) = self.propose(EntryKind::Command, payload).await?;
                self.await_applied(index, rx).await
            }
            ForwardRequest::AddLearner { id, address } => self.add_learner_local(id, address).await,
            ForwardRequest::AddVoter { id, address } => self.add_voter_local(id, address).await,
            ForwardRequest::RemoveServer { id } => {
                self.change_membership(|config| {
                    if !config.contains(&id) {
                        return Err(RaftError::UnknownServer { id: id.clone() });
                    }
                    Ok(Some(config.without(&id)))
                })
                .await
            }
        }
    }

    async fn forward_to(&self, leader: &str, request: ForwardRequest) -> RaftResult<u64> {
        let target = {
            let core = self.shared.core.lock().await;
            core.membership.config().get(leader).cloned()
        };
        let target = target.ok_or_else(|| RaftError::NotLeader {
            leader: Some(leader.to_string()),
        })?;

        debug!("Forwarding request to leader {}", target.id);
        let response = self.shared.transport.forward(&target, request).await?;
        response.result.map_err(RaftError::from)
    }

    /// Append an entry as leader and register a waiter for it
    async fn propose(
        &self,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> RaftResult<(u64, oneshot::Receiver<RaftResult<u64>>)> {
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        self.ensure_leader(core)?;
        self.propose_locked(core, kind, payload)
    }

    fn propose_locked(
        &self,
        core: &mut RaftCore,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> RaftResult<(u64, oneshot::Receiver<RaftResult<u64>>)> {
        let entry = self.append_local(core, kind, payload)?;
        let (tx, rx) = oneshot::channel();
        let displaced = self.shared.waiters.lock().insert(
            entry.index,
            Waiter {
                term: entry.term,
                tx,
            },
        );
        // A waiter left from an earlier term at this index lost its entry
        if let Some(stale) = displaced {
            let _ = stale.tx.send(Err(RaftError::LeadershipLost { index: entry.index }));
        }
        // The waiter must exist before the entry can commit
        self.advance_commit(core)?;
        Ok((entry.index, rx))
    }

    async fn await_applied(&self, index: u64, rx: oneshot::Receiver<RaftResult<u64>>) -> RaftResult<u64> {
        match tokio::time::timeout(self.shared.config.apply_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::ShuttingDown),
            Err(_) => {
                self.shared.waiters.lock().remove(&index);
                warn!("Entry {} not applied within {:?}", index, self.shared.config.apply_timeout);
                Err(RaftError::QuorumUnavailable { index })
            }
        }
    }

    pub(crate) fn ensure_leader(&self, core: &RaftCore) -> RaftResult<()> {
        if core.shutting_down {
            return Err(RaftError::ShuttingDown);
        }
        if core.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: core.leader_id.clone(),
            });
        }
        Ok(())
    }

    /// Append a configuration computed from the current one.
    ///
    /// `change` returns `None` when nothing needs to change.
    async fn change_membership<F>(&self, change: F) -> RaftResult<u64>
    where
        F: FnOnce(&Configuration) -> RaftResult<Option<Configuration>>,
    {
        let (index, rx) = {
            let mut guard = self.shared.core.lock().await;
            let core = &mut *guard;
            self.ensure_leader(core)?;
            if core.membership.latest_index() > core.commit_index {
                return Err(RaftError::MembershipChangePending);
            }
            let current = core.membership.config();
            let Some(next) = change(&current)? else {
                return Ok(core.membership.latest_index());
            };
            info!(
                "Node {} proposing configuration with {} servers ({} voters)",
                self.shared.id,
                next.servers.len(),
                next.voter_count()
            );
            self.propose_locked(core, EntryKind::Configuration, next.encode()?)?
        };
        self.await_applied(index, rx).await
    }

    async fn add_learner_local(&self, id: NodeId, address: String) -> RaftResult<u64> {
        self.change_membership(|config| match config.get(&id) {
            Some(server) if server.address == address => Ok(None),
            Some(server) => Ok(Some(config.with_server(Server {
                id: id.clone(),
                address: address.clone(),
                role: server.role,
            }))),
            None => Ok(Some(config.with_server(Server::non_voter(id.clone(), address.clone())))),
        })
        .await
    }

    async fn add_voter_local(&self, id: NodeId, address: String) -> RaftResult<u64> {
        self.add_learner_local(id.clone(), address).await?;
        self.wait_for_catch_up(&id).await?;
        self.change_membership(|config| match config.get(&id) {
            None => Err(RaftError::UnknownServer { id: id.clone() }),
            Some(server) if server.is_voter() => Ok(None),
            Some(server) => Ok(Some(config.with_server(Server::voter(id.clone(), server.address.clone())))),
        })
        .await
    }

    /// Wait until learner `id` holds the latest configuration and is within
    /// `learner_catchup_lag` entries of the leader
    async fn wait_for_catch_up(&self, id: &str) -> RaftResult<()> {
        let deadline = Instant::now() + self.shared.config.learner_catchup_timeout;
        loop {
            {
                let core = self.shared.core.lock().await;
                self.ensure_leader(&core)?;
                if id == self.shared.id {
                    return Ok(());
                }
                let matched = core
                    .leader
                    .as_ref()
                    .and_then(|leader| leader.progress.get(id))
                    .map(|p| p.match_index)
                    .unwrap_or(0);
                if matched >= core.membership.latest_index()
                    && core.last_log.index.saturating_sub(matched) <= self.shared.config.learner_catchup_lag
                {
                    debug!("Learner {} caught up at index {}", id, matched);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::LearnerCatchUp { id: id.to_string() });
            }
            tokio::time::sleep(self.shared.config.heartbeat_interval).await;
        }
    }

    /// Dispatch an incoming RPC
    pub async fn handle_rpc(&self, request: RaftRequest) -> RaftResponse {
        let result = match request {
            RaftRequest::AppendEntries(req) => self.handle_append_entries(req).await.map(RaftResponse::AppendEntries),
            RaftRequest::RequestVote(req) => self.handle_request_vote(req).await.map(RaftResponse::RequestVote),
            RaftRequest::InstallSnapshot(req) => self
                .handle_install_snapshot(req)
                .await
                .map(RaftResponse::InstallSnapshot),
            RaftRequest::Forward(req) => Ok(RaftResponse::Forward(self.handle_forward(req).await)),
        };
        result.unwrap_or_else(|e| RaftResponse::Error(e.to_string()))
    }

    /// Execute a request forwarded by a follower. Never forwards again.
    pub async fn handle_forward(&self, request: ForwardRequest) -> ForwardResponse {
        ForwardResponse {
            result: self.execute_local(request).await.map_err(Into::into),
        }
    }

    /// Leadership change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.shared.events.subscribe()
    }

    pub async fn metrics(&self) -> RaftMetrics {
        let core = self.shared.core.lock().await;
        RaftMetrics {
            id: self.shared.id.clone(),
            role: core.role,
            current_term: core.hard.current_term,
            leader_id: core.leader_id.clone(),
            commit_index: core.commit_index,
            applied_index: *self.shared.applied_rx.borrow(),
            last_log_index: core.last_log.index,
            snapshot_index: self.shared.snapshot_index.load(Ordering::Relaxed),
            membership: core.membership.config(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.shared.core.lock().await.role == Role::Leader
    }

    /// Current leader as known by this node
    pub async fn leader(&self) -> Option<Server> {
        let core = self.shared.core.lock().await;
        let leader = core.leader_id.as_ref()?;
        let server = core.membership.config().get(leader).cloned();
        server
    }

    pub fn applied_index(&self) -> u64 {
        *self.shared.applied_rx.borrow()
    }

    /// Wait until the local state machine has applied `index`
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> RaftResult<u64> {
        let mut rx = self.shared.applied_rx.clone();
        let reached = async move {
            let applied = rx.wait_for(|applied| *applied >= index).await?;
            Ok::<u64, watch::error::RecvError>(*applied)
        };
        match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(_)) => Err(RaftError::ShuttingDown),
            Err(_) => Err(RaftError::QuorumUnavailable { index }),
        }
    }

    /// Take a snapshot now. Returns the snapshot point, or `None` when nothing
    /// was applied since the last snapshot.
    pub async fn trigger_snapshot(&self) -> RaftResult<Option<LogId>> {
        let (ack, rx) = oneshot::channel();
        self.shared
            .applier_tx
            .send(ApplierMsg::Snapshot { ack })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Stop accepting writes, stop background tasks, fail pending proposals
    /// and flush the log
    pub async fn shutdown(&self) -> RaftResult<()> {
        info!("Stopping Raft node {}", self.shared.id);
        {
            let mut core = self.shared.core.lock().await;
            core.shutting_down = true;
            if let Some(leader) = core.leader.take() {
                leader.cancel.cancel();
            }
        }
        self.shared.cancel.cancel();

        let waiters: Vec<_> = self.shared.waiters.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.tx.send(Err(RaftError::ShuttingDown));
        }

        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.shared.log.flush()?;
        info!("Raft node {} stopped", self.shared.id);
        Ok(())
    }

    async fn run_ticker(self) {
        let tick = (self.shared.config.election_timeout_min / 10).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut guard = self.shared.core.lock().await;
            let core = &mut *guard;
            if core.shutting_down {
                break;
            }
            if core.role == Role::Leader || Instant::now() < core.election_deadline {
                continue;
            }
            if !core.membership.config().is_voter(&self.shared.id) {
                self.reset_election_deadline(core);
                continue;
            }
            if let Err(e) = self.start_election(core) {
                error!("Node {} failed to start election: {}", self.shared.id, e);
            }
        }

        let mut core = self.shared.core.lock().await;
        core.shutting_down = true;
        if let Some(leader) = core.leader.take() {
            leader.cancel.cancel();
        }
    }
}

/// Make the log consistent with a snapshot at `last_included`.
///
/// A log that contains `last_included` keeps its suffix; any other log is
/// discarded entirely.
pub(crate) fn align_log_to_snapshot(log: &dyn LogStore, last_included: LogId) -> StorageResult<bool> {
    let keep_suffix = term_at(log, last_included.index)? == Some(last_included.term);
    if !keep_suffix {
        log.truncate_suffix(0)?;
    }
    log.truncate_prefix(last_included)?;
    Ok(keep_suffix)
}

fn replay_configurations(
    log: &dyn LogStore,
    from: u64,
    last: u64,
    membership: &mut Membership,
) -> RaftResult<()> {
    let mut next = from;
    while next <= last {
        let batch = log.range(next, (next + REPLAY_BATCH).min(last + 1))?;
        let Some(tail) = batch.last() else { break };
        next = tail.index + 1;
        for entry in batch.iter().filter(|e| e.kind == EntryKind::Configuration) {
            if entry.index > membership.latest_index() {
                membership.push(entry.index, Configuration::decode(&entry.payload)?);
            }
        }
    }
    Ok(())
}
