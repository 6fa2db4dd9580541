//! Raft node: the tikv/raft `RawNode` plus the apply pipeline.
//!
//! [`RaftNode`] owns the durable [`LogStore`] and the [`StateMachine`] the
//! log drives. The runtime feeds it ticks, peer messages, and proposals, and
//! calls [`RaftNode::poll_ready`] to persist, apply, and collect outbound
//! messages.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use prost::Message as ProstMessage;
use raft::StateRole;
use raft::prelude::{ConfChange, ConfChangeType, Config, Entry, EntryType, Message, RawNode};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use super::storage::LogStore;
use super::{ConsensusStatus, StateMachine};
use crate::error::Error;

/// The tikv/raft library requires a logger; we log through `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What a committed entry turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A client command handed to the state machine.
    Command,
    /// A membership change.
    Membership,
    /// Leader no-op, or a proposal raft replaced with an empty entry.
    Empty,
}

/// Outcome of applying one committed entry.
///
/// The runtime matches reports against pending proposals by index and term
/// to answer the client that submitted them.
#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub outcome: crate::Result<()>,
}

/// Output from processing a Raft ready state.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// Tuning that isn't part of the persisted state.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Compact the log after this many entries past the last snapshot.
    /// Zero disables threshold snapshots.
    pub snapshot_threshold: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            snapshot_threshold: 1024,
        }
    }
}

/// A Raft consensus node over durable storage and a replicated state machine.
pub struct RaftNode {
    id: u64,
    raw: RawNode<LogStore>,
    storage: LogStore,
    fsm: Arc<dyn StateMachine>,
    options: NodeOptions,
    applied: u64,
}

impl RaftNode {
    /// Creates a node over `storage`, bringing `fsm` in line with it.
    ///
    /// When the storage holds a snapshot, the state machine is restored from
    /// it and raft replays the committed entries that follow.
    pub fn new(
        storage: LogStore,
        fsm: Arc<dyn StateMachine>,
        options: NodeOptions,
    ) -> Result<Self> {
        let id = storage.node_id();
        let snapshot = storage.latest_snapshot();
        let applied = snapshot.get_metadata().index;
        if applied > 0 {
            let envelope = super::storage::SnapshotEnvelope::decode(&snapshot.data)?;
            fsm.restore(&mut envelope.state.as_slice())
                .map_err(anyhow::Error::from)
                .context("restore state machine from snapshot")?;
            info!(node_id = id, index = applied, "restored state machine from snapshot");
        }

        let raw = new_raw_node(id, applied, &storage)?;
        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            options,
            applied,
        })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn storage(&self) -> &LogStore {
        &self.storage
    }

    pub fn status(&self) -> ConsensusStatus {
        let leader_id = self.leader_id();
        ConsensusStatus {
            node_id: self.id,
            address: self.storage.peer_address(self.id).unwrap_or_default(),
            role: self.role().into(),
            term: self.term(),
            leader_id,
            leader_address: (leader_id != 0)
                .then(|| self.storage.peer_address(leader_id))
                .flatten(),
            voters: self.storage.conf_state().voters,
            commit_index: self.raw.raft.raft_log.committed,
            applied_index: self.applied,
            snapshot_index: self.storage.snapshot_index(),
        }
    }

    /// Installs a configuration containing only this node and campaigns.
    ///
    /// With a single voter the campaign wins immediately, so the node is
    /// leader once the next ready state has been processed.
    pub fn bootstrap(&mut self) -> Result<()> {
        let state = self
            .fsm
            .snapshot()
            .map_err(anyhow::Error::from)
            .context("snapshot state machine for bootstrap")?;
        self.storage.bootstrap(state.into_bytes())?;
        self.applied = self.storage.snapshot_index();
        // The RawNode read its configuration at construction; rebuild it.
        self.raw = new_raw_node(self.id, self.applied, &self.storage)?;
        info!(node_id = self.id, "bootstrapped single-member cluster");
        self.campaign()
    }

    /// Appends a command to the log. Returns the `(index, term)` the entry
    /// was proposed at; it is applied only once committed.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        self.ensure_leader()?;
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok(self.last_proposed())
    }

    /// Proposes adding `id` as a voter reachable at `address`.
    pub fn propose_add_voter(&mut self, id: u64, address: &str) -> Result<(u64, u64)> {
        self.ensure_leader()?;
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = id;
        change.context = address.as_bytes().to_vec().into();
        self.raw
            .propose_conf_change(vec![], change)
            .context("propose conf change failed")?;
        Ok(self.last_proposed())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role() == StateRole::Leader {
            Ok(())
        } else {
            Err(Error::NotLeader.into())
        }
    }

    fn last_proposed(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Compacts the log at the applied index. Returns the snapshot index, or
    /// `None` if nothing was applied since the last snapshot.
    pub fn snapshot(&mut self) -> Result<Option<u64>> {
        if self.applied <= self.storage.snapshot_index() {
            return Ok(None);
        }
        self.compact_at_applied()?;
        Ok(Some(self.applied))
    }

    fn compact_at_applied(&mut self) -> Result<()> {
        let state = self
            .fsm
            .snapshot()
            .map_err(anyhow::Error::from)
            .context("snapshot state machine")?;
        self.storage.compact(self.applied, state.into_bytes())?;
        info!(node_id = self.id, index = self.applied, "took snapshot");
        Ok(())
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Follows the raft-rs ready protocol: messages a leader may send before
    /// persisting, then the received snapshot, committed entries, new
    /// entries and hard state, then everything that must wait for
    /// persistence.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = ready.take_messages();

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let index = snapshot.get_metadata().index;
            let envelope = self
                .storage
                .apply_snapshot(snapshot)
                .context("apply snapshot failed")?;
            self.fsm
                .restore(&mut envelope.state.as_slice())
                .map_err(anyhow::Error::from)
                .context("restore state machine failed")?;
            self.applied = index;
            info!(node_id = self.id, index, "installed snapshot from leader");
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state)?;
        }

        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }

        outbound.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();

        if self.options.snapshot_threshold > 0
            && self.applied >= self.storage.snapshot_index() + self.options.snapshot_threshold
        {
            self.compact_at_applied()?;
        }

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Applies committed entries in log order.
    ///
    /// Errors returned here are fatal to the node (storage failures on the
    /// raft side); state machine failures are carried in each report.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index <= self.applied {
                continue;
            }
            let report = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => ApplyReport {
                    index: entry.index,
                    term: entry.term,
                    kind: EntryKind::Empty,
                    outcome: Ok(()),
                },
                EntryType::EntryNormal => {
                    let outcome = self.fsm.apply(&entry.data);
                    if let Err(err) = &outcome {
                        warn!(node_id = self.id, index = entry.index, error = %err, "apply failed");
                    }
                    ApplyReport {
                        index: entry.index,
                        term: entry.term,
                        kind: EntryKind::Command,
                        outcome,
                    }
                }
                EntryType::EntryConfChange => {
                    self.apply_conf_change(&entry)?;
                    ApplyReport {
                        index: entry.index,
                        term: entry.term,
                        kind: EntryKind::Membership,
                        outcome: Ok(()),
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    return Err(anyhow!("unexpected joint-consensus entry at {}", entry.index));
                }
            };
            self.applied = entry.index;
            reports.push(report);
        }
        Ok(reports)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let change = ConfChange::decode(&entry.data[..]).context("decode conf change")?;
        let conf_state = self
            .raw
            .apply_conf_change(&change)
            .context("apply conf change failed")?;
        self.storage.set_conf_state(conf_state)?;

        let address = String::from_utf8_lossy(&change.context).into_owned();
        match change.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !address.is_empty() {
                    self.storage.record_peer(change.node_id, &address)?;
                }
                info!(node_id = self.id, peer = change.node_id, address = %address, "added member");
            }
            ConfChangeType::RemoveNode => {
                self.storage.forget_peer(change.node_id)?;
                info!(node_id = self.id, peer = change.node_id, "removed member");
            }
        }

        // Snapshot right away: a member that joins is caught up from a
        // snapshot, and raft-rs ignores snapshots whose configuration does
        // not list the receiving node.
        self.applied = entry.index;
        if self.applied > self.storage.snapshot_index() {
            self.compact_at_applied()?;
        } else {
            debug!(index = entry.index, "conf change already covered by snapshot");
        }
        Ok(())
    }
}

fn new_raw_node(id: u64, applied: u64, storage: &LogStore) -> Result<RawNode<LogStore>> {
    let cfg = Config {
        id,
        election_tick: 10,
        heartbeat_tick: 3,
        max_inflight_msgs: 256,
        applied,
        ..Default::default()
    };
    RawNode::new(&cfg, storage.clone(), &silent_logger())
        .with_context(|| format!("failed to construct RawNode {id}"))
}
