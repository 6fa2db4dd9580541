//! Consensus module: leader election, log replication, and snapshots.
//!
//! This wraps the tikv/raft library behind the small contract the rest of the
//! crate depends on:
//!
//! - [`ConsensusHandle::submit`] appends a command and waits for it to apply
//! - [`ConsensusHandle::role`] / [`ConsensusHandle::leader_address`] report
//!   leadership
//! - [`ConsensusHandle::subscribe_leadership`] streams leadership changes
//! - [`ConsensusHandle::bootstrap_single_member`] and
//!   [`ConsensusHandle::add_voter`] manage membership
//!
//! Committed entries are handed to a [`StateMachine`] one at a time, in log
//! order, from a single worker thread.
//!
//! # Modules
//!
//! - [`storage`]: durable raft log, stable metadata, and snapshot store
//! - [`node`]: `RawNode` wrapper and the apply pipeline
//! - [`transport`]: TCP framing and per-peer outbound queues
//! - [`runtime`]: worker loop and the [`ConsensusHandle`]

pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

use std::fmt;
use std::io::{Read, Write};

use raft::StateRole;
use serde::Serialize;

use crate::error::{Error, Result};

pub use runtime::{ConsensusConfig, ConsensusHandle, start};

/// The replicated state machine driven by committed log entries.
///
/// Implementations are called from the consensus worker thread only, so
/// `apply`, `snapshot`, and `restore` never run concurrently with each other.
pub trait StateMachine: Send + Sync + 'static {
    /// Applies one committed command. The returned result is reported to the
    /// client that submitted the entry; it never stops replication.
    fn apply(&self, command: &[u8]) -> Result<()>;

    /// Captures the full state as of the most recently applied entry.
    fn snapshot(&self) -> Result<FsmSnapshot>;

    /// Replaces the full state with the contents of a snapshot.
    fn restore(&self, snapshot: &mut dyn Read) -> Result<()>;
}

/// Point-in-time copy of the state machine produced by [`StateMachine::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmSnapshot {
    data: Vec<u8>,
}

impl FsmSnapshot {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Writes the snapshot to `sink`.
    pub fn persist(&self, sink: &mut dyn Write) -> Result<()> {
        sink.write_all(&self.data)
            .and_then(|()| sink.flush())
            .map_err(|err| Error::storage("persist snapshot", err))
    }
}

/// Raft role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => Role::Leader,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
            StateRole::Follower => Role::Follower,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot of a node's consensus state, published after every worker step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusStatus {
    pub node_id: u64,
    pub address: String,
    pub role: Role,
    pub term: u64,
    /// 0 when no leader is known.
    pub leader_id: u64,
    pub leader_address: Option<String>,
    pub voters: Vec<u64>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
}
