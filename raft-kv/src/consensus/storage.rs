//! Durable storage for the Raft log.
//!
//! [`LogStore`] implements `raft::Storage` and keeps everything the consensus
//! module must remember across restarts, in three areas under the storage
//! directory:
//!
//! - `log/entries.log`: length-prefixed protobuf entries, appended as Raft
//!   produces them and rewritten whenever the log is compacted
//! - `stable/state.bin`: node id, hard state, conf state, peer addresses
//! - `snaps/`: the newest snapshots, one protobuf `Snapshot` per file
//!
//! Snapshot data is a [`SnapshotEnvelope`]: the state machine's snapshot plus
//! the peer address directory, so a node brought up from a snapshot can reach
//! members whose join entries were compacted away.
//!
//! Entries are also held in memory; the files exist only to rebuild that
//! state on startup.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, RaftState, Storage};
use raft::StorageError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LOG_DIR: &str = "log";
const STABLE_DIR: &str = "stable";
const SNAPSHOT_DIR: &str = "snaps";
const LOG_FILE: &str = "entries.log";
const STABLE_FILE: &str = "state.bin";
const SNAPSHOT_EXT: &str = "snap";

/// What a snapshot carries besides its raft metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Node id → transport address for every known member.
    pub peers: BTreeMap<u64, String>,
    /// Bytes produced by the state machine.
    pub state: Vec<u8>,
}

impl SnapshotEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encode snapshot envelope")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("decode snapshot envelope")
    }
}

/// Metadata that must survive a restart, rewritten in full on every change.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StableState {
    node_id: u64,
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    peers: BTreeMap<u64, String>,
}

/// Durable `raft::Storage` implementation.
///
/// Cloning is cheap: clones share the same state, which lets the `RawNode`
/// own one handle while the node wrapper mutates through another.
#[derive(Clone)]
pub struct LogStore {
    core: Arc<RwLock<LogCore>>,
}

struct LogCore {
    root: PathBuf,
    node_id: u64,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    entries: Vec<Entry>,
    peers: BTreeMap<u64, String>,
    snapshot_retain: usize,
    log_file: File,
}

impl LogStore {
    /// Opens (or creates) the consensus storage under `root`.
    ///
    /// `node_id` pins the id of a brand-new node; a random non-zero id is
    /// generated when it is `None`. An existing store keeps its persisted id,
    /// and asking for a different one is an error.
    pub fn open(
        root: impl AsRef<Path>,
        node_id: Option<u64>,
        address: &str,
        snapshot_retain: usize,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [LOG_DIR, STABLE_DIR, SNAPSHOT_DIR] {
            let dir = root.join(dir);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }

        let stable = read_stable(&root)?;
        let node_id = match (stable.as_ref(), node_id) {
            (Some(stable), Some(requested)) if stable.node_id != requested => bail!(
                "storage at {} belongs to node {}, not {requested}",
                root.display(),
                stable.node_id
            ),
            (Some(stable), _) => stable.node_id,
            (None, Some(requested)) => requested,
            (None, None) => generate_node_id(),
        };
        ensure!(node_id != 0, "node id 0 is reserved");

        let stable = stable.unwrap_or_default();
        let mut hard_state = HardState::default();
        hard_state.term = stable.term;
        hard_state.vote = stable.vote;
        hard_state.commit = stable.commit;

        let snapshot = read_latest_snapshot(&root)?.unwrap_or_default();
        let snapshot_index = snapshot.get_metadata().index;

        let mut entries = Vec::new();
        for entry in read_log(&root.join(LOG_DIR).join(LOG_FILE))? {
            if entry.index > snapshot_index {
                append_in_memory(&mut entries, snapshot_index, &[entry])?;
            }
        }

        let mut peers = stable.peers;
        peers.insert(node_id, address.to_string());

        let log_file = open_log(&root)?;
        let core = LogCore {
            root,
            node_id,
            hard_state,
            conf_state: ConfState::from((stable.voters, stable.learners)),
            snapshot,
            entries,
            peers,
            snapshot_retain: snapshot_retain.max(1),
            log_file,
        };
        core.persist_stable()?;
        info!(
            node_id,
            snapshot_index,
            entries = core.entries.len(),
            "opened raft storage"
        );

        Ok(Self {
            core: Arc::new(RwLock::new(core)),
        })
    }

    fn rl(&self) -> RwLockReadGuard<'_, LogCore> {
        self.core.read()
    }

    fn wl(&self) -> RwLockWriteGuard<'_, LogCore> {
        self.core.write()
    }

    pub fn node_id(&self) -> u64 {
        self.rl().node_id
    }

    /// True once this node has a membership configuration, either from
    /// bootstrapping, a received snapshot, or a previous run.
    pub fn is_initialized(&self) -> bool {
        let core = self.rl();
        !core.conf_state.voters.is_empty()
            || !core.conf_state.learners.is_empty()
            || core.snapshot.get_metadata().index > 0
            || !core.entries.is_empty()
    }

    pub fn conf_state(&self) -> ConfState {
        self.rl().conf_state.clone()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.rl().snapshot.get_metadata().index
    }

    /// The newest snapshot held by the store (empty if none exists yet).
    pub fn latest_snapshot(&self) -> Snapshot {
        self.rl().snapshot.clone()
    }

    pub fn peer_address(&self, id: u64) -> Option<String> {
        self.rl().peers.get(&id).cloned()
    }

    /// Remembers a member's transport address. Returns `true` if it changed.
    pub fn record_peer(&self, id: u64, address: &str) -> Result<bool> {
        let mut core = self.wl();
        if core.peers.get(&id).map(String::as_str) == Some(address) {
            return Ok(false);
        }
        core.peers.insert(id, address.to_string());
        core.persist_stable()?;
        Ok(true)
    }

    pub fn forget_peer(&self, id: u64) -> Result<()> {
        let mut core = self.wl();
        if id != core.node_id && core.peers.remove(&id).is_some() {
            core.persist_stable()?;
        }
        Ok(())
    }

    /// Installs a single-member configuration containing only this node.
    ///
    /// Written as a snapshot at index 1 so that nodes joining later are
    /// brought up to date by snapshot rather than by replaying a log that
    /// lacks the initial membership.
    pub fn bootstrap(&self, state: Vec<u8>) -> Result<()> {
        ensure!(!self.is_initialized(), "node already has raft state, refusing to bootstrap");
        let mut core = self.wl();
        let conf_state = ConfState::from((vec![core.node_id], vec![]));
        let snapshot = core.build_snapshot(1, 1, conf_state, state)?;
        core.install_snapshot(snapshot)
    }

    /// Appends entries produced by Raft, replacing any conflicting suffix.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut core = self.wl();
        let snapshot_index = core.snapshot.get_metadata().index;
        append_in_memory(&mut core.entries, snapshot_index, entries)?;

        let mut buf = Vec::new();
        for entry in entries {
            write_frame(&mut buf, &entry.encode_to_vec());
        }
        core.log_file.write_all(&buf).context("append raft log")?;
        core.log_file.sync_data().context("sync raft log")?;
        Ok(())
    }

    pub fn set_hard_state(&self, hard_state: &HardState) -> Result<()> {
        let mut core = self.wl();
        core.hard_state = hard_state.clone();
        core.persist_stable()
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut core = self.wl();
        core.hard_state.commit = commit;
        core.persist_stable()
    }

    pub fn set_conf_state(&self, conf_state: ConfState) -> Result<()> {
        let mut core = self.wl();
        core.conf_state = conf_state;
        core.persist_stable()
    }

    /// Installs a snapshot received from the leader, discarding the local log.
    ///
    /// Returns the envelope so the caller can restore the state machine.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<SnapshotEnvelope> {
        let envelope = SnapshotEnvelope::decode(&snapshot.data)?;
        let mut core = self.wl();
        let index = snapshot.get_metadata().index;
        ensure!(
            index >= core.snapshot.get_metadata().index,
            "snapshot at {index} is older than the one already installed"
        );
        for (id, address) in &envelope.peers {
            if *id != core.node_id {
                core.peers.insert(*id, address.clone());
            }
        }
        core.install_snapshot(snapshot)?;
        Ok(envelope)
    }

    /// Captures `state` as a snapshot at `index` and drops the log up to it.
    pub fn compact(&self, index: u64, state: Vec<u8>) -> Result<Snapshot> {
        let mut core = self.wl();
        ensure!(
            index > core.snapshot.get_metadata().index,
            "already compacted through {}",
            core.snapshot.get_metadata().index
        );
        ensure!(index <= core.last_index(), "cannot compact past the last entry");
        let term = core.term(index)?;
        let conf_state = core.conf_state.clone();
        let snapshot = core.build_snapshot(index, term, conf_state, state)?;
        core.write_snapshot_file(&snapshot)?;

        let first = core.first_index();
        core.entries.drain(..(index + 1 - first) as usize);
        core.snapshot = snapshot.clone();
        core.rewrite_log()?;
        core.persist_stable()?;
        debug!(index, term, "compacted raft log");
        Ok(snapshot)
    }
}

impl LogCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(entry) => entry.index,
            None => self.snapshot.get_metadata().index + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.snapshot.get_metadata().index,
        }
    }

    fn term(&self, index: u64) -> raft::Result<u64> {
        let meta = self.snapshot.get_metadata();
        if index == meta.index {
            return Ok(meta.term);
        }
        let first = self.first_index();
        if index < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if index > self.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(self.entries[(index - first) as usize].term)
    }

    fn build_snapshot(
        &self,
        index: u64,
        term: u64,
        conf_state: ConfState,
        state: Vec<u8>,
    ) -> Result<Snapshot> {
        let envelope = SnapshotEnvelope {
            peers: self.peers.clone(),
            state,
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = envelope.encode()?.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = conf_state;
        Ok(snapshot)
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.write_snapshot_file(&snapshot)?;
        let meta = snapshot.get_metadata();
        self.hard_state.term = self.hard_state.term.max(meta.term);
        self.hard_state.commit = self.hard_state.commit.max(meta.index);
        self.conf_state = meta.get_conf_state().clone();
        self.entries.clear();
        self.snapshot = snapshot;
        self.rewrite_log()?;
        self.persist_stable()
    }

    fn persist_stable(&self) -> Result<()> {
        let stable = StableState {
            node_id: self.node_id,
            term: self.hard_state.term,
            vote: self.hard_state.vote,
            commit: self.hard_state.commit,
            voters: self.conf_state.voters.clone(),
            learners: self.conf_state.learners.clone(),
            peers: self.peers.clone(),
        };
        let bytes = bincode::serialize(&stable).context("encode stable state")?;
        write_atomic(&self.root.join(STABLE_DIR).join(STABLE_FILE), &bytes)
    }

    fn write_snapshot_file(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.root.join(SNAPSHOT_DIR);
        let index = snapshot.get_metadata().index;
        write_atomic(
            &dir.join(format!("{index:020}.{SNAPSHOT_EXT}")),
            &snapshot.encode_to_vec(),
        )?;

        let files = snapshot_files(&dir)?;
        let excess = files.len().saturating_sub(self.snapshot_retain);
        for old in &files[..excess] {
            if let Err(err) = fs::remove_file(old) {
                warn!(path = %old.display(), error = %err, "failed to remove old snapshot");
            }
        }
        Ok(())
    }

    /// Replaces the log file with the entries currently held in memory.
    fn rewrite_log(&mut self) -> Result<()> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            write_frame(&mut buf, &entry.encode_to_vec());
        }
        let path = self.root.join(LOG_DIR).join(LOG_FILE);
        write_atomic(&path, &buf)?;
        self.log_file = open_log(&self.root)?;
        Ok(())
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.rl();
        Ok(RaftState::new(
            core.hard_state.clone(),
            core.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.rl();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        if low == high {
            return Ok(Vec::new());
        }

        let offset = core.first_index();
        let mut entries = core.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        raft::util::limit_size(&mut entries, max_size.into());
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.rl().term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        if core.snapshot.get_metadata().index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(core.snapshot.clone())
    }
}

fn generate_node_id() -> u64 {
    loop {
        let id = rand::random::<u64>() >> 1;
        if id != 0 {
            return id;
        }
    }
}

/// Appends with Raft's overwrite semantics: an entry at an index that
/// already exists truncates the log from that index onward.
fn append_in_memory(log: &mut Vec<Entry>, snapshot_index: u64, new: &[Entry]) -> Result<()> {
    let Some(head) = new.first() else {
        return Ok(());
    };
    let first = log.first().map_or(snapshot_index + 1, |entry| entry.index);
    let last = log.last().map_or(snapshot_index, |entry| entry.index);
    if head.index < first {
        return Err(anyhow!(
            "entry {} overwrites compacted log (first index {first})",
            head.index
        ));
    }
    if head.index > last + 1 {
        return Err(anyhow!(
            "entry {} leaves a gap after last index {last}",
            head.index
        ));
    }
    log.truncate((head.index - first) as usize);
    log.extend_from_slice(new);
    Ok(())
}

fn write_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

fn read_log(path: &Path) -> Result<Vec<Entry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("read raft log"),
        }
        let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        if let Err(err) = reader.read_exact(&mut buf) {
            // A torn final frame from a crash mid-append; everything before it is intact.
            warn!(error = %err, recovered = entries.len(), "truncated raft log tail");
            break;
        }
        entries.push(Entry::decode(buf.as_slice()).context("decode raft log entry")?);
    }
    Ok(entries)
}

fn open_log(root: &Path) -> Result<File> {
    let path = root.join(LOG_DIR).join(LOG_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))
}

fn read_stable(root: &Path) -> Result<Option<StableState>> {
    let path = root.join(STABLE_DIR).join(STABLE_FILE);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(
            bincode::deserialize(&bytes).context("decode stable state")?,
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn snapshot_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT) {
            files.push(path);
        }
    }
    // Zero-padded indexes make lexical order the log order.
    files.sort();
    Ok(files)
}

fn read_latest_snapshot(root: &Path) -> Result<Option<Snapshot>> {
    let files = snapshot_files(&root.join(SNAPSHOT_DIR))?;
    let Some(latest) = files.last() else {
        return Ok(None);
    };
    let bytes = fs::read(latest).with_context(|| format!("read {}", latest.display()))?;
    let snapshot = Snapshot::decode(bytes.as_slice())
        .with_context(|| format!("decode {}", latest.display()))?;
    Ok(Some(snapshot))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))
}
