//! Cluster coordinator.
//!
//! [`Cluster`] ties the state machine to the consensus module. Writes are
//! turned into [`Command`]s and go through the replicated log, only on the
//! leader; reads come straight from the local data file. Starting a cluster
//! either bootstraps a new single-node configuration (seed path) or asks an
//! existing leader to add this node as a voter (join path).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::{Config, normalize_base_url};
use crate::consensus::{self, ConsensusHandle, ConsensusStatus, Role};
use crate::error::{Error, Result};
use crate::fsm::KvStateMachine;

/// The key deleted by every DELETE in legacy mode, whatever was requested.
const LEGACY_DELETE_KEY: &str = "key";

/// Body of a membership-add request, as sent to `POST /raft/add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
}

pub struct Cluster {
    config: Config,
    fsm: Arc<KvStateMachine>,
    consensus: ConsensusHandle,
    shutdown_tx: watch::Sender<bool>,
    watcher: JoinHandle<()>,
}

impl Cluster {
    /// Opens local state, starts the consensus module, and runs the seed or
    /// join path.
    ///
    /// # Errors
    ///
    /// Failing to start the consensus module or to reach the leader when
    /// joining is fatal; the caller is expected to exit.
    pub async fn start(config: Config) -> Result<Self> {
        let fsm = Arc::new(KvStateMachine::open(
            &config.storage_path,
            config.lock_timeout(),
        ));
        let consensus = consensus::start(config.consensus(), fsm.clone())?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = tokio::spawn(watch_leadership(
            consensus.clone(),
            consensus.subscribe_leadership(),
            config.snapshot_chance,
            shutdown_rx,
        ));

        let cluster = Self {
            config,
            fsm,
            consensus,
            shutdown_tx,
            watcher,
        };

        match cluster.join_target()? {
            None => match cluster.consensus.bootstrap_single_member().await {
                Ok(()) => info!(node_id = cluster.node_id(), "bootstrapped new cluster"),
                // Restarting a seed node: its configuration is already on disk.
                Err(Error::AlreadyBootstrapped) => {
                    info!("skipping bootstrap, raft state exists");
                }
                Err(err) => {
                    error!(error = %err, "bootstrap failed");
                    cluster.shutdown();
                    return Err(err);
                }
            },
            Some(leader) => {
                // Give the leader a moment to be ready for us.
                tokio::time::sleep(cluster.config.join_settle()).await;
                if let Err(err) = cluster.join(&leader).await {
                    cluster.shutdown();
                    return Err(err);
                }
            }
        }

        Ok(cluster)
    }

    /// A leader the consensus module already knows about (after a restart)
    /// wins over the configured one.
    fn join_target(&self) -> Result<Option<String>> {
        if let Some(leader) = self.consensus.leader_address() {
            if leader != self.config.raft_address() {
                return self.config.http_address_for(&leader).map(Some);
            }
        }
        Ok(self
            .config
            .raft_leader
            .as_deref()
            .filter(|leader| !leader.is_empty())
            .map(normalize_base_url))
    }

    /// Asks the leader at `leader` (an HTTP base URL) to add this node.
    async fn join(&self, leader: &str) -> Result<()> {
        let request = JoinRequest {
            id: self.node_id().to_string(),
            address: self.config.raft_address(),
        };
        let url = format!("{leader}/raft/add");
        info!(%url, id = %request.id, address = %request.address, "asking leader to add this node");

        let join_err = |reason: String| Error::Join {
            leader: leader.to_string(),
            reason,
        };
        let client = reqwest::Client::builder()
            .timeout(self.config.join_timeout() + Duration::from_secs(5))
            .build()
            .map_err(|err| join_err(err.to_string()))?;
        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| join_err(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(join_err(format!("{status}: {}", body.trim())));
        }
        debug!(leader, %status, "added self to leader");
        Ok(())
    }

    /// Sets `key` to `value` through the replicated log.
    ///
    /// # Errors
    ///
    /// [`Error::NotLeader`] on a non-leader, [`Error::CommitTimeout`] if the
    /// entry is not applied in time, or the state machine's apply error.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        let command = Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.consensus
            .submit(command.encode()?, self.config.commit_timeout())
            .await
    }

    /// Removes `key` through the replicated log. Deleting an absent key
    /// succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        let key = if self.config.legacy_delete_key {
            LEGACY_DELETE_KEY
        } else {
            key
        };
        let command = Command::Delete {
            key: key.to_string(),
        };
        self.consensus
            .submit(command.encode()?, self.config.commit_timeout())
            .await
    }

    /// Reads `key` from this node's local copy. May be stale on followers;
    /// absent keys read as the empty string.
    pub fn get(&self, key: &str) -> Result<String> {
        self.fsm.local_get(key)
    }

    /// Adds a voting member. Only the leader can do this.
    pub async fn add_voter(&self, id: u64, address: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        info!(peer = id, address, "adding voter");
        self.consensus
            .add_voter(id, address, self.config.join_timeout())
            .await
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.role() == Role::Leader
    }

    /// Transport address of the current leader, if known.
    pub fn leader_address(&self) -> Option<String> {
        self.consensus.leader_address()
    }

    /// Base URL of a member's HTTP API, derived from its transport address.
    pub fn http_address_for(&self, raft_address: &str) -> Result<String> {
        self.config.http_address_for(raft_address)
    }

    pub fn node_id(&self) -> u64 {
        self.consensus.node_id()
    }

    pub fn status(&self) -> ConsensusStatus {
        self.consensus.status()
    }

    pub fn consensus(&self) -> &ConsensusHandle {
        &self.consensus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the leadership watcher and the consensus worker.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.consensus.shutdown();
    }

    /// True once the leadership watcher has exited.
    pub fn watcher_finished(&self) -> bool {
        self.watcher.is_finished()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Logs leadership changes and, on gaining leadership, takes a snapshot
/// with probability 1 in `chance`.
async fn watch_leadership(
    consensus: ConsensusHandle,
    mut leadership: broadcast::Receiver<bool>,
    chance: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            change = leadership.recv() => match change {
                Ok(true) => {
                    info!("cluster leadership acquired");
                    if should_snapshot(chance) {
                        match consensus.snapshot().await {
                            Ok(Some(index)) => info!(index, "snapshot taken"),
                            Ok(None) => debug!("nothing new to snapshot"),
                            Err(err) => error!(error = %err, "snapshot failed"),
                        }
                    }
                }
                Ok(false) => info!("cluster leadership lost"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed leadership changes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("leadership watcher stopped");
}

fn should_snapshot(chance: u32) -> bool {
    chance > 0 && rand::thread_rng().gen_range(0..chance) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusConfig;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// A bootstrapped single-node leader with threshold compaction disabled,
    /// so only explicit snapshot requests move the snapshot index.
    async fn leader_without_auto_snapshots(dir: &TempDir) -> ConsensusHandle {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let mut config = ConsensusConfig::new(addr, dir.path());
        config.tick_interval = Duration::from_millis(20);
        config.snapshot_threshold = 0;
        let fsm = Arc::new(KvStateMachine::open(dir.path(), Duration::from_millis(50)));
        let consensus = consensus::start(config, fsm).unwrap();
        consensus.bootstrap_single_member().await.unwrap();
        consensus
    }

    /// Feeds `events` to a watcher that snapshots on every gain, and waits
    /// for it to drain them.
    async fn run_watcher(consensus: &ConsensusHandle, events: &[bool]) {
        let (tx, rx) = broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for event in events {
            tx.send(*event).unwrap();
        }
        // Closing the channel ends the watcher once the events are consumed.
        drop(tx);
        watch_leadership(consensus.clone(), rx, 1, shutdown_rx).await;
    }

    fn write(key: &str) -> Vec<u8> {
        Command::Set {
            key: key.into(),
            value: "v".into(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn only_leadership_gain_triggers_snapshot() {
        let dir = TempDir::new().unwrap();
        let consensus = leader_without_auto_snapshots(&dir).await;
        consensus.submit(write("a"), TIMEOUT).await.unwrap();
        let before = consensus.status().snapshot_index;

        run_watcher(&consensus, &[false, false, false]).await;
        // Nothing was compacted, so an explicit snapshot still has new entries.
        assert_eq!(consensus.status().snapshot_index, before);
        let index = consensus.snapshot().await.unwrap();
        assert!(index.is_some_and(|index| index > before), "{index:?}");

        consensus.submit(write("b"), TIMEOUT).await.unwrap();
        run_watcher(&consensus, &[true]).await;
        assert_eq!(consensus.snapshot().await.unwrap(), None);

        consensus.shutdown();
    }

    #[test]
    fn join_request_uses_capitalized_fields() {
        let request = JoinRequest {
            id: "42".into(),
            address: "localhost:8081".into(),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"ID":"42","Address":"localhost:8081"}"#
        );
    }

    #[test]
    fn snapshot_chance_bounds() {
        assert!(!should_snapshot(0));
        assert!((0..100).all(|_| should_snapshot(1)));
    }
}
