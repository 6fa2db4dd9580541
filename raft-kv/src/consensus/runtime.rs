//! Worker runtime for the consensus module.
//!
//! - **Worker thread**: owns the [`RaftNode`], runs the Raft event loop, and
//!   answers requests from [`ConsensusHandle`]s
//! - **Transport threads**: accept peer connections and feed decoded
//!   messages to the worker; per-peer senders carry outbound messages
//!
//! Communication uses crossbeam channels so the worker stays single-threaded
//! (and the state machine is only ever called from it). Async callers wait on
//! tokio oneshot replies; the worker publishes its status through a `watch`
//! channel and leadership changes through a `broadcast` channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, unbounded};
use raft::StateRole;
use raft::prelude::Message;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::node::{ApplyReport, EntryKind, NodeOptions, RaftNode};
use super::storage::LogStore;
use super::transport::{Incoming, Transport};
use super::{ConsensusStatus, Role, StateMachine};
use crate::error::{Error, Result};

/// Raft logical clock interval. Heartbeats go out every 3 ticks and
/// elections start after 10-20 quiet ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for starting the consensus module.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Pins the id of a brand-new node. `None` generates one on first start;
    /// after that the persisted id is used.
    pub node_id: Option<u64>,
    /// Transport address to bind and advertise (e.g. "localhost:8081").
    pub address: String,
    /// Directory holding the log, stable state, and snapshots.
    pub dir: PathBuf,
    pub tick_interval: Duration,
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
}

impl ConsensusConfig {
    pub fn new(address: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: None,
            address: address.into(),
            dir: dir.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            snapshot_threshold: NodeOptions::default().snapshot_threshold,
            snapshot_retain: 5,
        }
    }
}

/// Handle for talking to a running consensus worker.
///
/// Cheap to clone. Reads (`role`, `leader_address`, `status`) come from the
/// last status the worker published and never block.
#[derive(Clone)]
pub struct ConsensusHandle {
    request_tx: Sender<Request>,
    status_rx: watch::Receiver<ConsensusStatus>,
    leadership_tx: broadcast::Sender<bool>,
}

impl ConsensusHandle {
    /// Appends `command` to the log and waits for it to be applied.
    ///
    /// # Errors
    /// - [`Error::NotLeader`] if this node is not the leader
    /// - [`Error::CommitTimeout`] if the entry isn't applied within `timeout`;
    ///   it may still be applied later
    /// - whatever the state machine returned when applying the entry
    pub async fn submit(&self, command: Vec<u8>, timeout: Duration) -> Result<()> {
        if self.role() != Role::Leader {
            return Err(Error::NotLeader);
        }
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Submit {
            data: command,
            respond_to,
        })?;
        wait(rx, timeout).await?
    }

    /// Proposes adding a voting member and waits until the change is applied.
    pub async fn add_voter(&self, id: u64, address: &str, timeout: Duration) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::AddVoter {
            id,
            address: address.to_string(),
            respond_to,
        })?;
        wait(rx, timeout).await?
    }

    /// Makes this node the sole member of a new cluster.
    ///
    /// Fails with [`Error::AlreadyBootstrapped`] if the node already has raft
    /// state; any other error means the initial configuration was not stored.
    pub async fn bootstrap_single_member(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Bootstrap { respond_to })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Snapshots the state machine and compacts the log at the applied index.
    /// Returns the snapshot index, or `None` if there was nothing new.
    pub async fn snapshot(&self) -> Result<Option<u64>> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Snapshot { respond_to })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub fn role(&self) -> Role {
        self.status_rx.borrow().role
    }

    /// Transport address of the current leader, if one is known.
    pub fn leader_address(&self) -> Option<String> {
        self.status_rx.borrow().leader_address.clone()
    }

    pub fn node_id(&self) -> u64 {
        self.status_rx.borrow().node_id
    }

    pub fn status(&self) -> ConsensusStatus {
        self.status_rx.borrow().clone()
    }

    /// Receives `true` when this node becomes leader and `false` when it
    /// stops being leader.
    pub fn subscribe_leadership(&self) -> broadcast::Receiver<bool> {
        self.leadership_tx.subscribe()
    }

    /// Stops the worker. Pending requests fail with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        // A closed channel means the worker already exited.
        let _ = self.request_tx.send(Request::Shutdown);
    }

    fn send(&self, request: Request) -> Result<()> {
        self.request_tx.send(request).map_err(|_| Error::Shutdown)
    }
}

async fn wait<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Error::Shutdown),
        Err(_) => Err(Error::CommitTimeout(timeout)),
    }
}

/// Requests sent from handles to the worker thread.
enum Request {
    Submit {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    AddVoter {
        id: u64,
        address: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Result<Option<u64>>>,
    },
    Shutdown,
}

/// A proposal waiting for its entry to be applied.
///
/// Keyed by log index. The entry applied at that index answers the request
/// only if it carries the same term and kind; otherwise a different leader
/// overwrote it, or raft dropped the proposal.
struct Pending {
    term: u64,
    kind: EntryKind,
    respond_to: oneshot::Sender<Result<()>>,
}

/// Starts the consensus module: opens storage, binds the transport, and
/// spawns the worker.
///
/// # Errors
///
/// Fails if the storage cannot be opened or the transport address cannot be
/// bound. Callers treat this as fatal.
pub fn start(config: ConsensusConfig, fsm: Arc<dyn StateMachine>) -> Result<ConsensusHandle> {
    let storage = LogStore::open(
        &config.dir,
        config.node_id,
        &config.address,
        config.snapshot_retain,
    )?;
    let node = RaftNode::new(
        storage,
        fsm,
        NodeOptions {
            snapshot_threshold: config.snapshot_threshold,
        },
    )?;
    let id = node.id();

    let (inbound_tx, inbound_rx) = unbounded();
    let transport = Transport::bind(&config.address, inbound_tx)?;
    let (request_tx, request_rx) = unbounded();
    let (status_tx, status_rx) = watch::channel(node.status());
    let (leadership_tx, _) = broadcast::channel(16);

    let mut worker = Worker {
        last_role: node.role(),
        node,
        transport,
        request_rx,
        inbound_rx,
        pending: HashMap::new(),
        status_tx,
        leadership_tx: leadership_tx.clone(),
        tick_interval: config.tick_interval,
    };
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node_id = id, error = %format!("{err:#}"), "raft worker crashed");
            }
            worker.fail_pending(|| Error::Shutdown);
            worker.transport.shutdown();
        })
        .context("failed to spawn raft worker")?;

    info!(node_id = id, address = %config.address, "consensus module started");
    Ok(ConsensusHandle {
        request_tx,
        status_rx,
        leadership_tx,
    })
}

/// The worker that runs the Raft event loop.
///
/// Processes three kinds of events:
/// 1. **Requests** from handles
/// 2. **Network messages** from peers
/// 3. **Ticks** to drive Raft timeouts
struct Worker {
    node: RaftNode,
    transport: Transport,
    request_rx: Receiver<Request>,
    inbound_rx: Receiver<Incoming>,
    pending: HashMap<u64, Pending>,
    status_tx: watch::Sender<ConsensusStatus>,
    leadership_tx: broadcast::Sender<bool>,
    last_role: StateRole,
    tick_interval: Duration,
}

impl Worker {
    /// Runs until shutdown is requested or every handle is dropped.
    fn run(&mut self) -> anyhow::Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.inbound_rx) -> incoming => {
                    match incoming {
                        Ok(incoming) => self.handle_incoming(incoming)?,
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
        }

        info!(node_id = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_request(&mut self, req: Request) -> anyhow::Result<bool> {
        match req {
            Request::Submit { data, respond_to } => match self.node.propose(data) {
                Ok((index, term)) => self.track(index, term, EntryKind::Command, respond_to),
                Err(err) => {
                    let _ = respond_to.send(Err(err.into()));
                }
            },
            Request::AddVoter {
                id,
                address,
                respond_to,
            } => {
                if self.node.storage().conf_state().voters.contains(&id) {
                    // Re-joining member: refresh its address, nothing to propose.
                    self.node.storage().record_peer(id, &address)?;
                    let _ = respond_to.send(Ok(()));
                } else {
                    match self.node.propose_add_voter(id, &address) {
                        Ok((index, term)) => {
                            info!(
                                node_id = self.node.id(),
                                peer = id,
                                %address,
                                index,
                                "proposed new voter"
                            );
                            self.track(index, term, EntryKind::Membership, respond_to);
                        }
                        Err(err) => {
                            let _ = respond_to.send(Err(err.into()));
                        }
                    }
                }
            }
            Request::Bootstrap { respond_to } => {
                let result = if self.node.storage().is_initialized() {
                    Err(Error::AlreadyBootstrapped)
                } else {
                    self.node.bootstrap().map_err(Error::from)
                };
                // Answer once the campaign has been processed, so the caller
                // already observes the new leadership.
                self.process_ready()?;
                let _ = respond_to.send(result);
            }
            Request::Snapshot { respond_to } => {
                let _ = respond_to.send(self.node.snapshot().map_err(Error::from));
            }
            Request::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn track(
        &mut self,
        index: u64,
        term: u64,
        kind: EntryKind,
        respond_to: oneshot::Sender<Result<()>>,
    ) {
        if let Some(stale) = self.pending.insert(
            index,
            Pending {
                term,
                kind,
                respond_to,
            },
        ) {
            let _ = stale.respond_to.send(Err(Error::NotLeader));
        }
    }

    fn handle_incoming(&mut self, incoming: Incoming) -> anyhow::Result<()> {
        let Incoming { from_addr, message } = incoming;
        if message.from != 0 && message.from != self.node.id() {
            self.node.storage().record_peer(message.from, &from_addr)?;
        }
        if let Err(err) = self.node.step(message) {
            // Messages from members this node doesn't know yet are expected
            // while a join is in flight.
            debug!(node_id = self.node.id(), error = %format!("{err:#}"), "dropped raft message");
        }
        Ok(())
    }

    /// Drains all ready state from Raft and processes it.
    fn process_ready(&mut self) -> anyhow::Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify(report);
            }
        }
        self.observe_role();
        self.publish_status();
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> anyhow::Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        let to = msg.to;
        let Some(addr) = self.node.storage().peer_address(to) else {
            debug!(node_id = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        self.transport.send(&addr, &msg)
    }

    fn notify(&mut self, report: ApplyReport) {
        debug!(
            node_id = self.node.id(),
            index = report.index,
            term = report.term,
            kind = ?report.kind,
            "applied"
        );
        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        let result = if pending.term != report.term {
            Err(Error::Consensus(format!(
                "entry {} was replaced by a newer leader",
                report.index
            )))
        } else if pending.kind != report.kind {
            Err(Error::Consensus(format!(
                "proposal at {} was dropped; another membership change is in progress",
                report.index
            )))
        } else {
            report.outcome
        };
        // The caller may have timed out already.
        let _ = pending.respond_to.send(result);
    }

    fn observe_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            node_id = self.node.id(),
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        let was_leader = self.last_role == StateRole::Leader;
        let is_leader = current == StateRole::Leader;
        self.last_role = current;
        if was_leader != is_leader {
            if !is_leader && !self.pending.is_empty() {
                warn!(pending = self.pending.len(), "lost leadership with proposals in flight");
            }
            // No subscribers is fine.
            let _ = self.leadership_tx.send(is_leader);
        }
    }

    fn publish_status(&self) {
        let status = self.node.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.respond_to.send(Err(err()));
        }
    }
}
