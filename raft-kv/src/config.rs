//! Node configuration, read from flags or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::consensus::ConsensusConfig;
use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_STORAGE_PATH: &str = "/tmp/kv";
const DEFAULT_RAFT_ADDRESS: &str = "localhost";
const DEFAULT_RAFT_PORT: u16 = 8081;
const DEFAULT_HTTP_PORT_OFFSET: i32 = -1;
const DEFAULT_COMMIT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 60;
const DEFAULT_JOIN_SETTLE_SECS: u64 = 10;
const DEFAULT_LOCK_TIMEOUT_MICROS: u64 = 500;
const DEFAULT_SNAPSHOT_CHANCE: u32 = 10;
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;
const DEFAULT_SNAPSHOT_RETAIN: usize = 5;

/// Command-line arguments for a key-value node. Every flag can also be set
/// through the environment variable named next to it.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a replicated key-value store node")]
pub struct Config {
    /// Port the HTTP API listens on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory for the data file and the consensus log, state, and snapshots
    #[arg(
        long,
        env = "STORAGE_PATH",
        default_value = DEFAULT_STORAGE_PATH,
        value_hint = ValueHint::DirPath
    )]
    pub storage_path: PathBuf,

    /// Host this node advertises for the raft transport
    #[arg(
        long,
        env = "RAFT_ADDRESS",
        default_value = DEFAULT_RAFT_ADDRESS,
        value_hint = ValueHint::Hostname
    )]
    pub raft_address: String,

    /// Port of the raft transport
    #[arg(long, env = "RAFT_PORT", default_value_t = DEFAULT_RAFT_PORT)]
    pub raft_port: u16,

    /// HTTP address of an existing cluster member to join, e.g. http://localhost:8080.
    /// Omit to start a new single-node cluster.
    #[arg(long, env = "RAFT_LEADER", value_hint = ValueHint::Url)]
    pub raft_leader: Option<String>,

    /// Node id to use on first start (random if omitted, persisted afterwards)
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<u64>,

    /// Offset from a member's raft port to its HTTP port
    #[arg(
        long,
        env = "HTTP_PORT_OFFSET",
        default_value_t = DEFAULT_HTTP_PORT_OFFSET,
        allow_hyphen_values = true
    )]
    pub http_port_offset: i32,

    /// Seconds a write waits for its entry to commit
    #[arg(long, env = "COMMIT_TIMEOUT_SECS", default_value_t = DEFAULT_COMMIT_TIMEOUT_SECS)]
    pub commit_timeout_secs: u64,

    /// Seconds a membership change waits to be applied
    #[arg(long, env = "JOIN_TIMEOUT_SECS", default_value_t = DEFAULT_JOIN_TIMEOUT_SECS)]
    pub join_timeout_secs: u64,

    /// Seconds to wait before asking the leader to add this node
    #[arg(long, env = "JOIN_SETTLE_SECS", default_value_t = DEFAULT_JOIN_SETTLE_SECS)]
    pub join_settle_secs: u64,

    /// Microseconds to wait for the data file lock before giving up
    #[arg(long, env = "LOCK_TIMEOUT_MICROS", default_value_t = DEFAULT_LOCK_TIMEOUT_MICROS)]
    pub lock_timeout_micros: u64,

    /// Take a snapshot on 1 in N leadership gains (0 disables)
    #[arg(long, env = "SNAPSHOT_CHANCE", default_value_t = DEFAULT_SNAPSHOT_CHANCE)]
    pub snapshot_chance: u32,

    /// Compact the log after this many applied entries (0 disables)
    #[arg(long, env = "SNAPSHOT_THRESHOLD", default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,

    /// Number of snapshots kept on disk
    #[arg(long, env = "SNAPSHOT_RETAIN", default_value_t = DEFAULT_SNAPSHOT_RETAIN)]
    pub snapshot_retain: usize,

    /// Make DELETE remove the literal key "key" instead of the requested one
    #[arg(long, env = "LEGACY_DELETE_KEY")]
    pub legacy_delete_key: bool,
}

/// The flag defaults, without reading the environment.
impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            raft_address: DEFAULT_RAFT_ADDRESS.to_string(),
            raft_port: DEFAULT_RAFT_PORT,
            raft_leader: None,
            node_id: None,
            http_port_offset: DEFAULT_HTTP_PORT_OFFSET,
            commit_timeout_secs: DEFAULT_COMMIT_TIMEOUT_SECS,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
            join_settle_secs: DEFAULT_JOIN_SETTLE_SECS,
            lock_timeout_micros: DEFAULT_LOCK_TIMEOUT_MICROS,
            snapshot_chance: DEFAULT_SNAPSHOT_CHANCE,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            snapshot_retain: DEFAULT_SNAPSHOT_RETAIN,
            legacy_delete_key: false,
        }
    }
}

impl Config {
    /// Transport address this node binds and advertises, `host:port`.
    pub fn raft_address(&self) -> String {
        format!("{}:{}", self.raft_address, self.raft_port)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_secs(self.join_settle_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_micros(self.lock_timeout_micros)
    }

    /// Maps a member's transport address to the base URL of its HTTP API.
    pub fn http_address_for(&self, raft_address: &str) -> Result<String> {
        let invalid = || Error::Config(format!("cannot map raft address {raft_address:?} to http"));
        let (host, port) = raft_address.rsplit_once(':').ok_or_else(invalid)?;
        let port: i64 = port.parse().map_err(|_| invalid())?;
        let http_port = u16::try_from(port + i64::from(self.http_port_offset))
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(invalid)?;
        Ok(format!("http://{host}:{http_port}"))
    }

    pub fn consensus(&self) -> ConsensusConfig {
        let mut config = ConsensusConfig::new(self.raft_address(), &self.storage_path);
        config.node_id = self.node_id;
        config.snapshot_threshold = self.snapshot_threshold;
        config.snapshot_retain = self.snapshot_retain;
        config
    }
}

/// Adds `http://` to a leader address given without a scheme.
pub fn normalize_base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
