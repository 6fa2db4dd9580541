//! Replicated key-value store.
//!
//! Every node keeps the full mapping in one base64-JSON file. Writes go
//! through a Raft log (the tikv `raft` crate) and are applied in commit order
//! on every node, so all copies converge byte for byte. Reads are served from
//! the local file.
//!
//! # Architecture
//!
//! - **HTTP tasks** (tokio/axum): client API, forwarded to the leader when
//!   this node isn't it
//! - **Consensus worker thread**: drives the Raft node and applies committed
//!   entries to the state machine, one at a time
//! - **Transport threads**: one listener plus one sender per peer
//! - **Leadership watcher task**: logs leadership changes and occasionally
//!   snapshots on gaining leadership
//!
//! # Modules
//!
//! - [`store`]: the durable mapping and its file encoding
//! - [`command`]: commands replicated through the log
//! - [`fsm`]: state machine applying commands to the store
//! - [`consensus`]: Raft storage, node, transport, and worker runtime
//! - [`cluster`]: coordinator with bootstrap and join
//! - [`http`]: HTTP API and leader forwarding
//! - [`config`]: flags and environment variables

pub mod cluster;
pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod http;
pub mod store;

pub use cluster::Cluster;
pub use config::Config;
pub use error::{Error, Result};
