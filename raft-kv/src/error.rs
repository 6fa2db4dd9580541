//! Error taxonomy shared by the store, the state machine, and the cluster layer.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A write reached a node that is not the current leader.
    #[error("not leader")]
    NotLeader,

    /// I/O failure against the data file or one of its directories.
    #[error("storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The data file or a snapshot blob did not decode to a mapping.
    #[error("storage error: corrupt data: {0}")]
    Corrupt(String),

    /// The store lock could not be taken inside the configured window.
    #[error("couldn't get lock on {}", .0.display())]
    LockContention(PathBuf),

    /// The log entry was not committed within the bound. It may still apply later.
    #[error("timed out after {0:?} waiting for the entry to commit")]
    CommitTimeout(Duration),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    /// Bootstrap was requested on a node that already has consensus state.
    #[error("node already has consensus state, bootstrap only works on new clusters")]
    AlreadyBootstrapped,

    #[error("consensus module is shut down")]
    Shutdown,

    #[error("failed adding self to leader {leader}: {reason}")]
    Join { leader: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Error::Storage {
            context: context.into(),
            source,
        }
    }

    /// True for both I/O and decode failures against durable state.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Corrupt(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // Typed errors that were wrapped with context keep their variant.
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::Consensus(format!("{err:#}")),
        }
    }
}
