//! Durable storage for the replicated key-value mapping.
//!
//! The whole mapping lives in a single file (`data.json` by default) and is
//! read and rewritten in full on every operation. There is no awareness of
//! replication here: the state machine decides what to write, this module only
//! makes sure reads and writes of the file do not interleave.
//!
//! Access is serialized by an in-process mutex. [`DurableStore::lock`] waits a
//! short, bounded time and then fails with [`Error::LockContention`] instead
//! of queueing; [`DurableStore::lock_blocking`] waits as long as it takes and
//! is reserved for the commit pipeline, which must never drop an entry.

pub mod codec;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

pub use codec::Mapping;

/// File name of the mapping inside the storage directory.
pub const DATA_FILE: &str = "data.json";

/// File-backed key-value mapping guarded by a mutual-exclusion lock.
pub struct DurableStore {
    path: PathBuf,
    lock: Mutex<()>,
    lock_timeout: Duration,
}

impl DurableStore {
    /// Creates a store backed by `path`. Nothing touches the disk until the
    /// first load or save.
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// Creates a store backed by `<dir>/data.json`.
    pub fn in_dir(dir: impl AsRef<Path>, lock_timeout: Duration) -> Self {
        Self::new(dir.as_ref().join(DATA_FILE), lock_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the store lock, giving up after the configured timeout.
    pub fn lock(&self) -> Result<StoreGuard<'_>> {
        match self.lock.try_lock_for(self.lock_timeout) {
            Some(guard) => Ok(StoreGuard {
                store: self,
                _guard: guard,
            }),
            None => Err(Error::LockContention(self.path.clone())),
        }
    }

    /// Takes the store lock, waiting for it if necessary.
    pub fn lock_blocking(&self) -> StoreGuard<'_> {
        StoreGuard {
            store: self,
            _guard: self.lock.lock(),
        }
    }

    /// Reads the full mapping, creating an empty data file if none exists.
    pub fn load(&self) -> Result<Mapping> {
        self.lock()?.load()
    }

    /// Overwrites the data file with `mapping`.
    pub fn save(&self, mapping: &Mapping) -> Result<()> {
        self.lock()?.save(mapping)
    }
}

/// Exclusive access to the data file for the lifetime of the guard.
///
/// Holding one guard across `load` and `save` makes a read-modify-write
/// atomic with respect to every other user of the same store.
pub struct StoreGuard<'a> {
    store: &'a DurableStore,
    _guard: MutexGuard<'a, ()>,
}

impl StoreGuard<'_> {
    pub fn load(&self) -> Result<Mapping> {
        let path = &self.store.path;
        if !path.exists() {
            debug!(path = %path.display(), "data file missing, creating empty mapping");
            self.write_bytes(&codec::encode(&Mapping::new())?)?;
        }

        let content = fs::read(path)
            .map_err(|err| Error::storage(format!("read {}", path.display()), err))?;
        codec::decode(&content)
    }

    pub fn save(&self, mapping: &Mapping) -> Result<()> {
        self.write_bytes(&codec::encode(mapping)?)
    }

    /// Reads the raw encoded file, creating it first if needed.
    pub fn load_encoded(&self) -> Result<Vec<u8>> {
        let mapping = self.load()?;
        codec::encode(&mapping)
    }

    /// Writes to a sibling temp file and renames it into place, so readers
    /// never observe a half-written mapping.
    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let path = &self.store.path;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|err| Error::storage(format!("create {}", dir.display()), err))?;
        }

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|err| Error::storage(format!("create {}", tmp.display()), err))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|err| Error::storage(format!("write {}", tmp.display()), err))?;
        fs::rename(&tmp, path)
            .map_err(|err| Error::storage(format!("rename to {}", path.display()), err))
    }
}
