//! The replicated state machine.
//!
//! [`KvStateMachine`] is the only place where committed log entries turn into
//! changes to the durable mapping. The consensus worker calls it strictly in
//! log order, one entry at a time, so every node that applies the same log
//! ends up with a byte-identical data file.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::command::Command;
use crate::consensus::{FsmSnapshot, StateMachine};
use crate::error::{Error, Result};
use crate::store::{DurableStore, codec};

pub struct KvStateMachine {
    store: DurableStore,
}

impl KvStateMachine {
    pub fn new(store: DurableStore) -> Self {
        Self { store }
    }

    /// Opens the state machine over `<dir>/data.json`.
    pub fn open(dir: impl AsRef<Path>, lock_timeout: Duration) -> Self {
        Self::new(DurableStore::in_dir(dir, lock_timeout))
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    /// Reads a key straight from the local data file, without going through
    /// the log. Absent keys read as the empty string.
    ///
    /// Uses the fail-fast lock: a read that overlaps an apply reports
    /// [`Error::LockContention`] rather than waiting.
    pub fn local_get(&self, key: &str) -> Result<String> {
        let mapping = self.store.load()?;
        Ok(mapping.get(key).cloned().unwrap_or_default())
    }

    fn apply_command(&self, command: Command) -> Result<()> {
        // Committed entries must not be skipped, so wait for the lock.
        let guard = self.store.lock_blocking();
        let mut mapping = guard.load()?;
        match command {
            Command::Set { key, value } => {
                mapping.insert(key, value);
            }
            Command::Delete { key } => {
                if mapping.remove(&key).is_none() {
                    debug!(key = %key, "delete of absent key");
                }
            }
        }
        guard.save(&mapping)
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, data: &[u8]) -> Result<()> {
        let command = match Command::decode(data) {
            Ok(command) => command,
            Err(err) => {
                // Committed no-op: reporting failure here could diverge the cluster.
                error!(
                    error = %err,
                    data = %String::from_utf8_lossy(data),
                    "failed command unmarshal"
                );
                return Ok(());
            }
        };
        debug!(key = command.key(), "fsm apply");
        self.apply_command(command)
    }

    fn snapshot(&self) -> Result<FsmSnapshot> {
        info!("fsm snapshot");
        let guard = self.store.lock_blocking();
        Ok(FsmSnapshot::new(guard.load_encoded()?))
    }

    fn restore(&self, snapshot: &mut dyn Read) -> Result<()> {
        info!("fsm restore");
        let mut bytes = Vec::new();
        snapshot
            .read_to_end(&mut bytes)
            .map_err(|err| Error::storage("read snapshot", err))?;

        // Decode fully before touching the data file.
        let mapping = codec::decode(&bytes)?;
        let guard = self.store.lock_blocking();
        guard.save(&mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Mapping;
    use std::fs;
    use tempfile::TempDir;

    fn fsm(dir: &TempDir) -> KvStateMachine {
        KvStateMachine::open(dir.path(), Duration::from_millis(10))
    }

    fn set(key: &str, value: &str) -> Vec<u8> {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
        .encode()
        .unwrap()
    }

    fn delete(key: &str) -> Vec<u8> {
        Command::Delete { key: key.into() }.encode().unwrap()
    }

    #[test]
    fn set_then_delete() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);

        assert_eq!(fsm.local_get("k").unwrap(), "");
        fsm.apply(&set("k", "v")).unwrap();
        assert_eq!(fsm.local_get("k").unwrap(), "v");
        fsm.apply(&set("k", "v2")).unwrap();
        assert_eq!(fsm.local_get("k").unwrap(), "v2");
        fsm.apply(&delete("k")).unwrap();
        assert_eq!(fsm.local_get("k").unwrap(), "");
    }

    #[test]
    fn deleting_absent_key_leaves_mapping_unchanged() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);
        fsm.apply(&set("keep", "me")).unwrap();
        let before = fs::read(fsm.store().path()).unwrap();

        fsm.apply(&delete("missing")).unwrap();

        assert_eq!(fs::read(fsm.store().path()).unwrap(), before);
    }

    #[test]
    fn malformed_entries_are_committed_no_ops() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);
        fsm.apply(&set("k", "v")).unwrap();

        fsm.apply(b"not a command").unwrap();
        fsm.apply(br#"{"action":"rename","key":"k"}"#).unwrap();

        assert_eq!(fsm.store().load().unwrap().len(), 1);
        assert_eq!(fsm.local_get("k").unwrap(), "v");
    }

    #[test]
    fn same_commands_converge_byte_for_byte() {
        let commands = vec![
            set("a", "1"),
            set("b", "2"),
            delete("a"),
            set("c", "3"),
            set("b", "22"),
            delete("zzz"),
            set("a", "111"),
        ];

        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (fsm_a, fsm_b) = (fsm(&dir_a), fsm(&dir_b));
        for command in &commands {
            fsm_a.apply(command).unwrap();
            fsm_b.apply(command).unwrap();
        }

        let bytes_a = fs::read(fsm_a.store().path()).unwrap();
        let bytes_b = fs::read(fsm_b.store().path()).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(
            codec::decode(&bytes_a).unwrap(),
            Mapping::from([
                ("a".to_string(), "111".to_string()),
                ("b".to_string(), "22".to_string()),
                ("c".to_string(), "3".to_string()),
            ])
        );
    }

    #[test]
    fn restore_of_own_snapshot_is_identity() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);
        fsm.apply(&set("x", "1")).unwrap();
        fsm.apply(&set("y", "2")).unwrap();
        let before = fsm.store().load().unwrap();

        let snapshot = fsm.snapshot().unwrap();
        fsm.restore(&mut snapshot.as_bytes()).unwrap();
        fsm.restore(&mut snapshot.as_bytes()).unwrap();

        assert_eq!(fsm.store().load().unwrap(), before);
    }

    #[test]
    fn restore_replaces_existing_state() {
        let (source_dir, target_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let source = fsm(&source_dir);
        source.apply(&set("from", "source")).unwrap();
        let mut blob = Vec::new();
        source.snapshot().unwrap().persist(&mut blob).unwrap();

        let target = fsm(&target_dir);
        target.apply(&set("stale", "value")).unwrap();
        target.restore(&mut blob.as_slice()).unwrap();

        assert_eq!(target.local_get("stale").unwrap(), "");
        assert_eq!(target.local_get("from").unwrap(), "source");
        assert_eq!(target.store().load().unwrap(), source.store().load().unwrap());
    }

    #[test]
    fn failed_restore_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);
        fsm.apply(&set("k", "v")).unwrap();

        let corrupt = br#"{"a2V5":"dmFsdWU=","!!":"??"}"#;
        let err = fsm.restore(&mut corrupt.as_slice()).unwrap_err();

        assert!(err.is_storage(), "{err:?}");
        assert_eq!(fsm.local_get("k").unwrap(), "v");
    }

    #[test]
    fn local_get_reports_contention_while_apply_holds_the_lock() {
        let dir = TempDir::new().unwrap();
        let fsm = fsm(&dir);
        let _guard = fsm.store().lock().unwrap();

        let err = fsm.local_get("k").unwrap_err();
        assert!(matches!(err, Error::LockContention(_)), "{err:?}");
    }
}
