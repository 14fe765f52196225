//! Durable replication state.
//!
//! The acceptor's `(promised, accepted)` state must reach disk before any
//! reply leaves the node, and the restart counter feeding proposal ids must
//! survive restarts. Both are small atomically-replaced JSON files; chosen
//! values are kept for a bounded window so lagging peers can be answered.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use silo_tools::fs::replace_file;

/// How many recent chosen values are retained for catchup replies.
const CHOSEN_RETENTION: u64 = 256;

/// Acceptor state for the current paxos instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptorState {
    pub paxos_id: u64,
    /// 0 means nothing promised yet.
    pub promised_proposal_id: u64,
    pub accepted_proposal_id: Option<u64>,
    pub accepted_value: Option<Vec<u8>>,
}

pub trait ReplicationStore {
    /// Increment and persist the restart counter; returns the new value.
    fn bump_restart_counter(&mut self) -> Result<u64, Error>;

    /// Persist acceptor state; must be durable before replying.
    fn save_acceptor_state(&mut self, state: &AcceptorState) -> Result<(), Error>;

    fn load_acceptor_state(&mut self) -> Result<Option<AcceptorState>, Error>;

    fn save_chosen(&mut self, paxos_id: u64, value: &[u8]) -> Result<(), Error>;

    fn load_chosen(&mut self, paxos_id: u64) -> Result<Option<Vec<u8>>, Error>;
}

#[derive(Serialize, Deserialize, Default)]
struct CounterFile {
    restart_counter: u64,
}

/// File-backed store under `<dir>/replication/`.
pub struct FileReplicationStore {
    dir: PathBuf,
}

impl FileReplicationStore {
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, Error> {
        let dir = dir.into();
        silo_tools::fs::create_path(&dir)?;
        Ok(Self { dir })
    }

    fn counter_path(&self) -> PathBuf {
        self.dir.join("restart_counter")
    }

    fn acceptor_path(&self) -> PathBuf {
        self.dir.join("acceptor_state")
    }

    fn chosen_path(&self, paxos_id: u64) -> PathBuf {
        self.dir.join(format!("chosen.{}", paxos_id))
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &std::path::Path,
    ) -> Result<Option<T>, Error> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to read {:?} - {}", path, err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl ReplicationStore for FileReplicationStore {
    fn bump_restart_counter(&mut self) -> Result<u64, Error> {
        let mut counter: CounterFile = self.read_json(&self.counter_path())?.unwrap_or_default();
        counter.restart_counter += 1;
        replace_file(
            self.counter_path(),
            &serde_json::to_vec(&counter)?,
            true,
        )?;
        Ok(counter.restart_counter)
    }

    fn save_acceptor_state(&mut self, state: &AcceptorState) -> Result<(), Error> {
        replace_file(self.acceptor_path(), &serde_json::to_vec(state)?, true)
    }

    fn load_acceptor_state(&mut self) -> Result<Option<AcceptorState>, Error> {
        self.read_json(&self.acceptor_path())
    }

    fn save_chosen(&mut self, paxos_id: u64, value: &[u8]) -> Result<(), Error> {
        replace_file(self.chosen_path(paxos_id), value, false)?;
        if paxos_id > CHOSEN_RETENTION {
            let _ = std::fs::remove_file(self.chosen_path(paxos_id - CHOSEN_RETENTION));
        }
        Ok(())
    }

    fn load_chosen(&mut self, paxos_id: u64) -> Result<Option<Vec<u8>>, Error> {
        match std::fs::read(self.chosen_path(paxos_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format_err!("unable to read chosen value - {}", err)),
        }
    }
}

/// In-memory store for simulated quorums in tests.
#[derive(Default)]
pub struct MemoryReplicationStore {
    restart_counter: u64,
    acceptor: Option<AcceptorState>,
    chosen: BTreeMap<u64, Vec<u8>>,
    /// Counts saves, so tests can assert the persist-before-reply contract.
    pub num_acceptor_saves: usize,
}

impl MemoryReplicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicationStore for MemoryReplicationStore {
    fn bump_restart_counter(&mut self) -> Result<u64, Error> {
        self.restart_counter += 1;
        Ok(self.restart_counter)
    }

    fn save_acceptor_state(&mut self, state: &AcceptorState) -> Result<(), Error> {
        self.num_acceptor_saves += 1;
        self.acceptor = Some(state.clone());
        Ok(())
    }

    fn load_acceptor_state(&mut self) -> Result<Option<AcceptorState>, Error> {
        Ok(self.acceptor.clone())
    }

    fn save_chosen(&mut self, paxos_id: u64, value: &[u8]) -> Result<(), Error> {
        self.chosen.insert(paxos_id, value.to_vec());
        Ok(())
    }

    fn load_chosen(&mut self, paxos_id: u64) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.chosen.get(&paxos_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(".silo-test-replication-store");
        let _ = std::fs::remove_dir_all(&dir);

        let mut store = FileReplicationStore::open(&dir).unwrap();
        assert_eq!(store.bump_restart_counter().unwrap(), 1);
        assert_eq!(store.bump_restart_counter().unwrap(), 2);

        assert_eq!(store.load_acceptor_state().unwrap(), None);
        let state = AcceptorState {
            paxos_id: 7,
            promised_proposal_id: 65539,
            accepted_proposal_id: Some(65539),
            accepted_value: Some(b"value".to_vec()),
        };
        store.save_acceptor_state(&state).unwrap();
        assert_eq!(store.load_acceptor_state().unwrap(), Some(state));

        store.save_chosen(7, b"chosen").unwrap();
        assert_eq!(store.load_chosen(7).unwrap(), Some(b"chosen".to_vec()));
        assert_eq!(store.load_chosen(8).unwrap(), None);

        // restart counter survives reopen
        let mut store = FileReplicationStore::open(&dir).unwrap();
        assert_eq!(store.bump_restart_counter().unwrap(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
