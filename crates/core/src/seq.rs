//! The monotonic sequencer.
//!
//! Persists `(commit, tx_seq)` -- plus which log file is active -- as a
//! small JSON document under `meta/seq`, rewritten atomically
//! (write-temp + rename) and fsynced before any allocation returns.
//! Restart resumes exactly where the file says: no gaps, no duplicates.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use logd_dlog::FileId;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqState {
    pub commit: u64,
    pub tx_seq: u64,
    pub active: FileId,
}

impl Default for SeqState {
    fn default() -> Self {
        SeqState {
            commit: 0,
            tx_seq: 0,
            active: FileId::A,
        }
    }
}

#[derive(Debug)]
pub struct Sequencer {
    path: PathBuf,
    state: Mutex<SeqState>,
}

impl Sequencer {
    /// Load the persisted state, or initialise a fresh one.
    pub fn open(meta_dir: impl Into<PathBuf>) -> Result<Self> {
        let meta_dir = meta_dir.into();
        fs::create_dir_all(&meta_dir).map_err(|e| Error::io("create-dir", &meta_dir, e))?;
        let path = meta_dir.join("seq");

        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::corruption(format!("bad sequencer state: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SeqState::default(),
            Err(e) => return Err(Error::io("read", &path, e)),
        };
        debug!("sequencer state: {state:?}");

        let seq = Sequencer {
            path,
            state: Mutex::new(state),
        };
        seq.persist(&state)?;
        Ok(seq)
    }

    pub fn current(&self) -> SeqState {
        *self.state.lock()
    }

    /// Allocate the next commit number. Durable before it returns.
    pub fn next_commit(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.commit += 1;
        self.persist(&state)?;
        Ok(state.commit)
    }

    /// Allocate the next transaction sequence number. Durable before it
    /// returns.
    pub fn next_tx_seq(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.tx_seq += 1;
        self.persist(&state)?;
        Ok(state.tx_seq)
    }

    /// Return an unused commit number. Only the commit pipeline may call
    /// this (under its serialisation lock), when an append failed after
    /// allocation -- keeping the sequence gap-free.
    pub fn rollback_commit(&self, to: u64) -> Result<()> {
        let mut state = self.state.lock();
        debug_assert_eq!(state.commit, to + 1);
        state.commit = to;
        self.persist(&state)
    }

    /// Raise the floors after log replay found higher numbers than the
    /// state file (possible only if the state file was tampered with; the
    /// sequencer itself syncs before the log does).
    pub fn ensure_floor(&self, commit: u64, tx_seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.commit >= commit && state.tx_seq >= tx_seq {
            return Ok(());
        }
        state.commit = state.commit.max(commit);
        state.tx_seq = state.tx_seq.max(tx_seq);
        self.persist(&state)
    }

    pub fn set_active(&self, active: FileId) -> Result<()> {
        let mut state = self.state.lock();
        state.active = active;
        self.persist(&state)
    }

    fn persist(&self, state: &SeqState) -> Result<()> {
        let dir = self.path.parent().expect("seq file has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io("create-temp", dir, e))?;
        serde_json::to_writer(&mut tmp, state)
            .map_err(|e| Error::io("write", self.path.clone(), e.into()))?;
        tmp.write_all(b"\n")
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io("sync", self.path.clone(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io("rename", self.path.clone(), e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocations_are_monotonic_and_durable() {
        let dir = tempdir().unwrap();

        let seq = Sequencer::open(dir.path()).unwrap();
        assert_eq!(seq.next_commit().unwrap(), 1);
        assert_eq!(seq.next_commit().unwrap(), 2);
        assert_eq!(seq.next_tx_seq().unwrap(), 1);
        seq.set_active(FileId::B).unwrap();
        drop(seq);

        let seq = Sequencer::open(dir.path()).unwrap();
        let state = seq.current();
        assert_eq!(state.commit, 2);
        assert_eq!(state.tx_seq, 1);
        assert_eq!(state.active, FileId::B);
        assert_eq!(seq.next_commit().unwrap(), 3);
    }

    #[test]
    fn rollback_returns_the_number() {
        let dir = tempdir().unwrap();
        let seq = Sequencer::open(dir.path()).unwrap();
        let c = seq.next_commit().unwrap();
        seq.rollback_commit(c - 1).unwrap();
        assert_eq!(seq.next_commit().unwrap(), c);
    }
}
