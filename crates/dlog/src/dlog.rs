//! The double-buffered pair.
//!
//! Physical files are named `log.<a|b>.<generation>` under the log root;
//! compaction writes the next generation beside the old file, swaps it in,
//! and unlinks the predecessor after a grace period. The pair never blocks
//! the append path on maintenance: snapshot builds and compaction
//! serialise on a per-file maintenance lock which `switch_active` also
//! takes before making a file the append target.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::entry::{LogEntry, ScopeId, SchemaMarker};
use crate::error::{DlogError, StaleGeneration};
use crate::file::LogFile;
use crate::snapshot::SnapshotWriter;

/// Which of the two files a position refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileId {
    A,
    B,
}

impl FileId {
    pub fn other(self) -> FileId {
        match self {
            FileId::A => FileId::B,
            FileId::B => FileId::A,
        }
    }

    fn idx(self) -> usize {
        match self {
            FileId::A => 0,
            FileId::B => 1,
        }
    }

    fn letter(self) -> char {
        match self {
            FileId::A => 'a',
            FileId::B => 'b',
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    file: LogFile,
}

pub struct Dlog {
    root: PathBuf,
    slots: [RwLock<Slot>; 2],
    /// Serialises snapshot builds and compaction per file; `switch_active`
    /// blocks on the target's lock so maintenance never runs on the
    /// append target.
    maintenance: [Mutex<()>; 2],
    active: RwLock<FileId>,
    /// Pre-compaction files awaiting their grace deadline.
    doomed: Mutex<Vec<(PathBuf, Instant)>>,
}

impl fmt::Debug for Dlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dlog")
            .field("root", &self.root)
            .field("active", &*self.active.read())
            .finish()
    }
}

fn file_name(id: FileId, generation: u64) -> String {
    format!("log.{id}.{generation:020}")
}

impl Dlog {
    /// Open (or initialise) the pair under `root`. `active` tells which
    /// file accepts appends; the caller persists it across restarts.
    ///
    /// Leftover lower-generation files from an interrupted compaction are
    /// removed here -- their grace period has long expired.
    pub fn open(root: impl Into<PathBuf>, active: FileId) -> Result<Self, DlogError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| DlogError::io("create-dir", &root, e))?;

        let mut open_slot = |id: FileId| -> Result<Slot, DlogError> {
            let generation = latest_generation(&root, id)?;
            let path = root.join(file_name(id, generation));
            let file =
                LogFile::open_or_create(&path).map_err(|e| DlogError::io("open-log", &path, e))?;
            Ok(Slot { generation, file })
        };

        let slot_a = open_slot(FileId::A)?;
        let slot_b = open_slot(FileId::B)?;
        debug!(
            "dlog open: a(gen={}, {}B) b(gen={}, {}B) active={active}",
            slot_a.generation,
            slot_a.file.size(),
            slot_b.generation,
            slot_b.file.size()
        );

        Ok(Dlog {
            root,
            slots: [RwLock::new(slot_a), RwLock::new(slot_b)],
            maintenance: [Mutex::new(()), Mutex::new(())],
            active: RwLock::new(active),
            doomed: Mutex::new(Vec::new()),
        })
    }

    pub fn active(&self) -> FileId {
        *self.active.read()
    }

    /// Byte size of the active file; policy layers use this to decide
    /// when to switch.
    pub fn active_log_size(&self) -> u64 {
        let id = self.active();
        self.slots[id.idx()].read().file.size()
    }

    pub fn generation(&self, id: FileId) -> u64 {
        self.slots[id.idx()].read().generation
    }

    /// Append `entry` to the active file, durably. Returns its location.
    pub fn append(&self, entry: &LogEntry) -> Result<(FileId, u64), DlogError> {
        loop {
            let id = self.active();
            let mut slot = self.slots[id.idx()].write();
            // The active file can have flipped while we waited for the
            // write lock; appends must only ever land on the active file.
            if self.active() != id {
                continue;
            }
            let pos = slot
                .file
                .append(entry)
                .map_err(|e| DlogError::io("append", slot.file.path(), e))?;
            return Ok((id, pos));
        }
    }

    /// Read the entry at `(id, pos)`, refusing if the file's current
    /// generation differs from `generation`.
    pub fn read_entry_at(
        &self,
        id: FileId,
        pos: u64,
        generation: u64,
    ) -> Result<LogEntry, DlogError> {
        let slot = self.slots[id.idx()].read();
        if slot.generation != generation {
            return Err(StaleGeneration {
                file: id,
                requested: generation,
                current: slot.generation,
            }
            .into());
        }
        match slot.file.read_entry_at(pos) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Err(DlogError::NoEntry { file: id, pos }),
            Err(e) => Err(DlogError::io("read-entry", slot.file.path(), e)),
        }
    }

    /// Flip the active file. Blocks until maintenance on the file about
    /// to become active has finished. Returns the new active id.
    pub fn switch_active(&self) -> FileId {
        let target = self.active().other();
        let _maintenance = self.maintenance[target.idx()].lock();
        *self.active.write() = target;
        info!("dlog switched active file to {target}");
        self.purge_doomed();
        target
    }

    /// A sequential iterator over the entries of `id`, decoupled from the
    /// pair's locks (it reads through its own handle).
    pub fn entries(&self, id: FileId) -> Result<crate::file::Entries, DlogError> {
        let slot = self.slots[id.idx()].read();
        slot.file
            .entries()
            .map_err(|e| DlogError::io("scan", slot.file.path(), e))
    }

    /// Visit every entry of `id` in file order.
    pub fn for_each_entry(
        &self,
        id: FileId,
        visit: impl FnMut(u64, LogEntry) -> io::Result<()>,
    ) -> Result<(), DlogError> {
        let slot = self.slots[id.idx()].read();
        slot.file
            .for_each_entry(visit)
            .map_err(|e| DlogError::io("scan", slot.file.path(), e))
    }

    /// Rewrite the inactive file in place, keeping only the entries at
    /// `keep` (byte offsets into the current generation), in offset
    /// order. Returns the `(old, new)` offset pairs and bumps the file's
    /// generation. The prior physical file is unlinked after `grace`.
    pub fn compact_inactive(
        &self,
        keep: &[u64],
        grace: Duration,
    ) -> Result<Vec<(u64, u64)>, DlogError> {
        let (id, _maintenance) = self.lock_inactive();

        let mut positions: Vec<u64> = keep.to_vec();
        positions.sort_unstable();
        positions.dedup();

        // Collect survivors from the current generation.
        let mut survivors = Vec::with_capacity(positions.len());
        {
            let slot = self.slots[id.idx()].read();
            for &pos in &positions {
                match slot.file.read_entry_at(pos) {
                    Ok(Some(entry)) => survivors.push((pos, entry)),
                    Ok(None) => return Err(DlogError::NoEntry { file: id, pos }),
                    Err(e) => return Err(DlogError::io("read-entry", slot.file.path(), e)),
                }
            }
        }

        // Write the next generation beside the old file.
        let next_generation = self.generation(id) + 1;
        let next_path = self.root.join(file_name(id, next_generation));
        let mut next = LogFile::create(&next_path).map_err(|e| DlogError::io("create-log", &next_path, e))?;
        let mut mapping = Vec::with_capacity(survivors.len());
        for (old_pos, entry) in &survivors {
            let new_pos = next
                .append(entry)
                .map_err(|e| DlogError::io("append", &next_path, e))?;
            mapping.push((*old_pos, new_pos));
        }
        next.sync().map_err(|e| DlogError::io("sync", &next_path, e))?;

        // Swap the new generation in and doom the old file.
        {
            let mut slot = self.slots[id.idx()].write();
            let old = std::mem::replace(
                &mut *slot,
                Slot {
                    generation: next_generation,
                    file: next,
                },
            );
            self.doomed
                .lock()
                .push((old.file.path().to_path_buf(), Instant::now() + grace));
        }
        info!(
            "compacted log file {id}: {} entries kept, generation {} -> {}",
            mapping.len(),
            next_generation - 1,
            next_generation
        );

        self.purge_doomed();
        Ok(mapping)
    }

    /// Reserve the inactive file for snapshot authoring. The returned
    /// writer holds the maintenance lock until closed or abandoned.
    pub fn new_snapshot_writer(
        &self,
        commit: u64,
        timestamp: DateTime<Utc>,
        scope: Option<ScopeId>,
        schema: Option<SchemaMarker>,
    ) -> SnapshotWriter<'_> {
        let (_, guard) = self.lock_inactive();
        SnapshotWriter::new(self, guard, commit, timestamp, scope, schema)
    }

    /// Acquire the maintenance lock of the inactive file. The flip can
    /// race the lock acquisition, so re-check after locking.
    fn lock_inactive(&self) -> (FileId, MutexGuard<'_, ()>) {
        loop {
            let id = self.active().other();
            let guard = self.maintenance[id.idx()].lock();
            if self.active().other() == id {
                return (id, guard);
            }
        }
    }

    /// Append a finished snapshot entry to the inactive file. Called by
    /// [`SnapshotWriter::close`] while it still holds the maintenance
    /// lock.
    pub(crate) fn append_snapshot_entry(
        &self,
        _maintenance: &MutexGuard<'_, ()>,
        entry: &LogEntry,
    ) -> Result<(FileId, u64, u64), DlogError> {
        let id = self.active().other();
        let mut slot = self.slots[id.idx()].write();
        let pos = slot
            .file
            .append(entry)
            .map_err(|e| DlogError::io("append", slot.file.path(), e))?;
        Ok((id, pos, slot.generation))
    }

    /// Unlink doomed pre-compaction files whose grace period has passed.
    pub fn purge_doomed(&self) {
        let now = Instant::now();
        let mut doomed = self.doomed.lock();
        doomed.retain(|(path, deadline)| {
            if *deadline > now {
                return true;
            }
            match fs::remove_file(path) {
                Ok(()) => debug!("unlinked compacted log file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not unlink {}: {e}", path.display()),
            }
            false
        });
    }
}

/// Highest generation present for `id`, removing stale lower generations
/// left behind by a crash.
fn latest_generation(root: &Path, id: FileId) -> Result<u64, DlogError> {
    let prefix = format!("log.{id}.");
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    let dir = fs::read_dir(root).map_err(|e| DlogError::io("read-dir", root, e))?;
    for dent in dir {
        let dent = dent.map_err(|e| DlogError::io("read-dir", root, e))?;
        let name = dent.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(generation) = name.strip_prefix(&prefix) else { continue };
        let Ok(generation) = generation.parse::<u64>() else { continue };
        found.push((generation, dent.path()));
    }
    found.sort_unstable();
    let latest = found.last().map(|(generation, _)| *generation).unwrap_or(0);
    for (generation, path) in &found {
        if *generation < latest {
            warn!("removing stale log generation {}", path.display());
            let _ = fs::remove_file(path);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBody;
    use crate::error::DlogError;
    use chrono::TimeZone;
    use logd_value::Node;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(commit: u64) -> LogEntry {
        LogEntry {
            commit,
            tx_seq: commit,
            last_commit: commit.saturating_sub(1),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap(),
            scope: None,
            schema: None,
            body: EntryBody::Patch(Node::object([("n", Node::int(commit as i64))])),
        }
    }

    #[test]
    fn append_targets_active_only() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();

        let (file1, pos1) = dlog.append(&entry(1)).unwrap();
        assert_eq!(file1, FileId::A);

        assert_eq!(dlog.switch_active(), FileId::B);
        let (file2, _) = dlog.append(&entry(2)).unwrap();
        assert_eq!(file2, FileId::B);

        let read = dlog.read_entry_at(FileId::A, pos1, 0).unwrap();
        assert_eq!(read, entry(1));
    }

    #[test]
    fn stale_generation_is_refused() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
        let (_, pos) = dlog.append(&entry(1)).unwrap();

        // Compact the file holding the entry (inactive after a switch).
        dlog.switch_active();
        let mapping = dlog
            .compact_inactive(&[pos], Duration::from_secs(3600))
            .unwrap();
        assert_eq!(mapping.len(), 1);
        let (old_pos, new_pos) = mapping[0];
        assert_eq!(old_pos, pos);

        let err = dlog.read_entry_at(FileId::A, pos, 0).unwrap_err();
        assert!(matches!(err, DlogError::Stale(_)));

        let read = dlog.read_entry_at(FileId::A, new_pos, 1).unwrap();
        assert_eq!(read, entry(1));
    }

    #[test]
    fn compaction_drops_unlisted_entries() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
        let (_, p1) = dlog.append(&entry(1)).unwrap();
        let (_, _p2) = dlog.append(&entry(2)).unwrap();
        let (_, p3) = dlog.append(&entry(3)).unwrap();

        dlog.switch_active();
        let mapping = dlog
            .compact_inactive(&[p3, p1, p1], Duration::from_secs(0))
            .unwrap();
        // Sorted, deduplicated, remapped.
        assert_eq!(mapping.len(), 2);
        assert!(mapping[0].1 < mapping[1].1);

        let mut commits = Vec::new();
        dlog.for_each_entry(FileId::A, |_, entry| {
            commits.push(entry.commit);
            Ok(())
        })
        .unwrap();
        assert_eq!(commits, vec![1, 3]);
    }

    #[test]
    fn grace_period_defers_unlink() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
        let (_, pos) = dlog.append(&entry(1)).unwrap();
        dlog.switch_active();

        let count_files = || {
            fs::read_dir(dir.path())
                .unwrap()
                .filter(|dent| {
                    dent.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with("log.a.")
                })
                .count()
        };

        dlog.compact_inactive(&[pos], Duration::from_secs(3600)).unwrap();
        assert_eq!(count_files(), 2, "old generation lingers during grace");

        // With a zero grace the next compaction purges both predecessors.
        let pos = {
            let mut found = 0;
            dlog.for_each_entry(FileId::A, |entry_pos, _| {
                found = entry_pos;
                Ok(())
            })
            .unwrap();
            found
        };
        dlog.compact_inactive(&[pos], Duration::from_secs(0)).unwrap();
        // The 3600s-doomed file is still within grace; generation 1 is not.
        assert_eq!(count_files(), 2);
    }

    #[test]
    fn reopen_picks_latest_generation() {
        let dir = tempdir().unwrap();
        let (pos, generation) = {
            let dlog = Dlog::open(dir.path(), FileId::A).unwrap();
            let (_, pos) = dlog.append(&entry(1)).unwrap();
            dlog.switch_active();
            let mapping = dlog.compact_inactive(&[pos], Duration::from_secs(3600)).unwrap();
            (mapping[0].1, dlog.generation(FileId::A))
        };
        assert_eq!(generation, 1);

        let dlog = Dlog::open(dir.path(), FileId::B).unwrap();
        assert_eq!(dlog.generation(FileId::A), 1);
        assert_eq!(dlog.read_entry_at(FileId::A, pos, 1).unwrap(), entry(1));
        // The stale generation-0 file was removed during open.
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|dent| {
                dent.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("log.a.")
            })
            .count();
        assert_eq!(leftovers, 1);
    }
}
