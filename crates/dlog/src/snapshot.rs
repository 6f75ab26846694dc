//! Snapshot authoring against the inactive file.
//!
//! A [`SnapshotWriter`] reserves the inactive file (holding its
//! maintenance lock), accumulates a pre-order event stream plus the
//! path-offset table, and publishes exactly one snapshot entry on
//! [`close`](SnapshotWriter::close). Dropping the writer without closing
//! abandons the snapshot: nothing reaches the log.

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::MutexGuard;

use logd_value::event::EventWriter;
use logd_value::KindedPath;

use crate::dlog::{Dlog, FileId};
use crate::entry::{EntryBody, LogEntry, ScopeId, SchemaMarker, SnapshotPayload};
use crate::error::DlogError;

pub struct SnapshotWriter<'d> {
    dlog: &'d Dlog,
    maintenance: MutexGuard<'d, ()>,
    commit: u64,
    timestamp: DateTime<Utc>,
    scope: Option<ScopeId>,
    schema: Option<SchemaMarker>,
    events: EventWriter,
    offsets: Vec<(KindedPath, u32)>,
}

impl<'d> SnapshotWriter<'d> {
    pub(crate) fn new(
        dlog: &'d Dlog,
        maintenance: MutexGuard<'d, ()>,
        commit: u64,
        timestamp: DateTime<Utc>,
        scope: Option<ScopeId>,
        schema: Option<SchemaMarker>,
    ) -> Self {
        let mut writer = SnapshotWriter {
            dlog,
            maintenance,
            commit,
            timestamp,
            scope,
            schema,
            events: EventWriter::new(),
            offsets: Vec::new(),
        };
        writer.offsets.push((KindedPath::root(), 0));
        writer
    }

    pub fn commit(&self) -> u64 {
        self.commit
    }

    /// The event sink for the snapshot payload.
    pub fn events(&mut self) -> &mut EventWriter {
        &mut self.events
    }

    /// Record that the value at `path` starts at the writer's current
    /// offset. Call just before writing that value's events.
    pub fn index_path(&mut self, path: KindedPath) {
        if path.is_root() {
            return;
        }
        let offset = self.events.offset();
        self.offsets.push((path, offset));
    }

    /// Publish the snapshot entry to the inactive file. Consumes the
    /// writer and releases the file.
    pub fn close(self) -> Result<(FileId, u64, u64), DlogError> {
        let entry = LogEntry {
            commit: self.commit,
            tx_seq: 0,
            last_commit: self.commit,
            timestamp: self.timestamp,
            scope: self.scope,
            schema: self.schema,
            body: EntryBody::Snapshot(SnapshotPayload {
                offsets: self.offsets,
                events: self.events.into_bytes(),
            }),
        };
        let published = self.dlog.append_snapshot_entry(&self.maintenance, &entry)?;
        debug!(
            "snapshot at commit {} published to {}@{} (generation {})",
            entry.commit, published.0, published.1, published.2
        );
        Ok(published)
    }

    /// Discard everything written. Equivalent to dropping the writer;
    /// spelled out for call sites that want to be explicit.
    pub fn abandon(self) {
        debug!("snapshot at commit {} abandoned", self.commit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBody;
    use chrono::TimeZone;
    use logd_value::event::EventReader;
    use logd_value::Node;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap()
    }

    #[test]
    fn close_publishes_to_inactive() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();

        let state = Node::object([("users", Node::object([("n", Node::int(1))]))]);
        let mut writer = dlog.new_snapshot_writer(5, ts(), None, None);
        writer.events().write_node(&state);
        let (file, pos, generation) = writer.close().unwrap();
        assert_eq!(file, FileId::B, "snapshots land on the inactive file");

        let entry = dlog.read_entry_at(file, pos, generation).unwrap();
        assert_eq!(entry.commit, 5);
        let EntryBody::Snapshot(payload) = &entry.body else {
            panic!("expected snapshot body")
        };
        let mut reader = EventReader::new(&payload.events);
        assert_eq!(reader.read_node().unwrap().unwrap(), state);
    }

    #[test]
    fn abandon_publishes_nothing() {
        let dir = tempdir().unwrap();
        let dlog = Dlog::open(dir.path(), FileId::A).unwrap();

        let mut writer = dlog.new_snapshot_writer(5, ts(), None, None);
        writer.events().write_node(&Node::int(1));
        writer.abandon();

        let mut count = 0;
        dlog.for_each_entry(FileId::B, |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);

        // The maintenance lock was released: switching works.
        assert_eq!(dlog.switch_active(), FileId::B);
    }
}
