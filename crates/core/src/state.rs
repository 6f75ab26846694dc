//! State reconstruction and snapshot production.
//!
//! Reads start from the nearest snapshot at or below the requested commit
//! and replay the patch segments after it, in commit order. Snapshot
//! production runs the same plan at the root and streams the result into
//! a snapshot writer on the inactive log file, building the path-offset
//! table as it goes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use logd_dlog::error::DlogError;
use logd_dlog::{Dlog, EntryBody, LogEntry, ScopeId, SchemaMarker, SnapshotPayload};
use logd_value::event::{Event, EventReader, EventWriter};
use logd_value::patch::{self, Projection};
use logd_value::{KindedPath, Node, PathSeg};

use crate::cache::StateCache;
use crate::error::{Error, Result};
use crate::index::PathIndex;
use crate::segment::SegmentRef;

/// Object-field paths are offset-indexed in snapshots up to this depth;
/// deeper reads seek from the nearest indexed ancestor.
const SNAPSHOT_INDEX_DEPTH: usize = 3;

/// Borrowed view of the engine parts the read/snapshot paths need.
pub(crate) struct StateCtx<'e> {
    pub index: &'e PathIndex,
    pub dlog: &'e Dlog,
    pub cache: &'e StateCache,
}

impl StateCtx<'_> {
    /// Read the state at `(path, commit, scope)`.
    pub fn read_state_at(
        &self,
        path: &KindedPath,
        commit: u64,
        scope: Option<&ScopeId>,
    ) -> Result<Option<Node>> {
        let current = commit;
        if let Some(hit) = self.cache.get_computed(path, commit, scope, current) {
            return Ok(hit.map(|node| (*node).clone()));
        }

        let value = self.reconstruct(path, commit, scope, true)?;

        self.cache.put_computed(
            path.clone(),
            commit,
            scope.cloned(),
            value.clone().map(Arc::new),
            current,
        );
        Ok(value)
    }

    fn reconstruct(
        &self,
        path: &KindedPath,
        commit: u64,
        scope: Option<&ScopeId>,
        allow_fallback: bool,
    ) -> Result<Option<Node>> {
        let (base_entry, mut start_commit) = self.snapshot_base(commit, scope)?;

        let mut state = match &base_entry {
            Some(entry) => match &entry.body {
                EntryBody::Snapshot(payload) => read_sub_node(payload, path)?,
                EntryBody::Patch(_) => {
                    return Err(Error::corruption(
                        "snapshot segment points at a patch entry",
                    ))
                }
            },
            None => {
                // No usable snapshot; the compacted baseline cache can
                // still anchor baseline reads. Replay resumes right after
                // its end commit.
                match scope {
                    None => match self.cache.get_compacted(path, commit, commit) {
                        Some((end, value)) => {
                            start_commit = end + 1;
                            value.map(|node| (*node).clone())
                        }
                        None => None,
                    },
                    Some(_) => None,
                }
            }
        };

        let segments =
            self.index
                .lookup_range(path, Some(start_commit), Some(commit), scope);

        let mut last_record = None;
        for seg in segments {
            if seg.snapshot {
                continue;
            }
            // One multi-participant entry shows up once per touched path;
            // apply the record only once.
            if last_record == Some(seg.record_id()) {
                continue;
            }
            last_record = Some(seg.record_id());

            let entry = self.read_record(&seg)?;
            let EntryBody::Patch(merged) = &entry.body else {
                return Err(Error::corruption("patch segment points at a snapshot entry"));
            };
            match patch::project(merged, path) {
                Projection::Unchanged => {}
                Projection::Removed => state = None,
                Projection::Apply(diff) => state = patch::apply(state, &diff),
                Projection::NeedsRoot => {
                    if !allow_fallback {
                        return Err(Error::corruption(
                            "unprojectable patch during root reconstruction",
                        ));
                    }
                    debug!("read at {path} falls back to root reconstruction");
                    let root = self.reconstruct(&KindedPath::root(), commit, scope, false)?;
                    return Ok(root.and_then(|node| node.at_path(path).cloned()));
                }
            }
        }

        // Nothing at or below the requested commit, but the store is not
        // empty: the history up to `commit` was compacted away. Reads
        // degrade to the nearest surviving snapshot above it.
        if state.is_none() && base_entry.is_none() && last_record.is_none() && commit > 0 {
            if let Some(entry) = self.degraded_snapshot(commit, scope)? {
                let EntryBody::Snapshot(payload) = &entry.body else {
                    return Err(Error::corruption(
                        "snapshot segment points at a patch entry",
                    ));
                };
                debug!(
                    "read at commit {commit} degrades to snapshot at {}",
                    entry.commit
                );
                state = read_sub_node(payload, path)?;
            }
        }

        Ok(state.map(|mut node| {
            patch::strip_patch_root_tags(&mut node);
            node
        }))
    }

    /// The oldest snapshot above `commit` visible to `scope`, for reads
    /// whose history fell past the retention cutoff. Scope snapshots win
    /// over the baseline at the same commit.
    fn degraded_snapshot(
        &self,
        commit: u64,
        scope: Option<&ScopeId>,
    ) -> Result<Option<LogEntry>> {
        let candidate = self
            .index
            .commits_at_desc(&KindedPath::root(), u64::MAX)
            .into_iter()
            .filter(|seg| seg.snapshot && seg.start_commit > commit && seg.visible_to(scope))
            .min_by_key(|seg| (seg.start_commit, seg.scope.is_none()));
        match candidate {
            Some(seg) => self.read_record(&seg).map(Some),
            None => Ok(None),
        }
    }

    /// The nearest snapshot at or below `commit` usable for `scope`, and
    /// the first commit to replay after it.
    ///
    /// Scoped reads prefer a scope snapshot; the baseline snapshot is a
    /// safe fallback only if the scope has no patches at or below it
    /// (scope snapshots are taken before baseline ones at every switch,
    /// so that only happens for scopes written after the last switch).
    fn snapshot_base(
        &self,
        commit: u64,
        scope: Option<&ScopeId>,
    ) -> Result<(Option<LogEntry>, u64)> {
        let candidates = self.index.commits_at_desc(&KindedPath::root(), commit);
        let mut baseline: Option<Arc<SegmentRef>> = None;
        let mut chosen: Option<Arc<SegmentRef>> = None;
        for seg in candidates {
            if !seg.snapshot {
                continue;
            }
            match (&seg.scope, scope) {
                (Some(own), Some(want)) if own == want => {
                    chosen = Some(seg);
                    break;
                }
                (None, _) => {
                    if scope.is_none() {
                        chosen = Some(seg);
                        break;
                    }
                    if baseline.is_none() {
                        baseline = Some(seg);
                    }
                }
                _ => {}
            }
        }

        if chosen.is_none() {
            if let (Some(base), Some(scope)) = (&baseline, scope) {
                let scoped_before = self
                    .index
                    .lookup_range(&KindedPath::root(), None, Some(base.start_commit), Some(scope))
                    .into_iter()
                    .any(|seg| seg.scope.is_some() && !seg.snapshot);
                if scoped_before {
                    debug!(
                        "scope {scope} has writes below baseline snapshot {}, replaying from empty",
                        base.start_commit
                    );
                } else {
                    chosen = baseline;
                }
            }
        }

        match chosen {
            Some(seg) => {
                let entry = self.read_record(&seg)?;
                let start = entry.commit + 1;
                Ok((Some(entry), start))
            }
            None => Ok((None, 0)),
        }
    }

    /// Positional read with one stale-generation retry through a fresh
    /// index lookup.
    fn read_record(&self, seg: &SegmentRef) -> Result<LogEntry> {
        match self.dlog.read_entry_at(seg.file, seg.pos, seg.generation) {
            Ok(entry) => Ok(entry),
            Err(DlogError::Stale(stale)) => {
                debug!("stale read of {seg}: {stale}; re-resolving through the index");
                let fresh = self
                    .index
                    .commits_at_desc(&seg.path, seg.start_commit)
                    .into_iter()
                    .find(|s| {
                        s.start_commit == seg.start_commit
                            && s.start_tx == seg.start_tx
                            && s.scope == seg.scope
                            && s.snapshot == seg.snapshot
                    })
                    .ok_or_else(|| {
                        Error::NotFound(format!("segment {seg} vanished during compaction"))
                    })?;
                self.dlog
                    .read_entry_at(fresh.file, fresh.pos, fresh.generation)
                    .map_err(Error::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Materialise full state at `commit` for `scope` into a new snapshot
    /// entry on the inactive file, and publish its segment.
    pub fn create_snapshot(
        &self,
        commit: u64,
        scope: Option<&ScopeId>,
        schema: Option<SchemaMarker>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let (base_entry, start_commit) = self.snapshot_base(commit, scope)?;
        let base_events: &[u8] = match &base_entry {
            Some(entry) => match &entry.body {
                EntryBody::Snapshot(payload) => &payload.events,
                EntryBody::Patch(_) => {
                    return Err(Error::corruption(
                        "snapshot segment points at a patch entry",
                    ))
                }
            },
            None => &[],
        };

        // Patches to fold over the base, oldest first, one per record.
        let segments =
            self.index
                .lookup_range(&KindedPath::root(), Some(start_commit), Some(commit), scope);
        let mut patches: Vec<Node> = Vec::new();
        let mut last_record = None;
        for seg in segments {
            if seg.snapshot || last_record == Some(seg.record_id()) {
                continue;
            }
            last_record = Some(seg.record_id());
            let entry = self.read_record(&seg)?;
            let EntryBody::Patch(merged) = entry.body else {
                return Err(Error::corruption("patch segment points at a snapshot entry"));
            };
            patches.push(merged);
        }

        let writer = self
            .dlog
            .new_snapshot_writer(commit, timestamp, scope.cloned(), schema);

        // Stream base -> applier -> writer. Each patch is one streaming
        // pass; intermediate passes land in plain event buffers.
        let final_events = match patches.split_first() {
            None => base_events.to_vec(),
            Some((first, rest)) => {
                let mut current = {
                    let mut reader = EventReader::new(base_events);
                    let mut out = EventWriter::new();
                    patch::apply_events(&mut reader, first, &mut out)
                        .map_err(Error::from)?;
                    out.into_bytes()
                };
                for diff in rest {
                    let mut reader = EventReader::new(&current);
                    let mut out = EventWriter::new();
                    patch::apply_events(&mut reader, diff, &mut out).map_err(Error::from)?;
                    current = out.into_bytes();
                }
                current
            }
        };

        let published = write_indexed_payload(writer, &final_events).map_err(|e| {
            warn!("snapshot build at commit {commit} abandoned: {e}");
            e
        })?;
        let (file, pos, generation) = published;

        self.index.add(SegmentRef {
            start_commit: commit,
            end_commit: commit,
            start_tx: 0,
            end_tx: 0,
            path: KindedPath::root(),
            file,
            pos,
            generation,
            scope: scope.cloned(),
            snapshot: true,
        });
        debug!(
            "snapshot at commit {commit} for {} published at {file}@{pos}",
            scope.map(ScopeId::as_str).unwrap_or("baseline")
        );
        Ok(())
    }
}

/// Re-emit `events` into the snapshot writer, indexing object-field paths
/// up to [`SNAPSHOT_INDEX_DEPTH`]. Tag strings are preserved verbatim.
fn write_indexed_payload(
    mut writer: logd_dlog::SnapshotWriter<'_>,
    events: &[u8],
) -> Result<(logd_dlog::FileId, u64, u64)> {
    let mut reader = EventReader::new(events);
    let mut path = KindedPath::root();
    copy_indexed(&mut reader, &mut writer, &mut path)?;
    writer.close().map_err(Error::from)
}

fn copy_indexed(
    reader: &mut EventReader<'_>,
    writer: &mut logd_dlog::SnapshotWriter<'_>,
    path: &mut KindedPath,
) -> Result<()> {
    let mut probe = reader.clone();
    match probe.next_event()? {
        Some(Event::BeginObject { tag }) => {
            *reader = probe;
            writer.events().write_event(&Event::BeginObject { tag });
            loop {
                match reader.next_event()? {
                    Some(Event::Field(name)) => {
                        writer.events().write_event(&Event::Field(name.clone()));
                        if path.len() < SNAPSHOT_INDEX_DEPTH {
                            let mut indexed = path.clone();
                            indexed.push(PathSeg::Key(name.clone()));
                            writer.index_path(indexed);
                        }
                        path.push(PathSeg::Key(name));
                        copy_indexed(reader, writer, path)?;
                        *path = path.parent().expect("pushed above");
                    }
                    Some(Event::End) | None => {
                        writer.events().write_event(&Event::End);
                        return Ok(());
                    }
                    _ => return Err(Error::corruption("malformed snapshot event stream")),
                }
            }
        }
        // Arrays and scalars are copied through in one piece; only object
        // fields are offset-indexed.
        Some(_) => {
            reader.copy_value(writer.events())?;
            Ok(())
        }
        None => Ok(()),
    }
}

/// Materialise the subtree of `path` from a snapshot payload.
pub(crate) fn read_sub_node(payload: &SnapshotPayload, path: &KindedPath) -> Result<Option<Node>> {
    let (offset, rest) = payload.locate(path);
    let mut reader = EventReader::at_offset(&payload.events, offset);
    if rest.is_root() {
        return Ok(reader.read_node()?);
    }
    let seekable = !rest
        .segs()
        .iter()
        .any(|seg| matches!(seg, PathSeg::Keyed(_)));
    if seekable {
        if !reader.seek_path(&rest)? {
            return Ok(None);
        }
        return Ok(reader.read_node()?);
    }
    // Keyed lookups inspect element contents: materialise the indexed
    // ancestor and navigate.
    Ok(reader
        .read_node()?
        .and_then(|node| node.at_path(&rest).cloned()))
}
