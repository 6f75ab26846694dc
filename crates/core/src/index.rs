//! The hierarchical path index.
//!
//! A tree of nodes keyed by path segment. Each node owns an ordered set
//! of segments plus a map of children, each behind its own lock:
//! child-map operations are idempotent creation of empty nodes, so a
//! traversal takes the children lock briefly, clones the `Arc`, and
//! releases before recursing -- parent locks are never held across child
//! work. Segments are immutable after publish, which lets lookups snapshot
//! a node's segment list under the lock and keep using it after release.
//!
//! The index persists alongside a high-water commit so that restarts only
//! rescan log records past it.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use logd_dlog::{FileId, ScopeId};
use logd_value::{BufReader, BufWriter, KindedPath, PathSeg};

use crate::error::{Error, Result};
use crate::segment::SegmentRef;

const SNAPSHOT_MAGIC: [u8; 8] = *b"logdidx1";

#[derive(Default)]
struct IndexNode {
    segments: RwLock<Vec<Arc<SegmentRef>>>,
    children: RwLock<HashMap<PathSeg, Arc<IndexNode>>>,
}

pub struct PathIndex {
    root: Arc<IndexNode>,
}

impl Default for PathIndex {
    fn default() -> Self {
        PathIndex {
            root: Arc::new(IndexNode::default()),
        }
    }
}

impl PathIndex {
    pub fn new() -> Self {
        PathIndex::default()
    }

    fn node_at(&self, path: &KindedPath) -> Option<Arc<IndexNode>> {
        let mut node = self.root.clone();
        for seg in path.segs() {
            let next = node.children.read().get(seg).cloned()?;
            node = next;
        }
        Some(node)
    }

    fn node_at_or_create(&self, path: &KindedPath) -> Arc<IndexNode> {
        let mut node = self.root.clone();
        for seg in path.segs() {
            let existing = node.children.read().get(seg).cloned();
            let next = match existing {
                Some(next) => next,
                None => node
                    .children
                    .write()
                    .entry(seg.clone())
                    .or_insert_with(|| Arc::new(IndexNode::default()))
                    .clone(),
            };
            node = next;
        }
        node
    }

    /// Publish a segment at its kinded path.
    pub fn add(&self, seg: SegmentRef) {
        self.add_ref(Arc::new(seg))
    }

    pub fn add_ref(&self, seg: Arc<SegmentRef>) {
        let node = self.node_at_or_create(&seg.path);
        let mut segments = node.segments.write();
        let at = segments
            .binary_search_by_key(&seg.sort_key(), |s| s.sort_key())
            .unwrap_or_else(|at| at);
        segments.insert(at, seg);
    }

    /// Retract a published segment. Returns `false` if it was not found.
    pub fn remove(&self, seg: &SegmentRef) -> bool {
        let Some(node) = self.node_at(&seg.path) else {
            return false;
        };
        let mut segments = node.segments.write();
        match segments.iter().position(|s| **s == *seg) {
            Some(at) => {
                segments.remove(at);
                true
            }
            None => false,
        }
    }

    /// Segments relevant to a read at `(path, commit range, scope)`:
    /// those indexed at `path` itself, at any ancestor, or anywhere in
    /// the subtree below it, with `start_commit` within the (inclusive)
    /// range and visible to `scope`. Sorted by commit, baseline before
    /// scope, then transaction sequence.
    pub fn lookup_range(
        &self,
        path: &KindedPath,
        from: Option<u64>,
        to: Option<u64>,
        scope: Option<&ScopeId>,
    ) -> Vec<Arc<SegmentRef>> {
        self.lookup_with(path, from, to, |seg| seg.visible_to(scope))
    }

    /// Like [`lookup_range`](Self::lookup_range) without the scope filter.
    /// Compaction and scope management use this.
    pub fn lookup_range_all(
        &self,
        path: &KindedPath,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Vec<Arc<SegmentRef>> {
        self.lookup_with(path, from, to, |_| true)
    }

    fn lookup_with(
        &self,
        path: &KindedPath,
        from: Option<u64>,
        to: Option<u64>,
        keep: impl Fn(&SegmentRef) -> bool,
    ) -> Vec<Arc<SegmentRef>> {
        let in_range = |seg: &SegmentRef| {
            from.map_or(true, |from| seg.start_commit >= from)
                && to.map_or(true, |to| seg.start_commit <= to)
        };

        let mut out = Vec::new();
        // Ancestors, the target node excluded: collect exact segments.
        let mut node = self.root.clone();
        let mut resolved = true;
        for seg in path.segs() {
            {
                let segments = node.segments.read();
                out.extend(segments.iter().filter(|s| in_range(s) && keep(s)).cloned());
            }
            let next = node.children.read().get(seg).cloned();
            match next {
                Some(next) => node = next,
                None => {
                    resolved = false;
                    break;
                }
            }
        }
        // Target node and everything below it.
        if resolved {
            collect_subtree(&node, &mut |seg| {
                if in_range(seg) && keep(seg) {
                    out.push(seg.clone());
                }
            });
        }
        out.sort_by_key(|seg| seg.sort_key());
        out
    }

    /// Segments indexed exactly at `path` with `start_commit <= commit`,
    /// in descending commit order. The snapshot engine walks this to find
    /// the nearest snapshot.
    pub fn commits_at_desc(&self, path: &KindedPath, commit: u64) -> Vec<Arc<SegmentRef>> {
        let Some(node) = self.node_at(path) else {
            return Vec::new();
        };
        let segments = node.segments.read();
        let mut out: Vec<_> = segments
            .iter()
            .filter(|seg| seg.start_commit <= commit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Child segments of `parent` that carry at least one segment in the
    /// commit range (anywhere in the child's subtree), visible to `scope`.
    pub fn list_child_paths(
        &self,
        parent: &KindedPath,
        from: Option<u64>,
        to: Option<u64>,
        scope: Option<&ScopeId>,
    ) -> Vec<KindedPath> {
        let Some(node) = self.node_at(parent) else {
            return Vec::new();
        };
        let in_range = |seg: &SegmentRef| {
            from.map_or(true, |from| seg.start_commit >= from)
                && to.map_or(true, |to| seg.start_commit <= to)
                && seg.visible_to(scope)
        };

        // Snapshot the children under the lock, then work without it.
        let children: Vec<(PathSeg, Arc<IndexNode>)> = node
            .children
            .read()
            .iter()
            .map(|(seg, child)| (seg.clone(), child.clone()))
            .collect();

        let mut out = Vec::new();
        for (seg, child) in children {
            let mut any = false;
            collect_subtree(&child, &mut |segment| {
                if !any && in_range(segment) {
                    any = true;
                }
            });
            if any {
                out.push(parent.child(seg));
            }
        }
        out.sort();
        out
    }

    /// Remove every segment belonging to `scope`, index-wide. Returns the
    /// number removed.
    pub fn delete_scope(&self, scope: &ScopeId) -> usize {
        let mut removed = 0;
        visit_nodes(&self.root, &mut |node| {
            let mut segments = node.segments.write();
            let before = segments.len();
            segments.retain(|seg| seg.scope.as_ref() != Some(scope));
            removed += before - segments.len();
        });
        removed
    }

    /// All segments whose record lives in `file`. Compaction input.
    pub fn segments_in_file(&self, file: FileId) -> Vec<Arc<SegmentRef>> {
        let mut out = Vec::new();
        visit_nodes(&self.root, &mut |node| {
            let segments = node.segments.read();
            out.extend(segments.iter().filter(|seg| seg.file == file).cloned());
        });
        out.sort_by_key(|seg| seg.sort_key());
        out
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        visit_nodes(&self.root, &mut |node| count += node.segments.read().len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialise the index with its high-water commit.
    pub fn persist(&self, path: &Path, high_water: u64) -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        buf.put_slice(&SNAPSHOT_MAGIC);
        buf.put_u64(high_water);

        let mut segments = Vec::new();
        visit_nodes(&self.root, &mut |node| {
            segments.extend(node.segments.read().iter().cloned())
        });
        buf.put_u64(segments.len() as u64);
        for seg in &segments {
            put_string(&mut buf, &seg.path.to_string());
            buf.put_u64(seg.start_commit);
            buf.put_u64(seg.end_commit);
            buf.put_u64(seg.start_tx);
            buf.put_u64(seg.end_tx);
            buf.put_u8(match seg.file {
                FileId::A => 0,
                FileId::B => 1,
            });
            buf.put_u64(seg.pos);
            buf.put_u64(seg.generation);
            let mut flags = 0u8;
            if seg.scope.is_some() {
                flags |= 1;
            }
            if seg.snapshot {
                flags |= 2;
            }
            buf.put_u8(flags);
            if let Some(scope) = &seg.scope {
                put_string(&mut buf, scope.as_str());
            }
        }

        let dir = path.parent().expect("index snapshot path has a parent");
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io("create-temp", dir, e))?;
        tmp.write_all(&buf)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io("write", path, e))?;
        tmp.persist(path)
            .map_err(|e| Error::io("rename", path, e.error))?;
        debug!(
            "persisted index snapshot: {} segments, high water {high_water}",
            segments.len()
        );
        Ok(())
    }

    /// Load a persisted index. Returns the high-water commit alongside.
    pub fn load(path: &Path) -> Result<Option<(PathIndex, u64)>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("read", path, e)),
        };
        let mut reader = bytes.as_slice();
        let magic = reader.get_slice(SNAPSHOT_MAGIC.len())?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::corruption("index snapshot has a foreign header"));
        }
        let high_water = reader.get_u64()?;
        let count = reader.get_u64()?;

        let index = PathIndex::new();
        for _ in 0..count {
            let raw_path = get_string(&mut reader)?;
            let path = KindedPath::parse(&raw_path)
                .map_err(|e| Error::corruption(format!("bad path in index snapshot: {e}")))?;
            let start_commit = reader.get_u64()?;
            let end_commit = reader.get_u64()?;
            let start_tx = reader.get_u64()?;
            let end_tx = reader.get_u64()?;
            let file = match reader.get_u8()? {
                0 => FileId::A,
                1 => FileId::B,
                byte => {
                    return Err(Error::corruption(format!(
                        "bad file id {byte} in index snapshot"
                    )))
                }
            };
            let pos = reader.get_u64()?;
            let generation = reader.get_u64()?;
            let flags = reader.get_u8()?;
            let scope = if flags & 1 != 0 {
                Some(ScopeId::new(get_string(&mut reader)?))
            } else {
                None
            };
            index.add(SegmentRef {
                start_commit,
                end_commit,
                start_tx,
                end_tx,
                path,
                file,
                pos,
                generation,
                scope,
                snapshot: flags & 2 != 0,
            });
        }
        Ok(Some((index, high_water)))
    }
}

/// Depth-first visit of every node. Children are snapshotted under the
/// lock per node and the lock released before descending.
fn visit_nodes(node: &Arc<IndexNode>, visit: &mut impl FnMut(&IndexNode)) {
    visit(node);
    let children: Vec<Arc<IndexNode>> = node.children.read().values().cloned().collect();
    for child in children {
        visit_nodes(&child, visit);
    }
}

fn collect_subtree(node: &Arc<IndexNode>, visit: &mut impl FnMut(&Arc<SegmentRef>)) {
    visit_nodes(node, &mut |n| {
        let segments = n.segments.read();
        for seg in segments.iter() {
            visit(seg);
        }
    });
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(reader: &mut &[u8]) -> Result<String> {
    let len = reader.get_u32()? as usize;
    Ok(reader.get_str(len, "index snapshot string")?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn seg(path: &str, commit: u64, scope: Option<&str>) -> SegmentRef {
        SegmentRef {
            start_commit: commit,
            end_commit: commit,
            start_tx: commit,
            end_tx: commit,
            path: KindedPath::parse(path).unwrap(),
            file: FileId::A,
            pos: 10 + commit,
            generation: 0,
            scope: scope.map(ScopeId::new),
            snapshot: false,
        }
    }

    fn commits(segs: &[Arc<SegmentRef>]) -> Vec<u64> {
        segs.iter().map(|s| s.start_commit).collect()
    }

    #[test]
    fn lookup_spans_ancestors_and_subtree() {
        let index = PathIndex::new();
        index.add(seg("/", 1, None));
        index.add(seg("/u/a", 2, None));
        index.add(seg("/u/a/name", 3, None));
        index.add(seg("/u/b", 4, None));

        let path = KindedPath::parse("/u/a").unwrap();
        let found = index.lookup_range(&path, None, None, None);
        assert_eq!(commits(&found), vec![1, 2, 3]);

        let found = index.lookup_range(&path, Some(2), Some(2), None);
        assert_eq!(commits(&found), vec![2]);

        let root = KindedPath::root();
        let found = index.lookup_range(&root, None, None, None);
        assert_eq!(commits(&found), vec![1, 2, 3, 4]);
    }

    #[test]
    fn scope_filtering() {
        let index = PathIndex::new();
        index.add(seg("/x", 1, None));
        index.add(seg("/x", 2, Some("sb")));
        index.add(seg("/x", 3, Some("other")));

        let path = KindedPath::parse("/x").unwrap();
        assert_eq!(commits(&index.lookup_range(&path, None, None, None)), vec![1]);
        let sb = ScopeId::new("sb");
        assert_eq!(
            commits(&index.lookup_range(&path, None, None, Some(&sb))),
            vec![1, 2]
        );
        assert_eq!(commits(&index.lookup_range_all(&path, None, None)), vec![1, 2, 3]);
    }

    #[test]
    fn baseline_sorts_before_scope_at_same_commit() {
        let index = PathIndex::new();
        index.add(seg("/x", 5, Some("sb")));
        index.add(seg("/x", 5, None));
        let path = KindedPath::parse("/x").unwrap();
        let sb = ScopeId::new("sb");
        let found = index.lookup_range(&path, None, None, Some(&sb));
        assert_eq!(found[0].scope, None);
        assert_eq!(found[1].scope, Some(sb));
    }

    #[test]
    fn commits_at_desc_walks_down() {
        let index = PathIndex::new();
        for commit in [1, 3, 5, 7] {
            index.add(seg("/", commit, None));
        }
        let found = index.commits_at_desc(&KindedPath::root(), 5);
        assert_eq!(commits(&found), vec![5, 3, 1]);
    }

    #[test]
    fn child_listing() {
        let index = PathIndex::new();
        index.add(seg("/u/a", 1, None));
        index.add(seg("/u/b/deep", 2, None));
        index.add(seg("/u/c", 3, Some("sb")));

        let parent = KindedPath::parse("/u").unwrap();
        let children = index.list_child_paths(&parent, None, None, None);
        assert_eq!(
            children,
            vec![
                KindedPath::parse("/u/a").unwrap(),
                KindedPath::parse("/u/b").unwrap()
            ]
        );

        let sb = ScopeId::new("sb");
        let children = index.list_child_paths(&parent, None, None, Some(&sb));
        assert_eq!(children.len(), 3);

        let children = index.list_child_paths(&parent, Some(2), None, None);
        assert_eq!(children, vec![KindedPath::parse("/u/b").unwrap()]);
    }

    #[test]
    fn delete_scope_is_index_only_and_counted() {
        let index = PathIndex::new();
        index.add(seg("/x", 1, None));
        index.add(seg("/x", 2, Some("sb")));
        index.add(seg("/y/z", 3, Some("sb")));
        assert_eq!(index.delete_scope(&ScopeId::new("sb")), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.delete_scope(&ScopeId::new("sb")), 0);
    }

    #[test]
    fn remove_and_readd_for_compaction() {
        let index = PathIndex::new();
        let original = seg("/x", 1, None);
        index.add(original.clone());

        assert!(index.remove(&original));
        assert!(!index.remove(&original));
        let moved = SegmentRef {
            pos: 99,
            generation: 1,
            ..original
        };
        index.add(moved.clone());
        let found = index.lookup_range(&moved.path, None, None, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pos, 99);
        assert_eq!(found[0].generation, 1);
    }

    #[test]
    fn persist_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.snapshot");

        let index = PathIndex::new();
        index.add(seg("/u/a", 1, None));
        index.add(seg("/u/b", 2, Some("sb")));
        index.add(SegmentRef {
            snapshot: true,
            ..seg("/", 3, None)
        });
        index.persist(&path, 3).unwrap();

        let (loaded, high_water) = PathIndex::load(&path).unwrap().unwrap();
        assert_eq!(high_water, 3);
        assert_eq!(loaded.len(), 3);
        let root = loaded.commits_at_desc(&KindedPath::root(), 10);
        assert!(root[0].snapshot);

        assert!(PathIndex::load(&dir.path().join("missing")).unwrap().is_none());
    }
}
