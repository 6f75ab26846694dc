//! Index-level references to log records.

use std::fmt;

use logd_dlog::{FileId, ScopeId};
use logd_value::KindedPath;

/// One log entry's effect at one path, as tracked by the path index.
///
/// Immutable once published; the index shares them behind `Arc` so lock
/// holders can drop node locks before using what they captured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRef {
    /// Commit range covered. Equal bounds for a patch or a point
    /// snapshot; unequal only for compacted multi-commit ranges.
    pub start_commit: u64,
    pub end_commit: u64,
    /// Transaction sequence range, analogous.
    pub start_tx: u64,
    pub end_tx: u64,
    /// Where this entry is indexed.
    pub path: KindedPath,
    /// Physical location of the log record.
    pub file: FileId,
    pub pos: u64,
    /// Generation of the log file the position is valid for.
    pub generation: u64,
    /// `None` for baseline writes.
    pub scope: Option<ScopeId>,
    /// `true` if the referenced record carries a snapshot payload.
    pub snapshot: bool,
}

impl SegmentRef {
    /// Visible to a read with the given scope selection: baseline
    /// segments always, scope segments only when reading that scope.
    pub fn visible_to(&self, scope: Option<&ScopeId>) -> bool {
        match (&self.scope, scope) {
            (None, _) => true,
            (Some(own), Some(want)) => own == want,
            (Some(_), None) => false,
        }
    }

    /// Sort key: commit order, baseline before scope within a commit,
    /// transaction order as the final tie-break.
    pub fn sort_key(&self) -> (u64, bool, u64) {
        (self.start_commit, self.scope.is_some(), self.start_tx)
    }

    /// Identity of the underlying log record; several segments of one
    /// multi-participant transaction share it.
    pub fn record_id(&self) -> (FileId, u64, u64) {
        (self.file, self.pos, self.generation)
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}]{}{} @{}:{}#{}",
            self.start_commit,
            self.end_commit,
            if self.snapshot { "s" } else { "" },
            self.path,
            self.file,
            self.pos,
            self.generation,
        )?;
        if let Some(scope) = &self.scope {
            write!(f, " scope={scope}")?;
        }
        Ok(())
    }
}
