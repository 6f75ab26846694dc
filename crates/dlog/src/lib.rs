//! The double-buffered write-ahead log of `logd`.
//!
//! Two append-only files, exactly one of which is *active* at any time.
//! Appends target only the active file; snapshot production and in-place
//! compaction target only the inactive one, so long-running maintenance
//! never stalls the write path.
//!
//! Every physical rewrite of a file bumps its *generation*. Positional
//! references handed out by [`Dlog::append`] carry the generation they
//! were created under; a read against an outdated generation fails fast
//! with [`error::StaleGeneration`] instead of returning bytes from a
//! rewritten file.

mod dlog;
mod file;

pub mod entry;
pub mod error;
pub mod snapshot;

pub use crate::dlog::{Dlog, FileId};
pub use crate::entry::{EntryBody, LogEntry, ScopeId, SchemaMarker, SchemaState, SnapshotPayload};
pub use crate::file::Entries;
pub use crate::snapshot::SnapshotWriter;

/// Default grace period before the pre-compaction physical file of a log
/// is unlinked. Readers that raced the rewrite fail with a stale
/// generation and retry well within this window.
pub const DEFAULT_GRACE: std::time::Duration = std::time::Duration::from_secs(30);
