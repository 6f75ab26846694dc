//! Schema lifecycle markers.
//!
//! The engine does not interpret schemas; it records their lifecycle on
//! snapshot entries (`pending` → `active`, or `aborted`), keeps the
//! current `(active, pending)` pair, and maintains a parallel *pending
//! index* while a migration is open so the surrounding migration driver
//! can read the world as either schema. Marker filtering during
//! compaction lives in the compactor; replay lives in recovery.

use parking_lot::Mutex;

use logd_dlog::{SchemaMarker, SchemaState};

use crate::error::{Error, Result};

/// One resolved schema: name plus the commit its marker snapshot was
/// taken at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaAt {
    pub schema: String,
    pub commit: u64,
}

#[derive(Debug, Default)]
pub struct SchemaTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<SchemaAt>,
    pending: Option<SchemaAt>,
}

impl SchemaTracker {
    pub fn new() -> Self {
        SchemaTracker::default()
    }

    pub fn active(&self) -> Option<SchemaAt> {
        self.inner.lock().active.clone()
    }

    pub fn pending(&self) -> Option<SchemaAt> {
        self.inner.lock().pending.clone()
    }

    /// Begin a migration: record `schema` as pending. Fails if one is
    /// already open.
    pub fn begin(&self, schema: &str, commit: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending.is_some() {
            return Err(Error::MigrationInProgress);
        }
        inner.pending = Some(SchemaAt {
            schema: schema.to_string(),
            commit,
        });
        Ok(())
    }

    /// Promote the pending schema to active.
    pub fn activate(&self, commit: u64) -> Result<SchemaAt> {
        let mut inner = self.inner.lock();
        let pending = inner.pending.take().ok_or(Error::NoMigrationInProgress)?;
        let active = SchemaAt {
            schema: pending.schema,
            commit,
        };
        inner.active = Some(active.clone());
        Ok(active)
    }

    /// Drop the pending schema.
    pub fn abort(&self) -> Result<SchemaAt> {
        let mut inner = self.inner.lock();
        inner.pending.take().ok_or(Error::NoMigrationInProgress)
    }

    /// Replay one marker seen while scanning snapshot entries on open.
    /// Entries arrive in commit order; later markers win.
    pub fn observe(&self, marker: &SchemaMarker, commit: u64) {
        let mut inner = self.inner.lock();
        let at = SchemaAt {
            schema: marker.schema.clone(),
            commit,
        };
        match marker.state {
            SchemaState::Active => {
                inner.active = Some(at);
                // Activation resolves the pending marker it grew from.
                if inner
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.schema == marker.schema)
                {
                    inner.pending = None;
                }
            }
            SchemaState::Pending => inner.pending = Some(at),
            SchemaState::Aborted => {
                if inner
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.schema == marker.schema)
                {
                    inner.pending = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(schema: &str, state: SchemaState) -> SchemaMarker {
        SchemaMarker {
            schema: schema.into(),
            state,
        }
    }

    #[test]
    fn lifecycle() {
        let tracker = SchemaTracker::new();
        assert!(tracker.active().is_none());

        tracker.begin("v2", 5).unwrap();
        assert!(matches!(tracker.begin("v3", 6), Err(Error::MigrationInProgress)));

        let active = tracker.activate(7).unwrap();
        assert_eq!(active.schema, "v2");
        assert_eq!(tracker.active().unwrap().commit, 7);
        assert!(tracker.pending().is_none());
        assert!(matches!(tracker.abort(), Err(Error::NoMigrationInProgress)));
    }

    #[test]
    fn replay_in_commit_order() {
        let tracker = SchemaTracker::new();
        tracker.observe(&marker("v1", SchemaState::Active), 1);
        tracker.observe(&marker("v2", SchemaState::Pending), 4);
        tracker.observe(&marker("v2", SchemaState::Aborted), 6);
        tracker.observe(&marker("v3", SchemaState::Pending), 9);
        assert_eq!(tracker.active().unwrap().schema, "v1");
        assert_eq!(tracker.pending().unwrap().schema, "v3");

        tracker.observe(&marker("v3", SchemaState::Active), 12);
        assert_eq!(tracker.active().unwrap().schema, "v3");
        assert!(tracker.pending().is_none());
    }
}
