//! Scope overlay bookkeeping.
//!
//! A scope is an independent overlay keyed by [`ScopeId`]; the log and
//! index do the heavy lifting, this tracker only remembers which scopes
//! exist and which have received writes since the last snapshot (those
//! get their own snapshot at the next switch, before the baseline one).

use std::collections::BTreeSet;

use parking_lot::Mutex;

use logd_dlog::ScopeId;

#[derive(Debug, Default)]
pub struct ScopeTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: BTreeSet<ScopeId>,
    dirty: BTreeSet<ScopeId>,
}

impl ScopeTracker {
    pub fn new() -> Self {
        ScopeTracker::default()
    }

    /// Record a write through `scope`.
    pub fn mark_write(&self, scope: &ScopeId) {
        let mut inner = self.inner.lock();
        inner.active.insert(scope.clone());
        inner.dirty.insert(scope.clone());
    }

    /// Scopes known to this engine instance, sorted.
    pub fn active(&self) -> Vec<ScopeId> {
        self.inner.lock().active.iter().cloned().collect()
    }

    pub fn is_active(&self, scope: &ScopeId) -> bool {
        self.inner.lock().active.contains(scope)
    }

    /// Drain the scopes written since the last snapshot round.
    pub fn take_dirty(&self) -> Vec<ScopeId> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.dirty).into_iter().collect()
    }

    /// Forget a deleted scope entirely.
    pub fn forget(&self, scope: &ScopeId) -> bool {
        let mut inner = self.inner.lock();
        inner.dirty.remove(scope);
        inner.active.remove(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_drains_active_persists() {
        let tracker = ScopeTracker::new();
        let sb = ScopeId::new("sb");
        tracker.mark_write(&sb);
        assert!(tracker.is_active(&sb));
        assert_eq!(tracker.take_dirty(), vec![sb.clone()]);
        assert!(tracker.take_dirty().is_empty());
        assert!(tracker.is_active(&sb));

        assert!(tracker.forget(&sb));
        assert!(!tracker.is_active(&sb));
        assert!(!tracker.forget(&sb));
    }
}
