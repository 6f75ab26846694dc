//! The two-tier state cache.
//!
//! Tier one holds the compacted baseline state per path (published by the
//! compactor); tier two holds states computed on demand per
//! `(path, commit, scope)`. Both are best effort: a miss or an eviction
//! costs a reconstruction, never correctness.
//!
//! Eviction is heat based: `heat = frequency * recency / size_penalty`,
//! where frequency is an exponential moving average of hits, recency
//! decays logarithmically in commits since last access, and the size
//! penalty grows linearly beyond a baseline threshold. Values larger than
//! five times the threshold are never cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use logd_dlog::ScopeId;
use logd_value::{KindedPath, Node};

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub size_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            soft_limit: 32 << 20,
            hard_limit: 48 << 20,
            size_threshold: 1 << 20,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.hard_limit < self.soft_limit {
            return Err("cache hard limit below soft limit".into());
        }
        if self.size_threshold == 0 {
            return Err("cache size threshold must be positive".into());
        }
        Ok(())
    }
}

type ComputedKey = (KindedPath, u64, Option<ScopeId>);

#[derive(Debug)]
struct Entry {
    value: Option<Arc<Node>>,
    size: usize,
    frequency: f64,
    last_access_commit: u64,
}

impl Entry {
    fn heat(&self, current_commit: u64, threshold: usize) -> f64 {
        let age = current_commit.saturating_sub(self.last_access_commit) as f64;
        let recency = 1.0 / (1.0 + (1.0 + age).ln());
        let penalty = if self.size <= threshold {
            1.0
        } else {
            1.0 + (self.size - threshold) as f64 / threshold as f64
        };
        self.frequency * recency / penalty
    }

    fn touch(&mut self, current_commit: u64) {
        // EMA with a small decay; repeated hits push the frequency up
        // toward its asymptote.
        self.frequency = self.frequency * 0.8 + 1.0;
        self.last_access_commit = current_commit;
    }
}

#[derive(Debug, Default)]
struct Inner {
    compacted: HashMap<KindedPath, (u64, Entry)>,
    computed: HashMap<ComputedKey, Entry>,
    total_size: usize,
}

#[derive(Debug)]
pub struct StateCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StateCache {
    pub fn new(config: CacheConfig) -> Self {
        StateCache {
            config,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// `(hits, misses)` of the computed tier since open.
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Computed-tier lookup. `None` inside the hit means "known absent".
    #[allow(clippy::type_complexity)]
    pub fn get_computed(
        &self,
        path: &KindedPath,
        commit: u64,
        scope: Option<&ScopeId>,
        current_commit: u64,
    ) -> Option<Option<Arc<Node>>> {
        let key = (path.clone(), commit, scope.cloned());
        let mut inner = self.inner.lock();
        let Some(entry) = inner.computed.get_mut(&key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        entry.touch(current_commit);
        Some(entry.value.clone())
    }

    pub fn put_computed(
        &self,
        path: KindedPath,
        commit: u64,
        scope: Option<ScopeId>,
        value: Option<Arc<Node>>,
        current_commit: u64,
    ) {
        let size = entry_size(&value);
        if size > 5 * self.config.size_threshold {
            return;
        }
        let mut inner = self.inner.lock();
        let entry = Entry {
            value,
            size,
            frequency: 1.0,
            last_access_commit: current_commit,
        };
        if let Some(old) = inner.computed.insert((path, commit, scope), entry) {
            inner.total_size = inner.total_size.saturating_sub(old.size);
        }
        inner.total_size += size;
        self.evict(&mut inner, current_commit);
    }

    /// Compacted-tier lookup: the newest published baseline for `path`
    /// at or below `commit`, with the commit it is valid at.
    pub fn get_compacted(
        &self,
        path: &KindedPath,
        commit: u64,
        current_commit: u64,
    ) -> Option<(u64, Option<Arc<Node>>)> {
        let mut inner = self.inner.lock();
        let (end_commit, entry) = inner.compacted.get_mut(path)?;
        if *end_commit > commit {
            return None;
        }
        let end = *end_commit;
        entry.touch(current_commit);
        Some((end, entry.value.clone()))
    }

    /// Publish a compacted baseline state. The compactor calls this once
    /// per compaction for the paths it republished.
    pub fn put_compacted(
        &self,
        path: KindedPath,
        end_commit: u64,
        value: Option<Arc<Node>>,
        current_commit: u64,
    ) {
        let size = entry_size(&value);
        if size > 5 * self.config.size_threshold {
            return;
        }
        let mut inner = self.inner.lock();
        let entry = Entry {
            value,
            size,
            frequency: 1.0,
            last_access_commit: current_commit,
        };
        if let Some((_, old)) = inner.compacted.insert(path, (end_commit, entry)) {
            inner.total_size = inner.total_size.saturating_sub(old.size);
        }
        inner.total_size += size;
        self.evict(&mut inner, current_commit);
    }

    /// Drop every computed entry read through `scope`. Scope deletion
    /// changes what those reads see, unlike ordinary commits.
    pub fn invalidate_scope(&self, scope: &ScopeId) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        inner.computed.retain(|(_, _, cached_scope), entry| {
            if cached_scope.as_ref() == Some(scope) {
                freed += entry.size;
                return false;
            }
            true
        });
        inner.total_size = inner.total_size.saturating_sub(freed);
    }

    /// Drop computed entries at or above `commit` touching any of
    /// `paths` (ancestor or descendant). Commit-qualified entries below
    /// stay valid: history is immutable.
    pub fn invalidate(&self, paths: &[KindedPath], commit: u64) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        inner.computed.retain(|(path, at, _), entry| {
            let related = paths
                .iter()
                .any(|touched| touched.is_prefix_of(path) || path.is_prefix_of(touched));
            if related && *at >= commit {
                freed += entry.size;
                return false;
            }
            true
        });
        inner.total_size = inner.total_size.saturating_sub(freed);
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    fn evict(&self, inner: &mut Inner, current_commit: u64) {
        if inner.total_size <= self.config.soft_limit {
            return;
        }
        let threshold = self.config.size_threshold;

        // Coldest first until under the soft limit.
        let mut scored: Vec<(f64, ComputedKey)> = inner
            .computed
            .iter()
            .map(|(key, entry)| (entry.heat(current_commit, threshold), key.clone()))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut scored = scored.into_iter();
        while inner.total_size > self.config.soft_limit {
            let Some((_, key)) = scored.next() else { break };
            if let Some(entry) = inner.computed.remove(&key) {
                inner.total_size = inner.total_size.saturating_sub(entry.size);
            }
        }
        if inner.total_size <= self.config.hard_limit {
            return;
        }

        // Still over the hard limit: shed below-average-heat compacted
        // entries too.
        let heats: Vec<f64> = inner
            .compacted
            .values()
            .map(|(_, entry)| entry.heat(current_commit, threshold))
            .collect();
        if heats.is_empty() {
            return;
        }
        let average = heats.iter().sum::<f64>() / heats.len() as f64;
        let doomed: Vec<KindedPath> = inner
            .compacted
            .iter()
            .filter(|(_, (_, entry))| entry.heat(current_commit, threshold) < average)
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            if inner.total_size <= self.config.hard_limit {
                break;
            }
            if let Some((_, entry)) = inner.compacted.remove(&path) {
                inner.total_size = inner.total_size.saturating_sub(entry.size);
            }
        }
    }
}

fn entry_size(value: &Option<Arc<Node>>) -> usize {
    value.as_ref().map_or(16, |node| node.estimated_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> KindedPath {
        KindedPath::parse(raw).unwrap()
    }

    fn cache(soft: usize, hard: usize) -> StateCache {
        StateCache::new(CacheConfig {
            soft_limit: soft,
            hard_limit: hard,
            size_threshold: 64,
        })
    }

    #[test]
    fn computed_roundtrip_and_absence() {
        let cache = cache(1 << 20, 2 << 20);
        let p = path("/u/a");
        assert!(cache.get_computed(&p, 1, None, 1).is_none());

        cache.put_computed(p.clone(), 1, None, Some(Arc::new(Node::int(7))), 1);
        let hit = cache.get_computed(&p, 1, None, 2).unwrap().unwrap();
        assert_eq!(*hit, Node::int(7));

        cache.put_computed(p.clone(), 2, None, None, 2);
        assert_eq!(cache.get_computed(&p, 2, None, 2), Some(None));
    }

    #[test]
    fn oversized_values_are_not_cached() {
        let cache = cache(1 << 20, 2 << 20);
        let big = Node::string("x".repeat(100_000));
        cache.put_computed(path("/big"), 1, None, Some(Arc::new(big)), 1);
        assert!(cache.get_computed(&path("/big"), 1, None, 1).is_none());
    }

    #[test]
    fn eviction_prefers_cold_entries() {
        let cache = cache(600, 1 << 20);
        for i in 0..8 {
            let p = path(&format!("/p{i}"));
            cache.put_computed(p, 1, None, Some(Arc::new(Node::int(i as i64))), 1);
        }
        // Heat up /p0 well past the others.
        for round in 0..50 {
            cache.get_computed(&path("/p0"), 1, None, round);
        }
        // Push over the soft limit repeatedly.
        for i in 8..16 {
            let p = path(&format!("/p{i}"));
            cache.put_computed(p, 1, None, Some(Arc::new(Node::int(i as i64))), 50);
        }
        assert!(cache.total_size() <= 600);
        assert!(
            cache.get_computed(&path("/p0"), 1, None, 51).is_some(),
            "hot entry should survive eviction"
        );
    }

    #[test]
    fn invalidate_scope_drops_only_that_scope() {
        let cache = cache(1 << 20, 2 << 20);
        let sb = ScopeId::new("sb");
        cache.put_computed(path("/x"), 1, Some(sb.clone()), Some(Arc::new(Node::int(1))), 1);
        cache.put_computed(path("/x"), 1, None, Some(Arc::new(Node::int(2))), 1);
        cache.invalidate_scope(&sb);
        assert!(cache.get_computed(&path("/x"), 1, Some(&sb), 1).is_none());
        assert!(cache.get_computed(&path("/x"), 1, None, 1).is_some());
    }

    #[test]
    fn invalidate_respects_commit_qualification() {
        let cache = cache(1 << 20, 2 << 20);
        cache.put_computed(path("/u/a"), 3, None, Some(Arc::new(Node::int(1))), 3);
        cache.put_computed(path("/u/a"), 7, None, Some(Arc::new(Node::int(2))), 7);
        cache.invalidate(&[path("/u")], 7);
        assert!(cache.get_computed(&path("/u/a"), 3, None, 7).is_some());
        assert!(cache.get_computed(&path("/u/a"), 7, None, 7).is_none());
    }

    #[test]
    fn compacted_tier_respects_commit_floor() {
        let cache = cache(1 << 20, 2 << 20);
        cache.put_compacted(path("/"), 5, Some(Arc::new(Node::int(5))), 5);
        assert!(cache.get_compacted(&path("/"), 4, 5).is_none());
        let (end, value) = cache.get_compacted(&path("/"), 9, 9).unwrap();
        assert_eq!(end, 5);
        assert_eq!(*value.unwrap(), Node::int(5));
    }
}
