//! The engine: the public surface of the store.
//!
//! Owns the sequencer, the double-buffered log, the path index and the
//! trackers; drives recovery on open, the commit pipeline, snapshot
//! rounds and compaction. There is no process-wide state: everything
//! lives in the [`Engine`] value, shared by reference.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools as _;
use log::{debug, info, warn};
use parking_lot::Mutex;

use logd_dlog::{Dlog, EntryBody, LogEntry, ScopeId, SchemaMarker, SchemaState};
use logd_value::{matcher, patch, KindedPath, Node};

use crate::cache::{CacheConfig, StateCache};
use crate::compact::{self, CompactionConfig, CompactionOutcome};
use crate::error::{Error, Result, TxError};
use crate::index::PathIndex;
use crate::lock_file::LockFile;
use crate::schema::{SchemaAt, SchemaTracker};
use crate::scope::ScopeTracker;
use crate::segment::SegmentRef;
use crate::seq::Sequencer;
use crate::state::StateCtx;
use crate::tx::{Participant, PendingTxFile, Tx, TxLogRecord, TxResult, TxStatus};

/// Maps a kinded path into its location under a named schema. Identity
/// when absent; the surrounding migration machinery provides real ones.
pub type SchemaResolver = Arc<dyn Fn(&str, &KindedPath) -> KindedPath + Send + Sync>;

/// Handed to the registered commit notifier after every publish.
#[derive(Clone, Debug)]
pub struct CommitNotification {
    pub commit: u64,
    pub timestamp: DateTime<Utc>,
    /// Top-level paths the transaction touched.
    pub paths: Vec<KindedPath>,
    /// The merged patch as written to the log.
    pub patch: Arc<Node>,
    pub scope: Option<ScopeId>,
}

type Notifier = Box<dyn Fn(&CommitNotification) + Send + Sync>;

#[derive(Clone)]
pub struct Options {
    pub tx_timeout: Duration,
    pub compaction: CompactionConfig,
    pub cache: CacheConfig,
    /// `maybe_switch` rotates once the active file exceeds this.
    pub switch_threshold_bytes: u64,
    pub schema_resolver: Option<SchemaResolver>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tx_timeout: Duration::from_secs(30),
            compaction: CompactionConfig::default(),
            cache: CacheConfig::default(),
            switch_threshold_bytes: 64 << 20,
            schema_resolver: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("tx_timeout", &self.tx_timeout)
            .field("compaction", &self.compaction)
            .field("switch_threshold_bytes", &self.switch_threshold_bytes)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub entries_appended: AtomicU64,
    pub snapshots_built: AtomicU64,
    pub compactions_run: AtomicU64,
    pub tx_committed: AtomicU64,
    pub tx_aborted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub entries_appended: u64,
    pub snapshots_built: u64,
    pub compactions_run: u64,
    pub tx_committed: u64,
    pub tx_aborted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A participant's patch request: target path, diff body, optional match
/// condition checked at commit time.
#[derive(Clone, Debug)]
pub struct PatchRequest {
    pub path: KindedPath,
    pub body: Node,
    pub match_cond: Option<Node>,
}

impl PatchRequest {
    pub fn new(path: &str, body: Node) -> Result<Self> {
        Ok(PatchRequest {
            path: KindedPath::parse(path)?,
            body,
            match_cond: None,
        })
    }

    pub fn with_match(mut self, match_cond: Node) -> Self {
        self.match_cond = Some(match_cond);
        self
    }
}

pub struct Engine {
    root: PathBuf,
    _lock: LockFile,
    seq: Sequencer,
    dlog: Dlog,
    index: PathIndex,
    pending_index: Mutex<Option<PathIndex>>,
    txs: Mutex<HashMap<u64, Arc<Tx>>>,
    tx_timeout: Mutex<Duration>,
    scopes: ScopeTracker,
    schema: SchemaTracker,
    cache: StateCache,
    notifier: Mutex<Option<Notifier>>,
    /// Serialises the publish pipeline: match validation, sequence
    /// allocation, append, index publish.
    commit_lock: Mutex<()>,
    txlog: Mutex<File>,
    options: Options,
    stats: Stats,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("commit", &self.seq.current().commit)
            .finish()
    }
}

impl Engine {
    /// Open the store under `root`, running recovery.
    pub fn open(root: impl Into<PathBuf>, options: Options) -> Result<Engine> {
        options.compaction.validate()?;
        options
            .cache
            .validate()
            .map_err(Error::InvalidArgument)?;

        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io("create-dir", &root, e))?;
        let lock = LockFile::lock(&root)?;
        let meta_dir = root.join("meta");
        let tx_dir = meta_dir.join("transactions");
        fs::create_dir_all(&tx_dir).map_err(|e| Error::io("create-dir", &tx_dir, e))?;

        let seq = Sequencer::open(&meta_dir)?;
        let dlog = Dlog::open(&root, seq.current().active)?;

        // Trust the persisted index only if its positions can still be
        // resolved against the current file generations.
        let index_path = root.join("index.snapshot");
        let mut high_water = None;
        let mut index = PathIndex::new();
        if let Some((loaded, hw)) = PathIndex::load(&index_path)? {
            let generations_match = [logd_dlog::FileId::A, logd_dlog::FileId::B]
                .into_iter()
                .all(|file| {
                    loaded
                        .segments_in_file(file)
                        .iter()
                        .all(|seg| seg.generation == dlog.generation(file))
                });
            if generations_match {
                debug!("index snapshot accepted, high water {hw}");
                high_water = Some(hw);
                index = loaded;
            } else {
                warn!("index snapshot predates a compaction, rebuilding from the log");
            }
        }

        let engine = Engine {
            txlog: Mutex::new(open_txlog(&meta_dir)?),
            _lock: lock,
            seq,
            dlog,
            index,
            pending_index: Mutex::new(None),
            txs: Mutex::new(HashMap::new()),
            tx_timeout: Mutex::new(options.tx_timeout),
            scopes: ScopeTracker::new(),
            schema: SchemaTracker::new(),
            cache: StateCache::new(options.cache),
            notifier: Mutex::new(None),
            commit_lock: Mutex::new(()),
            options,
            stats: Stats::default(),
            root,
        };

        engine.recover(high_water)?;
        engine.persist_index()?;
        Ok(engine)
    }

    /// Flush state that only lives in memory: the index snapshot with its
    /// high-water commit. Call before dropping for cheap restarts; a
    /// crash without it only costs a log rescan.
    pub fn close(&self) -> Result<()> {
        self.persist_index()?;
        self.txlog
            .lock()
            .sync_data()
            .map_err(|e| Error::io("sync", self.txlog_path(), e))?;
        info!("engine closed at commit {}", self.get_current_commit());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Create an `N`-participant transaction.
    pub fn new_tx(&self, participants: u32, scope: Option<ScopeId>) -> Result<Arc<Tx>> {
        if participants < 1 {
            return Err(Error::invalid("participant count must be at least 1"));
        }
        let id = self.seq.next_tx_seq()?;
        let tx = Tx::new(id, participants, scope, *self.tx_timeout.lock());
        self.write_pending_file(&tx)?;
        self.txs.lock().insert(id, tx.clone());
        Ok(tx)
    }

    pub fn get_tx(&self, id: u64) -> Result<Arc<Tx>> {
        self.txs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {id}")))
    }

    /// A patcher for one participant's contribution to `tx`.
    pub fn new_patcher(&self, tx: &Arc<Tx>, req: PatchRequest) -> Result<Patcher<'_>> {
        if req.body.is_null() && req.body.tag().is_empty() && req.match_cond.is_none() {
            return Err(Error::invalid("patch body must not be empty"));
        }
        Ok(Patcher {
            engine: self,
            tx: tx.clone(),
            req: Some(req),
        })
    }

    /// Single-participant convenience: one patch, one commit.
    pub fn commit_one(
        &self,
        req: PatchRequest,
        scope: Option<ScopeId>,
    ) -> Result<TxResult> {
        let tx = self.new_tx(1, scope)?;
        let mut patcher = self.new_patcher(&tx, req)?;
        Ok(patcher.commit())
    }

    /// The commit sequence, run by exactly one participant.
    fn run_commit(&self, tx: &Arc<Tx>) -> TxResult {
        let participants = {
            let mut inner = tx.inner.lock();
            if let Some(result) = &inner.result {
                return result.clone();
            }
            debug_assert_eq!(inner.received.len() as u32, tx.participants);
            inner.status = TxStatus::Committing;
            inner.received.clone()
        };

        let result = self.commit_pipeline(tx, &participants);
        match result {
            Ok(result) => result,
            Err(e) => self.abort_tx(tx, &e),
        }
    }

    fn commit_pipeline(&self, tx: &Arc<Tx>, participants: &[Participant]) -> Result<TxResult> {
        let _serial = self.commit_lock.lock();

        // Match validation against the state just before this commit.
        // Any failure aborts the whole transaction.
        for participant in participants {
            let Some(cond) = &participant.match_ else { continue };
            let state = self.state_ctx().read_state_at(
                &participant.path,
                self.seq.current().commit,
                tx.scope.as_ref(),
            )?;
            if !matcher::matches(state.as_ref(), cond) {
                return Err(Error::Conflict(format!(
                    "match failed at {}",
                    participant.path
                )));
            }
        }

        let previous = self.seq.current().commit;
        let commit = self.seq.next_commit()?;

        let mut merged = Node::object::<String>([]);
        for participant in participants {
            patch::graft(&mut merged, &participant.path, participant.body.clone());
        }
        let entry = LogEntry {
            commit,
            tx_seq: tx.id,
            last_commit: previous,
            timestamp: Utc::now(),
            scope: tx.scope.clone(),
            schema: None,
            body: EntryBody::Patch(merged.clone()),
        };

        let (file, pos) = match self.dlog.append(&entry) {
            Ok(at) => at,
            Err(e) => {
                // Keep the sequence gap-free: the number we burned cannot
                // have been observed, the pipeline is serialised.
                if let Err(rollback) = self.seq.rollback_commit(previous) {
                    warn!("sequencer rollback failed after append error: {rollback}");
                }
                return Err(e.into());
            }
        };
        let generation = self.dlog.generation(file);
        self.stats.entries_appended.fetch_add(1, Ordering::Relaxed);

        for participant in participants {
            let seg = SegmentRef {
                start_commit: commit,
                end_commit: commit,
                start_tx: participant.tx_seq,
                end_tx: participant.tx_seq,
                path: participant.path.clone(),
                file,
                pos,
                generation,
                scope: tx.scope.clone(),
                snapshot: false,
            };
            if let Some(pending) = &*self.pending_index.lock() {
                pending.add(self.resolve_pending(&seg));
            }
            self.index.add(seg);
        }

        let touched: Vec<KindedPath> = participants
            .iter()
            .map(|p| p.path.clone())
            .collect();
        self.cache.invalidate(&touched, commit);
        if let Some(scope) = &tx.scope {
            self.scopes.mark_write(scope);
        }

        // The WAL entry is durable and published; a failure to note the
        // commit in the recovery log must not un-commit it. Recovery
        // treats a pending file whose entry is in the WAL as committed.
        if let Err(e) = self.append_txlog(tx.id, commit) {
            warn!("could not record commit {commit} in transactions.log: {e}");
        }
        self.remove_pending_file(tx.id);

        self.notify(CommitNotification {
            commit,
            timestamp: entry.timestamp,
            paths: top_level_paths(&touched),
            patch: Arc::new(merged),
            scope: tx.scope.clone(),
        });

        self.stats.tx_committed.fetch_add(1, Ordering::Relaxed);
        let result = tx.finish(TxStatus::Committed, TxResult::committed(commit));
        self.txs.lock().remove(&tx.id);
        Ok(result)
    }

    fn abort_tx(&self, tx: &Arc<Tx>, error: &Error) -> TxResult {
        debug!("transaction {} aborted: {error}", tx.id);
        self.stats.tx_aborted.fetch_add(1, Ordering::Relaxed);
        let result = tx.finish(TxStatus::Aborted, TxResult::aborted(TxError::from(error)));
        self.remove_pending_file(tx.id);
        self.txs.lock().remove(&tx.id);
        result
    }

    fn notify(&self, notification: CommitNotification) {
        let guard = self.notifier.lock();
        if let Some(notifier) = &*guard {
            // The hook is contractually non-blocking, but never let a
            // panicking consumer poison the commit path.
            if catch_unwind(AssertUnwindSafe(|| notifier(&notification))).is_err() {
                warn!("commit notifier panicked at commit {}", notification.commit);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read_state_at(
        &self,
        path: &str,
        commit: u64,
        scope: Option<&ScopeId>,
    ) -> Result<Option<Node>> {
        let path = KindedPath::parse(path)?;
        self.state_ctx().read_state_at(&path, commit, scope)
    }

    pub fn read_current_state(&self, path: &str, scope: Option<&ScopeId>) -> Result<Option<Node>> {
        self.read_state_at(path, self.get_current_commit(), scope)
    }

    pub fn list_child_paths(
        &self,
        parent: &str,
        from: Option<u64>,
        to: Option<u64>,
        scope: Option<&ScopeId>,
    ) -> Result<Vec<KindedPath>> {
        let parent = KindedPath::parse(parent)?;
        Ok(self.index.list_child_paths(&parent, from, to, scope))
    }

    pub fn get_current_commit(&self) -> u64 {
        self.seq.current().commit
    }

    // ------------------------------------------------------------------
    // Hooks and knobs
    // ------------------------------------------------------------------

    /// Register the commit notification hook. It must not block.
    pub fn set_commit_notifier(&self, notifier: impl Fn(&CommitNotification) + Send + Sync + 'static) {
        *self.notifier.lock() = Some(Box::new(notifier));
    }

    /// Deadline applied to transactions created from now on.
    pub fn set_tx_timeout(&self, timeout: Duration) {
        *self.tx_timeout.lock() = timeout;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (cache_hits, cache_misses) = self.cache.hit_stats();
        StatsSnapshot {
            entries_appended: self.stats.entries_appended.load(Ordering::Relaxed),
            snapshots_built: self.stats.snapshots_built.load(Ordering::Relaxed),
            compactions_run: self.stats.compactions_run.load(Ordering::Relaxed),
            tx_committed: self.stats.tx_committed.load(Ordering::Relaxed),
            tx_aborted: self.stats.tx_aborted.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Delete a scope: index-only, the log stays append-only. Segments
    /// become unreachable and are reclaimed by the next compaction of the
    /// inactive file.
    pub fn delete_scope(&self, scope: &ScopeId) -> Result<usize> {
        let removed = self.index.delete_scope(scope);
        if let Some(pending) = &*self.pending_index.lock() {
            pending.delete_scope(scope);
        }
        self.cache.invalidate_scope(scope);
        let known = self.scopes.forget(scope);
        if removed == 0 && !known {
            return Err(Error::NotFound(format!("scope {scope}")));
        }
        info!("deleted scope {scope}: {removed} segment(s) retired");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Maintenance: switching, snapshots, compaction
    // ------------------------------------------------------------------

    /// Rotate the active file, materialise snapshots (dirty scopes first,
    /// then the baseline) and compact the now-inactive file.
    ///
    /// Serialised against the commit pipeline: a flip between a commit's
    /// append and its index publish would let compaction drop the
    /// not-yet-indexed entry.
    pub fn switch_dlog(&self) -> Result<()> {
        let _serial = self.commit_lock.lock();
        let active = self.dlog.switch_active();
        self.seq.set_active(active)?;

        let commit = self.get_current_commit();
        if commit > 0 {
            let now = Utc::now();
            for scope in self.scopes.take_dirty() {
                self.state_ctx()
                    .create_snapshot(commit, Some(&scope), None, now)?;
                self.stats.snapshots_built.fetch_add(1, Ordering::Relaxed);
            }
            self.state_ctx().create_snapshot(commit, None, None, now)?;
            self.stats.snapshots_built.fetch_add(1, Ordering::Relaxed);
        }

        self.compact(None)?;
        Ok(())
    }

    /// Rotate if the active file outgrew the configured threshold.
    pub fn maybe_switch(&self) -> Result<bool> {
        if self.dlog.active_log_size() < self.options.switch_threshold_bytes {
            return Ok(false);
        }
        self.switch_dlog()?;
        Ok(true)
    }

    /// Compact the inactive file now, with `config` or the engine's own.
    pub fn compact(&self, config: Option<&CompactionConfig>) -> Result<CompactionOutcome> {
        self.compact_inner(config, Utc::now())
    }

    /// Compaction with an injected clock, for exercising retention
    /// policies without waiting out the cutoff.
    #[cfg(any(test, feature = "test"))]
    pub fn compact_at(
        &self,
        config: Option<&CompactionConfig>,
        now: DateTime<Utc>,
    ) -> Result<CompactionOutcome> {
        self.compact_inner(config, now)
    }

    fn compact_inner(
        &self,
        config: Option<&CompactionConfig>,
        now: DateTime<Utc>,
    ) -> Result<CompactionOutcome> {
        let config = config.unwrap_or(&self.options.compaction);
        let outcome = compact::run(&self.state_ctx(), &self.schema, config, now)?;
        self.stats.compactions_run.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Schema migration hooks
    // ------------------------------------------------------------------

    /// Record `schema` as pending and start dual-indexing new patches
    /// under it. The migration driver above owns the rest.
    pub fn begin_migration(&self, schema: &str) -> Result<()> {
        if self.schema.pending().is_some() {
            return Err(Error::MigrationInProgress);
        }
        let commit = self.get_current_commit();
        let marker = SchemaMarker {
            schema: schema.to_string(),
            state: SchemaState::Pending,
        };
        self.state_ctx()
            .create_snapshot(commit, None, Some(marker), Utc::now())?;
        self.schema.begin(schema, commit)?;
        self.rebuild_pending_index()?;
        info!("schema migration to {schema:?} opened at commit {commit}");
        Ok(())
    }

    /// Promote the pending schema; its index becomes the primary.
    pub fn activate_schema(&self) -> Result<SchemaAt> {
        let pending = self.schema.pending().ok_or(Error::NoMigrationInProgress)?;
        let commit = self.get_current_commit();
        let marker = SchemaMarker {
            schema: pending.schema.clone(),
            state: SchemaState::Active,
        };
        self.state_ctx()
            .create_snapshot(commit, None, Some(marker), Utc::now())?;
        *self.pending_index.lock() = None;
        let active = self.schema.activate(commit)?;
        info!("schema {} active at commit {commit}", active.schema);
        Ok(active)
    }

    pub fn abort_migration(&self) -> Result<()> {
        let pending = self.schema.abort()?;
        let marker = SchemaMarker {
            schema: pending.schema,
            state: SchemaState::Aborted,
        };
        self.state_ctx()
            .create_snapshot(self.get_current_commit(), None, Some(marker), Utc::now())?;
        *self.pending_index.lock() = None;
        Ok(())
    }

    pub fn active_schema(&self) -> Option<SchemaAt> {
        self.schema.active()
    }

    pub fn pending_schema(&self) -> Option<SchemaAt> {
        self.schema.pending()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn state_ctx(&self) -> StateCtx<'_> {
        StateCtx {
            index: &self.index,
            dlog: &self.dlog,
            cache: &self.cache,
        }
    }

    fn resolve_pending(&self, seg: &SegmentRef) -> SegmentRef {
        let resolved = match (&self.options.schema_resolver, self.schema.pending()) {
            (Some(resolver), Some(pending)) => resolver(&pending.schema, &seg.path),
            _ => seg.path.clone(),
        };
        SegmentRef {
            path: resolved,
            ..seg.clone()
        }
    }

    /// Build the parallel pending index from every patch after the active
    /// schema's commit.
    fn rebuild_pending_index(&self) -> Result<()> {
        let from = self.schema.active().map(|a| a.commit + 1).unwrap_or(0);
        let pending = PathIndex::new();
        for seg in self
            .index
            .lookup_range_all(&KindedPath::root(), Some(from), None)
        {
            if seg.snapshot {
                continue;
            }
            pending.add(self.resolve_pending(&seg));
        }
        debug!("pending index rebuilt: {} segment(s)", pending.len());
        *self.pending_index.lock() = Some(pending);
        Ok(())
    }

    fn txlog_path(&self) -> PathBuf {
        self.root.join("meta").join("transactions.log")
    }

    fn pending_path(&self, id: u64) -> PathBuf {
        self.root
            .join("meta")
            .join("transactions")
            .join(format!("{id}.pending"))
    }

    fn write_pending_file(&self, tx: &Tx) -> Result<()> {
        let path = self.pending_path(tx.id);
        let record = PendingTxFile {
            id: tx.id,
            participants: tx.participants,
            scope: tx.scope.as_ref().map(|s| s.as_str().to_string()),
            created_at: Utc::now(),
        };
        let dir = path.parent().expect("pending file has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::io("create-temp", dir, e))?;
        serde_json::to_writer(&mut tmp, &record)
            .map_err(|e| Error::io("write", &path, e.into()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io("sync", &path, e))?;
        tmp.persist(&path)
            .map_err(|e| Error::io("rename", &path, e.error))?;
        Ok(())
    }

    fn remove_pending_file(&self, id: u64) {
        let path = self.pending_path(id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {e}", path.display());
            }
        }
    }

    fn append_txlog(&self, tx: u64, commit: u64) -> Result<()> {
        let mut file = self.txlog.lock();
        let line = serde_json::to_string(&TxLogRecord { tx, commit })
            .expect("txlog record serialises");
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.sync_data())
            .map_err(|e| Error::io("append", self.txlog_path(), e))
    }

    fn persist_index(&self) -> Result<()> {
        self.index
            .persist(&self.root.join("index.snapshot"), self.get_current_commit())
    }

    /// Recovery: rebuild index segments past the high-water commit,
    /// resolve in-flight transactions, replay schema markers.
    fn recover(&self, high_water: Option<u64>) -> Result<()> {
        let mut max_commit = 0u64;
        let mut max_tx = 0u64;
        let mut markers: Vec<(u64, SchemaMarker)> = Vec::new();
        let mut rebuilt = 0usize;
        let mut wal_txs: HashSet<u64> = HashSet::new();

        for file in [logd_dlog::FileId::A, logd_dlog::FileId::B] {
            let generation = self.dlog.generation(file);
            let mut indexed: std::result::Result<(), Error> = Ok(());
            let scanned = self.dlog.for_each_entry(file, |pos, entry| {
                max_commit = max_commit.max(entry.commit);
                max_tx = max_tx.max(entry.tx_seq);
                if !entry.is_snapshot() {
                    wal_txs.insert(entry.tx_seq);
                }
                if let Some(marker) = &entry.schema {
                    if entry.is_snapshot() {
                        markers.push((entry.commit, marker.clone()));
                    }
                }
                if high_water.map_or(true, |hw| entry.commit > hw) {
                    match self.index_entry(file, pos, generation, &entry) {
                        Ok(count) => rebuilt += count,
                        Err(e) => {
                            indexed = Err(e);
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "indexing failed",
                            ));
                        }
                    }
                }
                if let Some(scope) = &entry.scope {
                    if !entry.is_snapshot() {
                        self.scopes.mark_write(scope);
                    }
                }
                Ok(())
            });
            indexed?;
            scanned?;
        }
        if rebuilt > 0 {
            info!("recovery reindexed {rebuilt} segment(s)");
        }
        self.seq.ensure_floor(max_commit, max_tx)?;

        // Committed transactions: the recovery log, plus any transaction
        // whose entry made it into the WAL before the log line did.
        let mut committed = self.read_txlog()?;
        committed.extend(wal_txs);

        // Orphan pending files: committed ones are leftovers, the rest
        // were in flight at the crash and count as aborted.
        let tx_dir = self.root.join("meta").join("transactions");
        let entries = fs::read_dir(&tx_dir).map_err(|e| Error::io("read-dir", &tx_dir, e))?;
        for dent in entries {
            let dent = dent.map_err(|e| Error::io("read-dir", &tx_dir, e))?;
            let name = dent.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".pending"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if committed.contains(&id) {
                debug!("removing pending file of committed transaction {id}");
            } else {
                warn!("transaction {id} was in flight at shutdown; aborted");
            }
            let _ = fs::remove_file(dent.path());
        }

        // Schema replay: snapshot markers in commit order.
        markers.sort_by_key(|(commit, _)| *commit);
        for (commit, marker) in &markers {
            self.schema.observe(marker, *commit);
        }
        if self.schema.pending().is_some() {
            self.rebuild_pending_index()?;
        }

        debug!(
            "recovery complete: commit {}, tx {}",
            self.seq.current().commit,
            self.seq.current().tx_seq
        );
        Ok(())
    }

    /// Index one log entry: one segment per participant root of a patch,
    /// one root segment for a snapshot.
    fn index_entry(
        &self,
        file: logd_dlog::FileId,
        pos: u64,
        generation: u64,
        entry: &LogEntry,
    ) -> Result<usize> {
        let mut added = 0;
        let mut add = |path: KindedPath, snapshot: bool| {
            self.index.add(SegmentRef {
                start_commit: entry.commit,
                end_commit: entry.commit,
                start_tx: entry.tx_seq,
                end_tx: entry.tx_seq,
                path,
                file,
                pos,
                generation,
                scope: entry.scope.clone(),
                snapshot,
            });
            added += 1;
        };
        match &entry.body {
            EntryBody::Snapshot(_) => add(KindedPath::root(), true),
            EntryBody::Patch(merged) => {
                let roots = patch::collect_patch_roots(merged);
                if roots.is_empty() {
                    add(KindedPath::root(), false);
                } else {
                    for (path, _) in roots {
                        add(path, false);
                    }
                }
            }
        }
        Ok(added)
    }

    fn read_txlog(&self) -> Result<HashSet<u64>> {
        let path = self.txlog_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(Error::io("open", &path, e)),
        };
        let mut committed = HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::io("read", &path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TxLogRecord>(&line) {
                Ok(record) => {
                    committed.insert(record.tx);
                }
                // A torn final line is a crash artifact, not corruption.
                Err(e) => warn!("skipping malformed transactions.log line: {e}"),
            }
        }
        Ok(committed)
    }
}

/// A participant's handle on a transaction.
pub struct Patcher<'e> {
    engine: &'e Engine,
    tx: Arc<Tx>,
    req: Option<PatchRequest>,
}

impl Patcher<'_> {
    /// Submit this participant's patch. The last arrival runs the commit
    /// sequence; everyone else blocks until it completes. Idempotent
    /// after completion.
    pub fn commit(&mut self) -> TxResult {
        if let Some(result) = self.tx.result() {
            return result;
        }
        if self.tx.expired() {
            return self
                .engine
                .abort_tx(&self.tx, &Error::Timeout { tx_id: self.tx.id });
        }

        let runs_pipeline = match self.req.take() {
            Some(req) => {
                let mut inner = self.tx.inner.lock();
                if inner.result.is_some()
                    || inner.status != TxStatus::Pending
                    || inner.received.len() as u32 >= self.tx.participants
                {
                    drop(inner);
                    return self.wait_for_completion();
                }
                inner.received.push(Participant {
                    path: req.path,
                    body: req.body,
                    match_: req.match_cond,
                    tx_seq: self.tx.id,
                });
                inner.received.len() as u32 == self.tx.participants
            }
            // Submitted before; this call just waits.
            None => false,
        };

        if runs_pipeline {
            self.engine.run_commit(&self.tx)
        } else {
            self.wait_for_completion()
        }
    }

    /// Block until the transaction completes; on deadline expiry the
    /// waiter itself aborts the transaction.
    pub fn wait_for_completion(&self) -> TxResult {
        match self.tx.wait() {
            Some(result) => result,
            None => self
                .engine
                .abort_tx(&self.tx, &Error::Timeout { tx_id: self.tx.id }),
        }
    }

    /// Non-blocking peek at the outcome.
    pub fn get_result(&self) -> Option<TxResult> {
        self.tx.result()
    }

    pub fn tx(&self) -> &Arc<Tx> {
        &self.tx
    }
}

fn top_level_paths(paths: &[KindedPath]) -> Vec<KindedPath> {
    paths
        .iter()
        .map(|path| match path.first() {
            Some(seg) => KindedPath::root().child(seg.clone()),
            None => KindedPath::root(),
        })
        .unique()
        .collect()
}

fn open_txlog(meta_dir: &Path) -> Result<File> {
    let path = meta_dir.join("transactions.log");
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| Error::io("open", &path, e))
}
