//! The engine
//!
//! Ties the parts together: the operation processor applying versioned
//! writes, the lifecycle state machine, and the refresh/flush/merge/recovery
//! coordination.
//!
//! Concurrency model: operations take a shared permit on the lifecycle gate
//! for their duration; start/stop/close/fail take the exclusive permit, so
//! an operation in flight completes (or fails) before a stop finalizes and
//! a stop in flight finishes before new operations are admitted. Per-key
//! version read-modify-write happens under the key's shard lock in the
//! version map and is linearizable per key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::index::segment::{Segment, SegmentsStats};
use crate::index::{IndexWriter, ReaderSnapshot, StoredDoc};
use crate::merge::MergeScheduler;
use crate::ops::{
    Create, Delete, DeleteOutcome, Get, GetResult, Index, Origin, VersionType, WriteOutcome,
};
use crate::recovery::RecoveryHandler;
use crate::settings::{EngineSettings, SettingsService};
use crate::store::{Store, StoreRef};
use crate::translog::{Translog, TranslogEntry};
use crate::version::{VersionMap, VersionValue};
use crate::{EngineError, Result};

// ============================================================================
// Lifecycle
// ============================================================================

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    New,
    Started,
    Failed,
    Closed,
}

enum Lifecycle {
    New,
    Started(Arc<EngineCore>),
    Failed,
    Closed,
}

/// Live state of a started engine. Dropped as a unit on stop/close/fail,
/// releasing the start-time store reference.
struct EngineCore {
    writer: Arc<IndexWriter>,
    _start_ref: StoreRef,
}

/// Flush variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Commit the index and advance the translog durability checkpoint.
    CommitTranslog,
    /// Same, and rebuild the writer configuration from current settings.
    NewWriter,
}

/// Current writer-level configuration, derived from the latest settings
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub codec: String,
    pub compound_on_flush: bool,
    pub max_thread_states: usize,
}

/// A ref-counted point-in-time reader handle. Holds a store reference and
/// a reader snapshot; both are released when the searcher drops. The view
/// is stable across concurrent writes, refreshes and merges.
pub struct Searcher {
    source: String,
    snapshot: Arc<ReaderSnapshot>,
    _store_ref: StoreRef,
}

impl Searcher {
    /// Diagnostic label given at acquisition.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn doc_count(&self) -> usize {
        self.snapshot.doc_count()
    }

    pub fn get(&self, uid: &str) -> Option<StoredDoc> {
        self.snapshot.get(uid)
    }
}

struct RecoveringGuard<'a>(&'a AtomicBool);

impl Drop for RecoveringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    settings: Arc<SettingsService>,
    store: Arc<Store>,
    translog: Arc<Translog>,
    merges: Arc<MergeScheduler>,
    versions: VersionMap,
    state: RwLock<Lifecycle>,
    holder_ref: Mutex<Option<StoreRef>>,
    flush_lock: Mutex<()>,
    recovering: AtomicBool,
    gc_deletes_enabled: AtomicBool,
}

/// Per-shard storage engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Construct an engine over a store, a translog and a merge scheduler.
    /// Takes one store reference for the lifetime of the engine; `start`
    /// takes a second one per started period.
    pub fn new(
        settings: Arc<SettingsService>,
        store: Arc<Store>,
        translog: Arc<Translog>,
        merges: Arc<MergeScheduler>,
    ) -> Result<Engine> {
        let holder_ref = store.try_inc_ref()?;
        let concurrency = settings.current().index_concurrency;
        Ok(Engine {
            inner: Arc::new(EngineInner {
                settings,
                store,
                translog,
                merges,
                versions: VersionMap::with_concurrency(concurrency),
                state: RwLock::new(Lifecycle::New),
                holder_ref: Mutex::new(Some(holder_ref)),
                flush_lock: Mutex::new(()),
                recovering: AtomicBool::new(false),
                gc_deletes_enabled: AtomicBool::new(true),
            }),
        })
    }

    // ========== lifecycle ==========

    /// Start serving. Opens the index over the store; a failure surfaces as
    /// [`EngineError::CreationFailure`] and, when it wraps corruption and
    /// fail-on-corruption is set, fails the engine permanently.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        match &*state {
            Lifecycle::New => {}
            Lifecycle::Started(_) => return Err(EngineError::AlreadyStarted),
            Lifecycle::Failed | Lifecycle::Closed => return Err(EngineError::EngineClosed),
        }

        let settings = self.inner.settings.current();
        let start_ref = match self.inner.store.try_inc_ref() {
            Ok(r) => r,
            Err(e) => {
                return Err(EngineError::CreationFailure {
                    source: Box::new(e),
                })
            }
        };
        match IndexWriter::open(self.inner.store.clone()) {
            Ok(writer) => {
                *state = Lifecycle::Started(Arc::new(EngineCore {
                    writer: Arc::new(writer),
                    _start_ref: start_ref,
                }));
                info!(store = %self.inner.store.path().display(), "engine started");
                Ok(())
            }
            Err(err) => {
                drop(start_ref);
                let failure = EngineError::CreationFailure {
                    source: Box::new(err),
                };
                if failure.is_corruption() && settings.fail_on_corruption {
                    error!(error = %failure, "corrupt index on start, failing engine");
                    *state = Lifecycle::Failed;
                    *self.inner.holder_ref.lock() = None;
                }
                Err(failure)
            }
        }
    }

    /// Stop serving; the engine may be started again. Blocks until
    /// operations in flight have drained.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        match &*state {
            Lifecycle::Started(_) => {
                *state = Lifecycle::New;
                info!("engine stopped");
                Ok(())
            }
            Lifecycle::New => Ok(()),
            Lifecycle::Failed | Lifecycle::Closed => Err(EngineError::EngineClosed),
        }
    }

    /// Terminal close: releases the engine's store references. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        if matches!(&*state, Lifecycle::Closed) {
            return Ok(());
        }
        *state = Lifecycle::Closed;
        *self.inner.holder_ref.lock() = None;
        info!("engine closed");
        Ok(())
    }

    /// Fail the engine: terminal, every subsequent entry point raises
    /// [`EngineError::EngineClosed`], including `start`.
    pub fn fail(&self, reason: &str) {
        let mut state = self.inner.state.write();
        if matches!(&*state, Lifecycle::Closed | Lifecycle::Failed) {
            return;
        }
        error!(reason, "failing engine");
        *state = Lifecycle::Failed;
        *self.inner.holder_ref.lock() = None;
    }

    pub fn current_state(&self) -> EngineState {
        match &*self.inner.state.read() {
            Lifecycle::New => EngineState::New,
            Lifecycle::Started(_) => EngineState::Started,
            Lifecycle::Failed => EngineState::Failed,
            Lifecycle::Closed => EngineState::Closed,
        }
    }

    /// Toggle pruning of aged-out delete tombstones on refresh/flush. With
    /// GC disabled tombstones are retained indefinitely, keeping
    /// version-conflict detection exact.
    pub fn enable_gc_deletes(&self, enabled: bool) {
        self.inner.gc_deletes_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Writer-level configuration derived from the latest settings snapshot.
    pub fn writer_config(&self) -> WriterConfig {
        let s = self.inner.settings.current();
        WriterConfig {
            codec: s.codec.clone(),
            compound_on_flush: s.compound_on_flush,
            max_thread_states: s.index_concurrency,
        }
    }

    // ========== operations ==========

    pub fn create(&self, op: Create) -> Result<WriteOutcome> {
        let result = self.with_core(|core| self.apply_create(core, op));
        self.escalate_on_corruption(result)
    }

    pub fn index(&self, op: Index) -> Result<WriteOutcome> {
        let result = self.with_core(|core| self.apply_index(core, op));
        self.escalate_on_corruption(result)
    }

    pub fn delete(&self, op: Delete) -> Result<DeleteOutcome> {
        let result = self.with_core(|core| self.apply_delete(core, op));
        self.escalate_on_corruption(result)
    }

    /// Point lookup. Realtime gets consult the version map and may serve
    /// unflushed writes from the translog; non-realtime gets only observe
    /// the latest refreshed reader.
    pub fn get(&self, get: Get) -> Result<GetResult> {
        let result = self.with_core(|core| {
            if get.realtime {
                if let Some(value) = self.inner.versions.peek(&get.uid) {
                    if value.deleted {
                        return Ok(GetResult::not_found());
                    }
                    let entry = self.inner.translog.read(&value.location)?;
                    return Ok(GetResult::from_translog(
                        value.version,
                        entry.source().map(|s| s.to_vec()),
                    ));
                }
            }
            match core.writer.current_reader().get(&get.uid) {
                Some(doc) => Ok(GetResult::from_reader(doc.version, doc.source)),
                None => Ok(GetResult::not_found()),
            }
        });
        self.escalate_on_corruption(result)
    }

    /// Acquire a point-in-time searcher over the latest refreshed reader.
    pub fn acquire_searcher(&self, source: &str) -> Result<Searcher> {
        self.with_core(|core| {
            let store_ref = self.inner.store.try_inc_ref()?;
            Ok(Searcher {
                source: source.to_string(),
                snapshot: core.writer.current_reader(),
                _store_ref: store_ref,
            })
        })
    }

    // ========== visibility and durability ==========

    /// Make all writes accepted so far visible to new readers. No
    /// durability guarantee.
    pub fn refresh(&self, source: &str, force: bool) -> Result<()> {
        self.with_core(|core| {
            let settings = self.inner.settings.current();
            core.writer.refresh(settings.compound_on_flush, force);
            self.maybe_prune_tombstones(&settings);
            debug!(source, force, "refreshed");
            Ok(())
        })
    }

    /// Commit a durable checkpoint and advance the translog accordingly.
    /// Refused while a recovery is in progress.
    pub fn flush(&self, flush_type: FlushType, force: bool, wait_if_ongoing: bool) -> Result<()> {
        let result = self.with_core(|core| self.do_flush(core, flush_type, force, wait_if_ongoing));
        self.escalate_on_corruption(result)
    }

    /// Ask the merge scheduler to consolidate the current segment set,
    /// optionally waiting for in-flight merges and flushing afterwards.
    pub fn force_merge(&self, flush_after: bool, wait_for_merges: bool) -> Result<()> {
        self.with_core(|core| {
            if let Some(merge) = core.writer.begin_merge() {
                info!(id = merge.id, segments = merge.generations.len(), "merge requested");
                let writer = core.writer.clone();
                let engine = self.clone();
                let compound = self.inner.settings.current().compound_on_flush;
                let job_merge = merge.clone();
                let fail_merge = merge.clone();
                let fail_writer = core.writer.clone();
                self.inner.merges.submit(
                    merge,
                    move || writer.execute_merge(&job_merge, compound),
                    move |err| {
                        fail_writer.abort_merge(&fail_merge);
                        let settings = engine.inner.settings.current();
                        if settings.fail_on_merge_failure {
                            engine.fail(&format!("merge failed: {}", err));
                        } else {
                            warn!(error = %err, "merge failed");
                        }
                    },
                );
            }
            Ok(())
        })?;
        if wait_for_merges {
            self.inner.merges.wait_for_merges();
        }
        if flush_after {
            self.flush(FlushType::CommitTranslog, true, true)?;
        }
        Ok(())
    }

    // ========== recovery ==========

    /// Drive the three-phase recovery protocol. Runs synchronously on the
    /// calling thread; flush is refused for the duration. A handler error
    /// aborts the recovery without failing the engine unless it carries a
    /// corruption cause and fail-on-corruption is set.
    pub fn recover(&self, handler: &mut dyn RecoveryHandler) -> Result<()> {
        let result = self.with_core(|core| {
            if self.inner.recovering.swap(true, Ordering::SeqCst) {
                return Err(EngineError::RecoveryInProgress);
            }
            let _recovering = RecoveringGuard(&self.inner.recovering);
            info!("recovery started");

            let commit = core.writer.acquire_commit_snapshot()?;
            handler
                .phase1(&commit)
                .map_err(|e| EngineError::RecoveryFailure {
                    phase: 1,
                    source: Box::new(e),
                })?;

            let mut phase2 = self.inner.translog.snapshot();
            let cutoff = phase2.cutoff();
            handler
                .phase2(&mut phase2)
                .map_err(|e| EngineError::RecoveryFailure {
                    phase: 2,
                    source: Box::new(e),
                })?;

            let mut phase3 = self.inner.translog.snapshot_from(cutoff);
            handler
                .phase3(&mut phase3)
                .map_err(|e| EngineError::RecoveryFailure {
                    phase: 3,
                    source: Box::new(e),
                })?;

            info!(commit_generation = commit.generation(), "recovery finished");
            Ok(())
        });
        self.escalate_on_corruption(result)
    }

    // ========== introspection ==========

    pub fn segments(&self, verbose: bool) -> Result<Vec<Segment>> {
        self.with_core(|core| Ok(core.writer.segments(verbose)))
    }

    pub fn segments_stats(&self) -> Result<SegmentsStats> {
        self.with_core(|core| Ok(core.writer.stats()))
    }

    // ========== internals ==========

    fn with_core<T>(&self, f: impl FnOnce(&EngineCore) -> Result<T>) -> Result<T> {
        // recursive read permit: recovery handlers may legally re-enter
        // (e.g. a flush attempt from a recovery phase on the same thread)
        let guard = self.inner.state.read_recursive();
        match &*guard {
            Lifecycle::Started(core) => f(core),
            _ => Err(EngineError::EngineClosed),
        }
    }

    fn escalate_on_corruption<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_corruption() && self.inner.settings.current().fail_on_corruption {
                self.fail(&format!("corruption detected: {}", err));
            }
        }
        result
    }

    fn apply_create(&self, core: &EngineCore, op: Create) -> Result<WriteOutcome> {
        let uid = op.doc.uid.clone();
        let mut shard = self.inner.versions.lock(&uid);
        let current = Self::current_version(&shard, core, &uid);
        let current_version = current.map(|(v, _)| v);

        // the version check runs first: an explicit stale or future version
        // is a conflict even when the document is live
        Self::check_version(op.origin, op.version_type, current_version, op.version)?;
        if op.origin.is_primary() {
            if let Some((_, false)) = current {
                return Err(EngineError::DocumentAlreadyExists { uid });
            }
        }

        let version = Self::assign_version(op.origin, op.version_type, current_version, op.version);
        core.writer.put(
            &uid,
            StoredDoc {
                version,
                source: op.doc.source.clone(),
            },
        );
        let location = self
            .inner
            .translog
            .append(&TranslogEntry::Create { doc: op.doc, version })?;
        shard.insert(uid, VersionValue::write(version, location));
        Ok(WriteOutcome {
            version,
            created: true,
        })
    }

    fn apply_index(&self, core: &EngineCore, op: Index) -> Result<WriteOutcome> {
        let uid = op.doc.uid.clone();
        let mut shard = self.inner.versions.lock(&uid);
        let current = Self::current_version(&shard, core, &uid);
        let current_version = current.map(|(v, _)| v);

        Self::check_version(op.origin, op.version_type, current_version, op.version)?;
        let version = Self::assign_version(op.origin, op.version_type, current_version, op.version);
        let created = current.map_or(true, |(_, deleted)| deleted);

        core.writer.put(
            &uid,
            StoredDoc {
                version,
                source: op.doc.source.clone(),
            },
        );
        let location = self
            .inner
            .translog
            .append(&TranslogEntry::Index { doc: op.doc, version })?;
        shard.insert(uid, VersionValue::write(version, location));
        Ok(WriteOutcome { version, created })
    }

    fn apply_delete(&self, core: &EngineCore, op: Delete) -> Result<DeleteOutcome> {
        let uid = op.uid.clone();
        let mut shard = self.inner.versions.lock(&uid);
        let current = Self::current_version(&shard, core, &uid);
        let current_version = current.map(|(v, _)| v);

        Self::check_version(op.origin, op.version_type, current_version, op.version)?;
        let version = Self::assign_version(op.origin, op.version_type, current_version, op.version);
        let found = matches!(current, Some((_, false)));

        core.writer.delete(&uid);
        let location = self.inner.translog.append(&TranslogEntry::Delete {
            uid: op.uid,
            version,
        })?;
        shard.insert(uid, VersionValue::tombstone(version, location));
        Ok(DeleteOutcome { version, found })
    }

    /// Current version and tombstone state for a key: the version map wins;
    /// flushed-away keys fall back to the committed reader.
    fn current_version(
        shard: &AHashMap<String, VersionValue>,
        core: &EngineCore,
        uid: &str,
    ) -> Option<(u64, bool)> {
        if let Some(v) = shard.get(uid) {
            return Some((v.version, v.deleted));
        }
        core.writer
            .current_reader()
            .get(uid)
            .map(|doc| (doc.version, false))
    }

    fn check_version(
        origin: Origin,
        version_type: VersionType,
        current: Option<u64>,
        requested: u64,
    ) -> Result<()> {
        match origin {
            Origin::Primary => {
                if version_type.validate(current, requested) {
                    Ok(())
                } else {
                    Err(EngineError::VersionConflict { current, requested })
                }
            }
            // replayed writes carry a pre-assigned version; only
            // monotonicity is checked so duplicate replay is rejected
            Origin::Replica | Origin::Recovery => match current {
                Some(v) if v >= requested => Err(EngineError::VersionConflict {
                    current: Some(v),
                    requested,
                }),
                _ => Ok(()),
            },
        }
    }

    fn assign_version(
        origin: Origin,
        version_type: VersionType,
        current: Option<u64>,
        requested: u64,
    ) -> u64 {
        match origin {
            Origin::Primary => version_type.next_version(current, requested),
            Origin::Replica | Origin::Recovery => requested,
        }
    }

    fn do_flush(
        &self,
        core: &EngineCore,
        flush_type: FlushType,
        force: bool,
        wait_if_ongoing: bool,
    ) -> Result<()> {
        if self.inner.recovering.load(Ordering::SeqCst) {
            return Err(EngineError::FlushNotAllowed(
                "recovery is running".to_string(),
            ));
        }
        let _flush_guard = if wait_if_ongoing {
            self.inner.flush_lock.lock()
        } else {
            match self.inner.flush_lock.try_lock() {
                Some(guard) => guard,
                None => {
                    return Err(EngineError::FlushNotAllowed(
                        "another flush is already running".to_string(),
                    ))
                }
            }
        };
        if self.inner.recovering.load(Ordering::SeqCst) {
            return Err(EngineError::FlushNotAllowed(
                "recovery is running".to_string(),
            ));
        }

        let settings = self.inner.settings.current();
        let checkpoint_seq = self.inner.translog.current_seq();

        // seal pending writes so the commit covers everything accepted so far
        core.writer.refresh(settings.compound_on_flush, true);
        if core.writer.has_uncommitted_changes() || force {
            let generation = core.writer.commit()?;
            debug!(generation, "index committed");
        }
        self.inner.translog.commit_up_to(checkpoint_seq)?;
        self.inner.versions.clear_flushed(checkpoint_seq);
        if flush_type == FlushType::NewWriter {
            debug!("writer configuration rebuilt from current settings");
        }
        self.maybe_prune_tombstones(&settings);
        Ok(())
    }

    fn maybe_prune_tombstones(&self, settings: &EngineSettings) {
        if self.inner.gc_deletes_enabled.load(Ordering::SeqCst) {
            let pruned = self.inner.versions.prune_tombstones(settings.gc_deletes);
            if pruned > 0 {
                debug!(pruned, "pruned delete tombstones");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
