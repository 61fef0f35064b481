//! Embedded segment index
//!
//! The narrow indexing contract the engine drives: add/update/delete by
//! key, seal the live buffer into immutable segments on refresh, publish
//! point-in-time readers, commit a durable manifest, and merge segments.
//!
//! Layout under the store directory:
//! ```text
//! store_dir/
//! ├── segments/
//! │   ├── 000001.seg     # bincode segment payload, crc framed
//! │   ├── 000002.seg
//! │   └── ...
//! ├── commit-000001.mf   # commit manifest, crc framed
//! └── write.lock
//! ```
//!
//! Older commit manifests are kept alive while a recovery holds a
//! [`SnapshotIndexCommit`] over them and deleted once released.

pub mod segment;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::merge::OngoingMerge;
use crate::store::Store;
use crate::{EngineError, Result};
use segment::{Segment, SegmentsStats};

/// Segment payload magic bytes
const SEGMENT_MAGIC: &[u8; 4] = b"STSG";
/// Commit manifest magic bytes
const MANIFEST_MAGIC: &[u8; 4] = b"STMF";
/// Segment payload directory
const SEGMENTS_DIR: &str = "segments";

// ============================================================================
// Documents and segment payloads
// ============================================================================

/// A document as stored in the index: assigned version plus source bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub version: u64,
    pub source: Option<Vec<u8>>,
}

/// Immutable sealed segment payload.
#[derive(Debug, Serialize, Deserialize)]
struct SegmentCore {
    generation: u64,
    compound: bool,
    docs: HashMap<String, StoredDoc>,
}

impl SegmentCore {
    fn size_estimate(&self) -> u64 {
        self.docs
            .iter()
            .map(|(uid, doc)| {
                uid.len() as u64 + doc.source.as_ref().map_or(0, |s| s.len() as u64) + 32
            })
            .sum()
    }
}

/// Writer-side state for one segment: the immutable payload plus the
/// mutable deletion set and bookkeeping flags.
struct SegmentState {
    core: Arc<SegmentCore>,
    deleted: AHashSet<String>,
    committed: bool,
    persisted: bool,
    merge_id: Option<u64>,
}

impl SegmentState {
    fn num_docs(&self) -> usize {
        self.core.docs.len() - self.deleted.len()
    }
}

enum PendingOp {
    Put(StoredDoc),
    Delete,
}

// ============================================================================
// Point-in-time reader
// ============================================================================

struct SegmentView {
    core: Arc<SegmentCore>,
    deleted: Arc<AHashSet<String>>,
}

/// An immutable snapshot of the segment set. Open snapshots keep their
/// segments alive across later deletes and merges.
pub struct ReaderSnapshot {
    views: Vec<SegmentView>,
}

impl ReaderSnapshot {
    fn empty() -> Self {
        Self { views: Vec::new() }
    }

    /// Look up a document by key, newest segment first.
    pub fn get(&self, uid: &str) -> Option<StoredDoc> {
        for view in self.views.iter().rev() {
            if let Some(doc) = view.core.docs.get(uid) {
                if view.deleted.contains(uid) {
                    return None;
                }
                return Some(doc.clone());
            }
        }
        None
    }

    /// Number of live documents visible to this snapshot.
    pub fn doc_count(&self) -> usize {
        self.views
            .iter()
            .map(|v| v.core.docs.len() - v.deleted.len())
            .sum()
    }

    fn generations(&self) -> AHashSet<u64> {
        self.views.iter().map(|v| v.core.generation).collect()
    }
}

// ============================================================================
// Commit manifest
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Manifest {
    generation: u64,
    next_segment_generation: u64,
    segments: Vec<ManifestSegment>,
}

#[derive(Serialize, Deserialize)]
struct ManifestSegment {
    generation: u64,
    compound: bool,
    deleted: Vec<String>,
}

struct CommitPoint {
    generation: u64,
    manifest: PathBuf,
    segment_files: Vec<PathBuf>,
    refs: usize,
}

/// A ref-counted hold on one durable commit: the manifest plus the segment
/// files it references cannot be deleted by concurrent flushes or merges
/// until this guard is dropped.
pub struct SnapshotIndexCommit {
    generation: u64,
    files: Vec<PathBuf>,
    writer: Arc<IndexWriter>,
}

impl SnapshotIndexCommit {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Drop for SnapshotIndexCommit {
    fn drop(&mut self) {
        self.writer.release_commit(self.generation);
    }
}

// ============================================================================
// Writer
// ============================================================================

struct WriterState {
    segments: Vec<SegmentState>,
    pending: HashMap<String, PendingOp>,
    next_segment_generation: u64,
    commit_generation: u64,
    commits: Vec<CommitPoint>,
    dirty: bool,
}

/// The live writer over the segment set.
pub struct IndexWriter {
    store: Arc<Store>,
    state: Mutex<WriterState>,
    reader: RwLock<Arc<ReaderSnapshot>>,
    next_merge_id: AtomicU64,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter").finish_non_exhaustive()
    }
}

impl IndexWriter {
    /// Open the index in the store directory, loading the last commit if
    /// one exists; otherwise an initial empty commit is written so a
    /// commit point always exists.
    pub fn open(store: Arc<Store>) -> Result<Self> {
        let seg_dir = store.path().join(SEGMENTS_DIR);
        fs::create_dir_all(&seg_dir)?;

        let mut segments = Vec::new();
        let mut commits = Vec::new();
        let mut commit_generation = 0;
        let mut next_segment_generation = 1;

        if let Some((generation, manifest_path)) = Self::latest_manifest(store.path())? {
            let manifest = Self::read_manifest(&manifest_path)?;
            let mut segment_files = Vec::new();
            for entry in &manifest.segments {
                let path = Self::segment_path(&seg_dir, entry.generation);
                let core = Self::read_segment_file(&path)?;
                segments.push(SegmentState {
                    core: Arc::new(core),
                    deleted: entry.deleted.iter().cloned().collect(),
                    committed: true,
                    persisted: true,
                    merge_id: None,
                });
                segment_files.push(path);
            }
            commit_generation = generation;
            next_segment_generation = manifest.next_segment_generation;
            commits.push(CommitPoint {
                generation,
                manifest: manifest_path,
                segment_files,
                refs: 0,
            });
        }

        let writer = Self {
            store,
            state: Mutex::new(WriterState {
                segments,
                pending: HashMap::new(),
                next_segment_generation,
                commit_generation,
                commits,
                dirty: false,
            }),
            reader: RwLock::new(Arc::new(ReaderSnapshot::empty())),
            next_merge_id: AtomicU64::new(0),
        };

        if writer.state.lock().commits.is_empty() {
            writer.commit()?;
        }

        let snapshot = Self::publish(&writer.state.lock());
        *writer.reader.write() = snapshot;
        Ok(writer)
    }

    /// Buffer an add-or-replace for the next refresh.
    pub fn put(&self, uid: &str, doc: StoredDoc) {
        self.state
            .lock()
            .pending
            .insert(uid.to_string(), PendingOp::Put(doc));
    }

    /// Buffer a delete-by-key for the next refresh.
    pub fn delete(&self, uid: &str) {
        self.state
            .lock()
            .pending
            .insert(uid.to_string(), PendingOp::Delete);
    }

    /// Seal the pending buffer into a new segment (if it holds any adds),
    /// apply deletions to older segments, and publish a new point-in-time
    /// reader. With nothing pending and `force` unset this is a no-op.
    pub fn refresh(&self, compound: bool, force: bool) -> Arc<ReaderSnapshot> {
        let mut st = self.state.lock();
        if st.pending.is_empty() && !force {
            return self.reader.read().clone();
        }

        if !st.pending.is_empty() {
            let pending = std::mem::take(&mut st.pending);
            let mut adds: HashMap<String, StoredDoc> = HashMap::new();
            for (uid, op) in pending {
                for seg in st.segments.iter_mut() {
                    if seg.core.docs.contains_key(&uid) {
                        seg.deleted.insert(uid.clone());
                    }
                }
                if let PendingOp::Put(doc) = op {
                    adds.insert(uid, doc);
                }
            }
            if !adds.is_empty() {
                let generation = st.next_segment_generation;
                st.next_segment_generation += 1;
                st.segments.push(SegmentState {
                    core: Arc::new(SegmentCore {
                        generation,
                        compound,
                        docs: adds,
                    }),
                    deleted: AHashSet::new(),
                    committed: false,
                    persisted: false,
                    merge_id: None,
                });
            }
            st.dirty = true;
        }

        let snapshot = Self::publish(&st);
        *self.reader.write() = snapshot.clone();
        snapshot
    }

    /// The currently published point-in-time reader.
    pub fn current_reader(&self) -> Arc<ReaderSnapshot> {
        self.reader.read().clone()
    }

    /// Whether the segment set changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let st = self.state.lock();
        st.dirty || !st.pending.is_empty()
    }

    /// Durably commit the current segment set: persist unsealed segment
    /// payloads, write a new manifest generation and fsync it. Returns the
    /// new commit generation.
    pub fn commit(&self) -> Result<u64> {
        let mut st = self.state.lock();
        let seg_dir = self.store.path().join(SEGMENTS_DIR);

        for seg in st.segments.iter_mut() {
            if !seg.persisted {
                let path = Self::segment_path(&seg_dir, seg.core.generation);
                let payload = bincode::serialize(&*seg.core)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?;
                Self::write_framed(&path, SEGMENT_MAGIC, &payload)?;
                seg.persisted = true;
            }
        }

        let generation = st.commit_generation + 1;
        let manifest = Manifest {
            generation,
            next_segment_generation: st.next_segment_generation,
            segments: st
                .segments
                .iter()
                .map(|s| ManifestSegment {
                    generation: s.core.generation,
                    compound: s.core.compound,
                    deleted: s.deleted.iter().cloned().collect(),
                })
                .collect(),
        };
        let payload = bincode::serialize(&manifest)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let manifest_path = Self::manifest_path(self.store.path(), generation);
        Self::write_framed(&manifest_path, MANIFEST_MAGIC, &payload)?;

        for seg in st.segments.iter_mut() {
            seg.committed = true;
        }
        let segment_files = st
            .segments
            .iter()
            .map(|s| Self::segment_path(&seg_dir, s.core.generation))
            .collect();
        st.commit_generation = generation;
        st.commits.push(CommitPoint {
            generation,
            manifest: manifest_path,
            segment_files,
            refs: 0,
        });
        st.dirty = false;
        Self::purge_commits(&mut st, self.store.path());
        Ok(generation)
    }

    /// Take a ref-counted hold on the latest commit point.
    pub fn acquire_commit_snapshot(self: &Arc<Self>) -> Result<SnapshotIndexCommit> {
        let mut st = self.state.lock();
        let point = st
            .commits
            .iter_mut()
            .max_by_key(|c| c.generation)
            .ok_or_else(|| EngineError::Corruption("index has no commit point".to_string()))?;
        point.refs += 1;
        let mut files = vec![point.manifest.clone()];
        files.extend(point.segment_files.iter().cloned());
        Ok(SnapshotIndexCommit {
            generation: point.generation,
            files,
            writer: self.clone(),
        })
    }

    fn release_commit(&self, generation: u64) {
        let mut st = self.state.lock();
        if let Some(point) = st.commits.iter_mut().find(|c| c.generation == generation) {
            point.refs = point.refs.saturating_sub(1);
        }
        Self::purge_commits(&mut st, self.store.path());
    }

    /// Segment metadata, verbose listings include a memory breakdown.
    pub fn segments(&self, verbose: bool) -> Vec<Segment> {
        let st = self.state.lock();
        let search_generations = self.reader.read().generations();
        st.segments
            .iter()
            .map(|s| Segment {
                generation: s.core.generation,
                num_docs: s.num_docs(),
                deleted_docs: s.deleted.len(),
                committed: s.committed,
                search: search_generations.contains(&s.core.generation),
                compound: s.core.compound,
                size_in_bytes: s.core.size_estimate(),
                merge_id: s.merge_id,
                ram_breakdown: verbose.then(|| Self::ram_breakdown(s)),
            })
            .collect()
    }

    pub fn stats(&self) -> SegmentsStats {
        let st = self.state.lock();
        SegmentsStats {
            count: st.segments.len() as u64,
            memory_in_bytes: st.segments.iter().map(|s| s.core.size_estimate()).sum(),
        }
    }

    /// Tag the current segment set for merging. Returns `None` when there
    /// is nothing worth merging (fewer than two segments and no deletes).
    pub fn begin_merge(&self) -> Option<OngoingMerge> {
        let mut st = self.state.lock();
        if st.segments.is_empty() {
            return None;
        }
        if st.segments.len() < 2 && st.segments.iter().all(|s| s.deleted.is_empty()) {
            return None;
        }
        let id = self.next_merge_id.fetch_add(1, Ordering::SeqCst) + 1;
        for seg in st.segments.iter_mut() {
            seg.merge_id = Some(id);
        }
        let generations = st.segments.iter().map(|s| s.core.generation).collect();
        let total_docs = st.segments.iter().map(|s| s.num_docs()).sum();
        Some(OngoingMerge {
            id,
            generations,
            total_docs,
        })
    }

    /// Combine the tagged segments into one new segment, dropping deleted
    /// documents. Segments sealed after the merge began are untouched.
    pub fn execute_merge(&self, merge: &OngoingMerge, compound: bool) -> Result<()> {
        let mut st = self.state.lock();

        let mut docs: HashMap<String, StoredDoc> = HashMap::new();
        for seg in st.segments.iter().filter(|s| s.merge_id == Some(merge.id)) {
            for (uid, doc) in seg.core.docs.iter() {
                if !seg.deleted.contains(uid) {
                    docs.insert(uid.clone(), doc.clone());
                }
            }
        }

        let generation = st.next_segment_generation;
        st.next_segment_generation += 1;
        st.segments.retain(|s| s.merge_id != Some(merge.id));
        st.segments.push(SegmentState {
            core: Arc::new(SegmentCore {
                generation,
                compound,
                docs,
            }),
            deleted: AHashSet::new(),
            committed: false,
            persisted: false,
            merge_id: None,
        });
        st.dirty = true;
        Ok(())
    }

    /// Clear merge tags after a failed merge.
    pub fn abort_merge(&self, merge: &OngoingMerge) {
        let mut st = self.state.lock();
        for seg in st.segments.iter_mut() {
            if seg.merge_id == Some(merge.id) {
                seg.merge_id = None;
            }
        }
    }

    // ========== internal plumbing ==========

    fn publish(st: &WriterState) -> Arc<ReaderSnapshot> {
        Arc::new(ReaderSnapshot {
            views: st
                .segments
                .iter()
                .map(|s| SegmentView {
                    core: s.core.clone(),
                    deleted: Arc::new(s.deleted.clone()),
                })
                .collect(),
        })
    }

    fn ram_breakdown(seg: &SegmentState) -> HashMap<String, u64> {
        let keys: u64 = seg.core.docs.keys().map(|k| k.len() as u64).sum();
        let sources: u64 = seg
            .core
            .docs
            .values()
            .map(|d| d.source.as_ref().map_or(0, |s| s.len() as u64))
            .sum();
        let mut breakdown = HashMap::new();
        breakdown.insert("keys".to_string(), keys);
        breakdown.insert("sources".to_string(), sources);
        breakdown.insert("versions".to_string(), seg.core.docs.len() as u64 * 8);
        breakdown
    }

    /// Drop commit points that are neither latest nor referenced, delete
    /// their manifests and garbage-collect orphaned segment files.
    fn purge_commits(st: &mut WriterState, store_path: &Path) {
        let latest = st.commits.iter().map(|c| c.generation).max().unwrap_or(0);
        let mut dropped = Vec::new();
        st.commits.retain(|c| {
            if c.generation == latest || c.refs > 0 {
                true
            } else {
                dropped.push(c.manifest.clone());
                false
            }
        });
        for manifest in dropped {
            let _ = fs::remove_file(manifest);
        }

        let mut needed: AHashSet<PathBuf> = st
            .commits
            .iter()
            .flat_map(|c| c.segment_files.iter().cloned())
            .collect();
        let seg_dir = store_path.join(SEGMENTS_DIR);
        for seg in st.segments.iter() {
            needed.insert(Self::segment_path(&seg_dir, seg.core.generation));
        }
        if let Ok(entries) = fs::read_dir(&seg_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(false, |e| e == "seg") && !needed.contains(&path) {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }

    fn segment_path(seg_dir: &Path, generation: u64) -> PathBuf {
        seg_dir.join(format!("{:06}.seg", generation))
    }

    fn manifest_path(store_path: &Path, generation: u64) -> PathBuf {
        store_path.join(format!("commit-{:06}.mf", generation))
    }

    fn latest_manifest(store_path: &Path) -> Result<Option<(u64, PathBuf)>> {
        let mut latest: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(store_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(generation) = name
                .strip_prefix("commit-")
                .and_then(|n| n.strip_suffix(".mf"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if latest.as_ref().map_or(true, |(g, _)| generation > *g) {
                latest = Some((generation, path));
            }
        }
        Ok(latest)
    }

    fn read_manifest(path: &Path) -> Result<Manifest> {
        let payload = Self::read_framed(path, MANIFEST_MAGIC)?;
        bincode::deserialize(&payload)
            .map_err(|e| EngineError::Corruption(format!("unreadable commit manifest: {}", e)))
    }

    fn read_segment_file(path: &Path) -> Result<SegmentCore> {
        let payload = Self::read_framed(path, SEGMENT_MAGIC)?;
        bincode::deserialize(&payload)
            .map_err(|e| EngineError::Corruption(format!("unreadable segment payload: {}", e)))
    }

    fn write_framed(path: &Path, magic: &[u8; 4], payload: &[u8]) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        file.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_framed(path: &Path, magic: &[u8; 4]) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        if data.len() < 12 || &data[0..4] != magic {
            return Err(EngineError::Corruption(format!(
                "bad file magic: {}",
                path.display()
            )));
        }
        let len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if data.len() != 8 + len + 4 {
            return Err(EngineError::Corruption(format!(
                "truncated file: {}",
                path.display()
            )));
        }
        let payload = &data[8..8 + len];
        let stored = u32::from_le_bytes(data[8 + len..].try_into().unwrap());
        if crc32fast::hash(payload) != stored {
            return Err(EngineError::Corruption(format!(
                "checksum mismatch: {}",
                path.display()
            )));
        }
        Ok(payload.to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc(version: u64, source: &str) -> StoredDoc {
        StoredDoc {
            version,
            source: Some(source.as_bytes().to_vec()),
        }
    }

    fn open_writer(path: &Path) -> (Arc<Store>, Arc<IndexWriter>) {
        let store = Store::open(path).unwrap();
        let writer = Arc::new(IndexWriter::open(store.clone()).unwrap());
        (store, writer)
    }

    #[test]
    fn test_refresh_seals_and_publishes() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.put("2", doc(1, "b"));

        // not visible until refresh
        assert_eq!(writer.current_reader().doc_count(), 0);

        let reader = writer.refresh(true, false);
        assert_eq!(reader.doc_count(), 2);
        assert_eq!(reader.get("1").unwrap().version, 1);

        let segments = writer.segments(false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].num_docs, 2);
        assert_eq!(segments[0].deleted_docs, 0);
        assert!(segments[0].compound);
        assert!(!segments[0].committed);
        assert!(segments[0].search);
    }

    #[test]
    fn test_update_marks_old_copy_deleted() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.refresh(true, false);
        writer.put("1", doc(2, "a2"));
        let reader = writer.refresh(true, false);

        assert_eq!(reader.doc_count(), 1);
        assert_eq!(reader.get("1").unwrap().version, 2);

        let segments = writer.segments(false);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].num_docs, 0);
        assert_eq!(segments[0].deleted_docs, 1);
        assert_eq!(segments[1].num_docs, 1);
    }

    #[test]
    fn test_delete_only_refresh_adds_no_segment() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.refresh(true, false);
        writer.delete("1");
        let reader = writer.refresh(true, false);

        assert_eq!(reader.doc_count(), 0);
        assert!(reader.get("1").is_none());
        let segments = writer.segments(false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].num_docs, 0);
        assert_eq!(segments[0].deleted_docs, 1);
    }

    #[test]
    fn test_open_reader_survives_later_deletes() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        let old = writer.refresh(true, false);
        assert_eq!(old.doc_count(), 1);

        writer.delete("1");
        let new = writer.refresh(true, false);

        assert_eq!(new.doc_count(), 0);
        assert_eq!(old.doc_count(), 1);
        assert!(old.get("1").is_some());
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let (store, writer) = open_writer(dir.path());
            writer.put("1", doc(1, "a"));
            writer.put("2", doc(1, "b"));
            writer.refresh(false, false);
            writer.delete("2");
            writer.refresh(false, false);
            writer.commit().unwrap();
            drop(writer);
            store.close().unwrap();
        }

        let (_store, writer) = open_writer(dir.path());
        let segments = writer.segments(false);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].committed);
        assert_eq!(segments[0].num_docs, 1);
        assert_eq!(segments[0].deleted_docs, 1);
        assert_eq!(writer.current_reader().get("1").unwrap().version, 1);
        assert!(writer.current_reader().get("2").is_none());
    }

    #[test]
    fn test_commit_snapshot_protects_manifest() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.refresh(true, false);
        writer.commit().unwrap();

        let snapshot = writer.acquire_commit_snapshot().unwrap();
        let held_manifest = snapshot.files()[0].clone();
        assert!(held_manifest.exists());

        // two more commits; the held manifest must survive
        writer.put("2", doc(1, "b"));
        writer.refresh(true, false);
        writer.commit().unwrap();
        writer.put("3", doc(1, "c"));
        writer.refresh(true, false);
        writer.commit().unwrap();
        assert!(held_manifest.exists());

        drop(snapshot);
        assert!(!held_manifest.exists());
    }

    #[test]
    fn test_merge_combines_live_docs() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.refresh(true, false);
        writer.put("2", doc(1, "b"));
        writer.refresh(true, false);
        writer.delete("1");
        writer.refresh(true, false);

        let merge = writer.begin_merge().unwrap();
        assert_eq!(merge.generations.len(), 2);
        for seg in writer.segments(false) {
            assert_eq!(seg.merge_id, Some(merge.id));
        }

        writer.execute_merge(&merge, true).unwrap();
        let segments = writer.segments(false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].num_docs, 1);
        assert_eq!(segments[0].deleted_docs, 0);
        assert_eq!(segments[0].merge_id, None);

        // merged state is published on the next refresh
        let reader = writer.refresh(true, true);
        assert!(reader.get("1").is_none());
        assert_eq!(reader.get("2").unwrap().version, 1);
    }

    #[test]
    fn test_abort_merge_clears_tags() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "a"));
        writer.refresh(true, false);
        writer.put("2", doc(1, "b"));
        writer.refresh(true, false);

        let merge = writer.begin_merge().unwrap();
        writer.abort_merge(&merge);
        for seg in writer.segments(false) {
            assert_eq!(seg.merge_id, None);
        }
    }

    #[test]
    fn test_verbose_segments_carry_breakdown() {
        let dir = tempdir().unwrap();
        let (_store, writer) = open_writer(dir.path());

        writer.put("1", doc(1, "abc"));
        writer.refresh(true, false);

        let plain = writer.segments(false);
        assert!(plain[0].ram_breakdown.is_none());

        let verbose = writer.segments(true);
        let breakdown = verbose[0].ram_breakdown.as_ref().unwrap();
        assert_eq!(breakdown["sources"], 3);
        assert!(breakdown.contains_key("keys"));
    }

    #[test]
    fn test_corrupt_manifest_is_detected() {
        let dir = tempdir().unwrap();
        {
            let (store, writer) = open_writer(dir.path());
            writer.put("1", doc(1, "a"));
            writer.refresh(true, false);
            writer.commit().unwrap();
            drop(writer);
            store.close().unwrap();
        }

        // flip payload bytes in the newest manifest
        let manifest = IndexWriter::latest_manifest(dir.path()).unwrap().unwrap().1;
        let mut data = std::fs::read(&manifest).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        std::fs::write(&manifest, data).unwrap();

        let store = Store::open(dir.path()).unwrap();
        let err = IndexWriter::open(store.clone()).unwrap_err();
        assert!(err.is_corruption());
        store.close().unwrap();
    }
}
