//! Append-only operation log (translog)
//!
//! Every accepted write is appended here together with its assigned version
//! and replayed during recovery. The log offers three primitives:
//!
//! - `append(entry) -> Location`
//! - `snapshot() / snapshot_from(seq)`: a read-once, forward-only view over
//!   entries appended before a cutoff fixed at snapshot creation
//! - `commit_up_to(seq)`: durability checkpoint; everything at or below the
//!   sequence may be discarded
//!
//! File format:
//! ```text
//! translog-000001.log
//! +----------------+----------------+----------------+
//! | Header (32B)   | Record 1       | Record 2 ...   |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "STLG"
//! - version: 2 bytes
//! - generation: 8 bytes
//! - checksum: 4 bytes
//! - reserved: 14 bytes
//!
//! Record:
//! - payload_len: 4 bytes
//! - seq: 8 bytes
//! - payload: variable (bincode serialized entry)
//! - crc32: 4 bytes (over seq + payload)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ops::Doc;
use crate::{EngineError, Result};

/// Translog magic bytes
const TRANSLOG_MAGIC: &[u8; 4] = b"STLG";
/// Translog format version
const TRANSLOG_VERSION: u16 = 1;
/// Header size
const HEADER_SIZE: usize = 32;
/// Buffer size for appends
const WRITE_BUFFER_SIZE: usize = 64 * 1024;
/// Durability checkpoint file
const CHECKPOINT_FILE: &str = "checkpoint.bin";

// ============================================================================
// Entries and locations
// ============================================================================

/// A logged operation plus its assigned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranslogEntry {
    Create { doc: Doc, version: u64 },
    Index { doc: Doc, version: u64 },
    Delete { uid: String, version: u64 },
}

impl TranslogEntry {
    pub fn uid(&self) -> &str {
        match self {
            TranslogEntry::Create { doc, .. } | TranslogEntry::Index { doc, .. } => &doc.uid,
            TranslogEntry::Delete { uid, .. } => uid,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            TranslogEntry::Create { version, .. }
            | TranslogEntry::Index { version, .. }
            | TranslogEntry::Delete { version, .. } => *version,
        }
    }

    pub fn source(&self) -> Option<&[u8]> {
        match self {
            TranslogEntry::Create { doc, .. } | TranslogEntry::Index { doc, .. } => {
                doc.source.as_deref()
            }
            TranslogEntry::Delete { .. } => None,
        }
    }
}

/// Position of one record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub generation: u64,
    pub offset: u64,
    pub size: u32,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct RecordMeta {
    seq: u64,
    generation: u64,
    offset: u64,
    size: u32,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    committed_seq: u64,
}

// ============================================================================
// Translog
// ============================================================================

struct TranslogState {
    writer: BufWriter<File>,
    generation: u64,
    offset: u64,
    /// Uncommitted record positions, sequence-ascending.
    index: Vec<RecordMeta>,
}

/// Append-only, ordered log of accepted operations.
pub struct Translog {
    dir: PathBuf,
    state: Mutex<TranslogState>,
    next_seq: AtomicU64,
    committed_seq: AtomicU64,
}

impl Translog {
    /// Open the translog directory, replaying any uncommitted records left
    /// behind by a previous instance, and start a fresh generation for
    /// appends.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)?;

        let committed_seq = Self::read_checkpoint(dir)?;
        let mut index = Vec::new();
        let mut max_seq = committed_seq;
        let mut max_generation = 0u64;

        let mut files = Self::log_files(dir)?;
        files.sort();
        for path in files {
            let generation = Self::scan_file(&path, committed_seq, &mut index, &mut max_seq)?;
            max_generation = max_generation.max(generation);
        }

        let generation = max_generation + 1;
        let writer = Self::create_generation(dir, generation)?;

        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(TranslogState {
                writer,
                generation,
                offset: HEADER_SIZE as u64,
                index,
            }),
            next_seq: AtomicU64::new(max_seq + 1),
            committed_seq: AtomicU64::new(committed_seq),
        }))
    }

    /// Append an entry and return its location.
    pub fn append(&self, entry: &TranslogEntry) -> Result<Location> {
        let payload =
            bincode::serialize(entry).map_err(|e| EngineError::Serialization(e.to_string()))?;

        let mut st = self.state.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(&payload);
        let crc = hasher.finalize();

        let offset = st.offset;
        st.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        st.writer.write_all(&seq.to_le_bytes())?;
        st.writer.write_all(&payload)?;
        st.writer.write_all(&crc.to_le_bytes())?;
        st.writer.flush()?;

        let size = (4 + 8 + payload.len() + 4) as u32;
        st.offset += size as u64;

        let meta = RecordMeta {
            seq,
            generation: st.generation,
            offset,
            size,
        };
        st.index.push(meta);

        Ok(Location {
            generation: meta.generation,
            offset: meta.offset,
            size: meta.size,
            seq: meta.seq,
        })
    }

    /// Read back a single entry, verifying its checksum. Used for realtime
    /// gets of unflushed documents.
    pub fn read(&self, location: &Location) -> Result<TranslogEntry> {
        // make sure buffered appends are visible to the read handle
        self.state.lock().writer.flush()?;
        let (entry, _) = Self::read_record_at(&self.file_path(location.generation), location.offset)?;
        Ok(entry)
    }

    /// Highest assigned sequence number so far.
    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Sequence number up to which the log has been durably checkpointed.
    pub fn committed_seq(&self) -> u64 {
        self.committed_seq.load(Ordering::SeqCst)
    }

    /// Number of operations accepted since the last durability checkpoint.
    pub fn total_operations(&self) -> usize {
        (self.current_seq() - self.committed_seq()) as usize
    }

    /// Open a read-once snapshot over all uncommitted entries appended so
    /// far. Entries appended after this call are not included.
    pub fn snapshot(&self) -> TranslogSnapshot {
        self.snapshot_from(self.committed_seq())
    }

    /// Open a read-once snapshot over entries appended after `after_seq`
    /// and before this call.
    pub fn snapshot_from(&self, after_seq: u64) -> TranslogSnapshot {
        let mut st = self.state.lock();
        // records must be on disk before a snapshot reader touches them
        let _ = st.writer.flush();
        let cutoff = self.current_seq();
        let entries: Vec<RecordMeta> = st
            .index
            .iter()
            .filter(|m| m.seq > after_seq && m.seq <= cutoff)
            .copied()
            .collect();
        TranslogSnapshot {
            dir: self.dir.clone(),
            entries,
            pos: 0,
            cutoff,
        }
    }

    /// Move the durability checkpoint forward: everything at or below `seq`
    /// is dropped from the replay window and fully-committed generations
    /// are deleted from disk.
    pub fn commit_up_to(&self, seq: u64) -> Result<()> {
        let mut st = self.state.lock();

        st.writer.flush()?;
        st.writer.get_ref().sync_all()?;

        let committed = self.committed_seq.load(Ordering::SeqCst).max(seq);
        self.committed_seq.store(committed, Ordering::SeqCst);
        Self::write_checkpoint(&self.dir, committed)?;

        st.index.retain(|m| m.seq > committed);

        // rotate so committed generations can be removed
        let generation = st.generation + 1;
        st.writer = Self::create_generation(&self.dir, generation)?;
        st.generation = generation;
        st.offset = HEADER_SIZE as u64;

        let needed: Vec<u64> = st.index.iter().map(|m| m.generation).collect();
        for path in Self::log_files(&self.dir)? {
            if let Some(generation_of) = Self::parse_generation(&path) {
                if generation_of < generation && !needed.contains(&generation_of) {
                    let _ = fs::remove_file(path);
                }
            }
        }
        Ok(())
    }

    // ========== file plumbing ==========

    fn file_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("translog-{:06}.log", generation))
    }

    fn log_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if Self::parse_generation(&path).is_some() {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn parse_generation(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let gen = name.strip_prefix("translog-")?.strip_suffix(".log")?;
        gen.parse().ok()
    }

    fn create_generation(dir: &Path, generation: u64) -> Result<BufWriter<File>> {
        let path = dir.join(format!("translog-{:06}.log", generation));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(TRANSLOG_MAGIC);
        header[4..6].copy_from_slice(&TRANSLOG_VERSION.to_le_bytes());
        header[6..14].copy_from_slice(&generation.to_le_bytes());
        let checksum = crc32fast::hash(&header[0..14]);
        header[14..18].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;
        writer.flush()?;
        Ok(writer)
    }

    /// Scan one generation file, collecting uncommitted record positions.
    /// A torn tail (short read or bad checksum) ends the scan; everything
    /// before it is kept.
    fn scan_file(
        path: &Path,
        committed_seq: u64,
        index: &mut Vec<RecordMeta>,
        max_seq: &mut u64,
    ) -> Result<u64> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|_| {
            EngineError::Corruption(format!("translog header too short: {}", path.display()))
        })?;
        if &header[0..4] != TRANSLOG_MAGIC {
            return Err(EngineError::Corruption(format!(
                "bad translog magic: {}",
                path.display()
            )));
        }
        let generation = u64::from_le_bytes(header[6..14].try_into().unwrap());
        let stored = u32::from_le_bytes(header[14..18].try_into().unwrap());
        if crc32fast::hash(&header[0..14]) != stored {
            return Err(EngineError::Corruption(format!(
                "translog header checksum mismatch: {}",
                path.display()
            )));
        }

        let mut offset = HEADER_SIZE as u64;
        loop {
            match Self::read_record_at(path, offset) {
                Ok((_, raw)) => {
                    let (seq, size) = raw;
                    if seq > committed_seq {
                        index.push(RecordMeta {
                            seq,
                            generation,
                            offset,
                            size,
                        });
                    }
                    *max_seq = (*max_seq).max(seq);
                    offset += size as u64;
                }
                Err(_) => break,
            }
        }
        Ok(generation)
    }

    fn read_record_at(path: &Path, offset: u64) -> Result<(TranslogEntry, (u64, u32))> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut seq_buf = [0u8; 8];
        file.read_exact(&mut seq_buf)?;
        let seq = u64::from_le_bytes(seq_buf);

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf)?;
        let stored = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&seq_buf);
        hasher.update(&payload);
        if hasher.finalize() != stored {
            return Err(EngineError::Corruption(format!(
                "translog record checksum mismatch at {}:{}",
                path.display(),
                offset
            )));
        }

        let entry = bincode::deserialize(&payload)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let size = (4 + 8 + len + 4) as u32;
        Ok((entry, (seq, size)))
    }

    fn checkpoint_path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    fn read_checkpoint(dir: &Path) -> Result<u64> {
        let path = Self::checkpoint_path(dir);
        if !path.exists() {
            return Ok(0);
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        if data.len() < 8 {
            return Err(EngineError::Corruption("checkpoint too short".to_string()));
        }
        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != stored {
            return Err(EngineError::Corruption(
                "checkpoint checksum mismatch".to_string(),
            ));
        }
        let cp: Checkpoint =
            bincode::deserialize(payload).map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(cp.committed_seq)
    }

    fn write_checkpoint(dir: &Path, committed_seq: u64) -> Result<()> {
        let payload = bincode::serialize(&Checkpoint { committed_seq })
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&payload);
        let mut file = File::create(Self::checkpoint_path(dir))?;
        file.write_all(&payload)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A consistent, read-once, forward-only view over log entries appended
/// before a fixed cutoff. Exhaustion yields `None`; appends racing the
/// snapshot are never observed.
pub struct TranslogSnapshot {
    dir: PathBuf,
    entries: Vec<RecordMeta>,
    pos: usize,
    cutoff: u64,
}

impl TranslogSnapshot {
    /// Next entry, or `None` once the snapshot is exhausted.
    pub fn next(&mut self) -> Result<Option<TranslogEntry>> {
        let Some(meta) = self.entries.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let path = self.dir.join(format!("translog-{:06}.log", meta.generation));
        let (entry, _) = Translog::read_record_at(&path, meta.offset)?;
        Ok(Some(entry))
    }

    /// Number of entries this snapshot covers in total.
    pub fn total_operations(&self) -> usize {
        self.entries.len()
    }

    /// The sequence number cutoff this snapshot was taken at.
    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }
}

// ============================================================================
// Tests
// ============================================================================
