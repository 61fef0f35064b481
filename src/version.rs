//! Per-key version table
//!
//! Maps each document key to its current version, a tombstone marker and
//! the translog location of its most recent unflushed write. The table is
//! sharded: a fixed array of mutexed maps, shard picked by key hash. A
//! writer locks its key's shard for the whole version read-modify-write,
//! so version assignment is linearizable per key while writers to other
//! keys proceed in parallel with bounded contention.

use std::hash::BuildHasher;
use std::time::{Duration, Instant};

use ahash::{AHashMap, RandomState};
use parking_lot::{Mutex, MutexGuard};

use crate::translog::Location;

/// Per-key record: current version, tombstone state and write location.
#[derive(Debug, Clone)]
pub struct VersionValue {
    pub version: u64,
    /// True when the key's latest operation is a delete.
    pub deleted: bool,
    /// When the tombstone was created; drives the GC sweep.
    pub delete_time: Option<Instant>,
    /// Translog position of the most recent write.
    pub location: Location,
}

impl VersionValue {
    pub fn write(version: u64, location: Location) -> Self {
        Self {
            version,
            deleted: false,
            delete_time: None,
            location,
        }
    }

    pub fn tombstone(version: u64, location: Location) -> Self {
        Self {
            version,
            deleted: true,
            delete_time: Some(Instant::now()),
            location,
        }
    }
}

type Shard = AHashMap<String, VersionValue>;

/// Sharded key → [`VersionValue`] table.
pub struct VersionMap {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
}

impl VersionMap {
    /// Size the lock table from the writer concurrency bound. Shard count
    /// is rounded up to a power of two.
    pub fn with_concurrency(index_concurrency: usize) -> Self {
        let shards = (index_concurrency.max(1) * 8).next_power_of_two();
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, uid: &str) -> &Mutex<Shard> {
        let hash = self.hasher.hash_one(uid) as usize;
        &self.shards[hash & (self.shards.len() - 1)]
    }

    /// Lock the shard owning `uid`. The guard must be held across the whole
    /// version read-modify-write of a write operation.
    pub fn lock(&self, uid: &str) -> MutexGuard<'_, Shard> {
        self.shard_for(uid).lock()
    }

    /// Copy out the current value for `uid`, if any. Takes the shard lock
    /// briefly; suitable for reads that do not assign versions.
    pub fn peek(&self, uid: &str) -> Option<VersionValue> {
        self.shard_for(uid).lock().get(uid).cloned()
    }

    /// Drop every non-tombstone entry whose write is at or below the
    /// committed sequence. After a flush those documents live in committed
    /// segments and version lookups fall back to the reader.
    pub fn clear_flushed(&self, committed_seq: u64) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, v| v.deleted || v.location.seq > committed_seq);
            removed += before - map.len();
        }
        removed
    }

    /// Prune tombstones older than `max_age`.
    pub fn prune_tombstones(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, v| match (v.deleted, v.delete_time) {
                (true, Some(t)) => now.duration_since(t) < max_age,
                _ => true,
            });
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
