//! Dynamically updatable engine settings
//!
//! Settings are published as immutable snapshots behind an atomic swap:
//! components read the latest snapshot at the point of use instead of
//! reacting to in-place mutation. Each update bumps a version counter so
//! callers can detect change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::{EngineError, Result};

/// Setting key: seal refreshed segments into compound form on flush (bool).
pub const COMPOUND_ON_FLUSH: &str = "index.compound_on_flush";
/// Setting key: age after which delete tombstones may be pruned (millis).
pub const GC_DELETES: &str = "index.gc_deletes";
/// Setting key: fail the engine when corruption is detected (bool).
pub const FAIL_ON_CORRUPTION: &str = "index.fail_on_corruption";
/// Setting key: fail the engine when a merge fails (bool).
pub const FAIL_ON_MERGE_FAILURE: &str = "index.fail_on_merge_failure";
/// Setting key: codec used for newly sealed segments (string).
pub const CODEC: &str = "index.codec";
/// Setting key: bound on concurrent writer thread states (positive int).
pub const INDEX_CONCURRENCY: &str = "index.index_concurrency";

/// Engine configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub compound_on_flush: bool,
    pub gc_deletes: Duration,
    pub fail_on_corruption: bool,
    pub fail_on_merge_failure: bool,
    pub codec: String,
    pub index_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            compound_on_flush: true,
            gc_deletes: Duration::from_secs(60),
            fail_on_corruption: false,
            fail_on_merge_failure: true,
            codec: "default".to_string(),
            index_concurrency: 8,
        }
    }
}

/// Publishes [`EngineSettings`] snapshots to all engine components.
pub struct SettingsService {
    current: RwLock<Arc<EngineSettings>>,
    version: AtomicU64,
}

impl SettingsService {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
            version: AtomicU64::new(1),
        }
    }

    /// The latest settings snapshot. Cheap; callers should re-read at each
    /// point of use rather than caching.
    pub fn current(&self) -> Arc<EngineSettings> {
        self.current.read().clone()
    }

    /// Snapshot version, bumped on every update.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Copy-modify-swap the settings.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut EngineSettings),
    {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Apply a single key/value pair from the dynamic settings surface.
    /// Durations are integer milliseconds.
    pub fn apply(&self, key: &str, value: &str) -> Result<()> {
        match key {
            COMPOUND_ON_FLUSH => {
                let v = parse_bool(key, value)?;
                self.update(|s| s.compound_on_flush = v);
            }
            GC_DELETES => {
                let millis: u64 = value.parse().map_err(|_| invalid(key, value))?;
                self.update(|s| s.gc_deletes = Duration::from_millis(millis));
            }
            FAIL_ON_CORRUPTION => {
                let v = parse_bool(key, value)?;
                self.update(|s| s.fail_on_corruption = v);
            }
            FAIL_ON_MERGE_FAILURE => {
                let v = parse_bool(key, value)?;
                self.update(|s| s.fail_on_merge_failure = v);
            }
            CODEC => {
                let codec = value.to_string();
                self.update(|s| s.codec = codec);
            }
            INDEX_CONCURRENCY => {
                let v: usize = value.parse().map_err(|_| invalid(key, value))?;
                if v == 0 {
                    return Err(invalid(key, value));
                }
                self.update(|s| s.index_concurrency = v);
            }
            _ => return Err(EngineError::Serialization(format!("unknown setting [{}]", key))),
        }
        Ok(())
    }
}

impl Default for SettingsService {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> EngineError {
    EngineError::Serialization(format!("invalid value [{}] for setting [{}]", value, key))
}

// ============================================================================
// Tests
// ============================================================================
