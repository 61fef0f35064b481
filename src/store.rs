//! Reference-counted handle on the shard directory
//!
//! The store owns the directory the index commits into. Every component
//! that touches it (the engine holder, a started engine, each open
//! searcher) takes a reference through [`Store::try_inc_ref`] and releases
//! it exactly once when the returned guard drops. Closing the store with
//! references still outstanding fails loudly instead of leaking.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::{EngineError, Result};

const LOCK_FILE: &str = "write.lock";

/// A shard directory with an advisory lock and a reference count.
pub struct Store {
    path: PathBuf,
    lock_file: Mutex<Option<File>>,
    refs: AtomicUsize,
    closed: AtomicBool,
}

impl Store {
    /// Open (creating if needed) the directory and take its advisory lock.
    /// Fails if another store instance already holds the lock.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|e| {
            EngineError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("store [{}] is locked: {}", path.display(), e),
            ))
        })?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            lock_file: Mutex::new(Some(lock)),
            refs: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current reference count, including the owner reference.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Take a reference. Fails once the store is closed or its count has
    /// already dropped to zero.
    pub fn try_inc_ref(self: &Arc<Self>) -> Result<StoreRef> {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 || self.closed.load(Ordering::SeqCst) {
                return Err(EngineError::StoreClosed);
            }
            match self.refs.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(StoreRef { store: self.clone() }),
                Err(v) => current = v,
            }
        }
    }

    fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Release the owner reference and the advisory lock. Fails loudly when
    /// other references are still outstanding; the caller leaked a guard.
    pub fn close(&self) -> Result<()> {
        match self
            .refs
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.closed.store(true, Ordering::SeqCst);
                if let Some(lock) = self.lock_file.lock().take() {
                    let _ = lock.unlock();
                }
                Ok(())
            }
            Err(n) => Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "store [{}] closed with {} outstanding references",
                    self.path.display(),
                    n.saturating_sub(1)
                ),
            ))),
        }
    }
}

/// RAII reference on a [`Store`]; the count drops exactly once when this
/// guard is dropped.
pub struct StoreRef {
    store: Arc<Store>,
}

impl StoreRef {
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl Drop for StoreRef {
    fn drop(&mut self) {
        self.store.dec_ref();
    }
}

// ============================================================================
// Tests
// ============================================================================
