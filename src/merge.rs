//! Merge scheduling
//!
//! Merges run on a worker thread owned by the scheduler; the engine only
//! blocks on them when explicitly asked to. Interested parties register on
//! an explicit listener list and are notified around every merge with the
//! descriptor of the segments involved.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{EngineError, Result};

/// Descriptor of one in-progress merge.
#[derive(Debug, Clone)]
pub struct OngoingMerge {
    pub id: u64,
    /// Generations of the segments participating in the merge.
    pub generations: Vec<u64>,
    /// Live documents across the participating segments.
    pub total_docs: usize,
}

/// Merge lifecycle notifications. Callbacks run on the merge worker thread.
pub trait MergeListener: Send + Sync {
    fn before_merge(&self, _merge: &OngoingMerge) {}
    fn after_merge(&self, _merge: &OngoingMerge) {}
}

/// Runs merge jobs on worker threads and publishes merge events.
pub struct MergeScheduler {
    listeners: RwLock<Vec<Arc<dyn MergeListener>>>,
    running: Mutex<usize>,
    idle: Condvar,
}

impl MergeScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(Vec::new()),
            running: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn MergeListener>) {
        self.listeners.write().push(listener);
    }

    /// Submit a merge job. Listeners are notified before and after the job
    /// runs; a failing job is reported through `on_failure`.
    pub fn submit<F, G>(self: &Arc<Self>, merge: OngoingMerge, job: F, on_failure: G)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
        G: FnOnce(EngineError) + Send + 'static,
    {
        *self.running.lock() += 1;
        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name("strata-merge".to_string())
            .spawn(move || {
                let listeners = scheduler.listeners.read().clone();
                for listener in &listeners {
                    listener.before_merge(&merge);
                }
                let result = job();
                for listener in &listeners {
                    listener.after_merge(&merge);
                }
                if let Err(err) = result {
                    on_failure(err);
                }
                let mut running = scheduler.running.lock();
                *running -= 1;
                if *running == 0 {
                    scheduler.idle.notify_all();
                }
            });
        if spawned.is_err() {
            let mut running = self.running.lock();
            *running -= 1;
            if *running == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Block until no merges are in flight.
    pub fn wait_for_merges(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.idle.wait(&mut running);
        }
    }

    /// Number of merges currently in flight.
    pub fn active_merges(&self) -> usize {
        *self.running.lock()
    }
}

// ============================================================================
// Tests
// ============================================================================
