//! Recovery protocol
//!
//! Recovery is a three-phase hand-off driven by the engine on behalf of an
//! external recovery driver:
//!
//! 1. **phase1**: the driver receives a ref-counted snapshot of the last
//!    durable commit and copies the committed segment files.
//! 2. **phase2**: the driver replays a translog snapshot covering every
//!    operation accepted before the phase started.
//! 3. **phase3**: the driver replays a second snapshot covering operations
//!    that raced phase2's replay.
//!
//! Flush is refused for the whole duration so the committed generation
//! cannot advance under the copied snapshot. A failing phase aborts the
//! recovery; the snapshot commit is released and no partial state sticks.

use crate::index::SnapshotIndexCommit;
use crate::translog::TranslogSnapshot;
use crate::Result;

/// Driver callbacks for the three recovery phases. Any phase may fail to
/// abort the recovery.
pub trait RecoveryHandler {
    fn phase1(&mut self, snapshot: &SnapshotIndexCommit) -> Result<()>;
    fn phase2(&mut self, snapshot: &mut TranslogSnapshot) -> Result<()>;
    fn phase3(&mut self, snapshot: &mut TranslogSnapshot) -> Result<()>;
}

/// A [`RecoveryHandler`] assembled from three closures; convenient for
/// drivers without state of their own.
pub struct RecoverySteps<F1, F2, F3>
where
    F1: FnMut(&SnapshotIndexCommit) -> Result<()>,
    F2: FnMut(&mut TranslogSnapshot) -> Result<()>,
    F3: FnMut(&mut TranslogSnapshot) -> Result<()>,
{
    pub phase1: F1,
    pub phase2: F2,
    pub phase3: F3,
}

impl<F1, F2, F3> RecoveryHandler for RecoverySteps<F1, F2, F3>
where
    F1: FnMut(&SnapshotIndexCommit) -> Result<()>,
    F2: FnMut(&mut TranslogSnapshot) -> Result<()>,
    F3: FnMut(&mut TranslogSnapshot) -> Result<()>,
{
    fn phase1(&mut self, snapshot: &SnapshotIndexCommit) -> Result<()> {
        (self.phase1)(snapshot)
    }

    fn phase2(&mut self, snapshot: &mut TranslogSnapshot) -> Result<()> {
        (self.phase2)(snapshot)
    }

    fn phase3(&mut self, snapshot: &mut TranslogSnapshot) -> Result<()> {
        (self.phase3)(snapshot)
    }
}
