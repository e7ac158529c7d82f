//! Copy-on-write pipeline snapshots of a buffer's bytes.
//!
//! The rendering pipeline is a small fixed number of stages advancing in
//! lockstep. Each stage reads a consistent snapshot of buffer contents;
//! upstream writes must not tear downstream reads. [`DataCycler`] keeps one
//! reference-counted [`StageData`] per stage: a writer clones the snapshot
//! when it is shared (so existing readers keep the prior version) and
//! [`cycle`](DataCycler::cycle) retires each stage's snapshot into the next.

use crate::buffer::UsageHint;
use crate::registry::UpdateSeq;
use std::sync::Arc;

/// One stage's snapshot: the bytes plus their bookkeeping.
///
/// `full_size` records the uncompressed byte length even while `data` holds
/// the compressed form; the two lengths differ exactly when the snapshot is
/// stored compressed.
#[derive(Debug, Clone)]
pub struct StageData {
    pub(crate) data: Vec<u8>,
    pub(crate) full_size: usize,
    pub(crate) usage: UsageHint,
    pub(crate) modified: UpdateSeq,
}

impl StageData {
    /// The snapshot's bytes as currently stored.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Uncompressed byte length, even when the bytes are stored compressed.
    pub fn full_size(&self) -> usize {
        self.full_size
    }

    /// The buffer's usage hint as of this snapshot.
    pub fn usage(&self) -> UsageHint {
        self.usage
    }

    /// Modification stamp drawn when this snapshot last changed.
    pub fn modified(&self) -> UpdateSeq {
        self.modified
    }
}

/// A fixed ring of per-stage snapshots with copy-on-write mutation.
#[derive(Debug, Clone)]
pub struct DataCycler {
    stages: Vec<Arc<StageData>>,
}

impl DataCycler {
    /// Create a cycler with `num_stages` stages, all sharing one empty
    /// snapshot.
    pub(crate) fn new(num_stages: usize, usage: UsageHint, modified: UpdateSeq) -> Self {
        assert!(num_stages > 0, "pipeline must have at least one stage");
        let initial = Arc::new(StageData {
            data: Vec::new(),
            full_size: 0,
            usage,
            modified,
        });
        Self {
            stages: vec![initial; num_stages],
        }
    }

    /// Number of pipeline stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// The snapshot currently visible at `stage`.
    pub fn read(&self, stage: usize) -> &Arc<StageData> {
        &self.stages[stage]
    }

    /// Obtain an exclusive snapshot at `stage` for mutation.
    ///
    /// If the stage's snapshot is shared with other stages (or outside
    /// readers), it is cloned first so those readers keep the prior
    /// version. With `force_copy`, a clone is taken even when the snapshot
    /// is unique.
    pub fn write(&mut self, stage: usize, force_copy: bool) -> &mut StageData {
        if force_copy && Arc::strong_count(&self.stages[stage]) == 1 {
            let copy = StageData::clone(&self.stages[stage]);
            self.stages[stage] = Arc::new(copy);
        }
        Arc::make_mut(&mut self.stages[stage])
    }

    /// Advance the pipeline one step: stage k's snapshot becomes visible at
    /// stage k+1, the oldest snapshot is dropped, and stage 0 keeps its
    /// current snapshot.
    pub fn cycle(&mut self) {
        for i in (1..self.stages.len()).rev() {
            self.stages[i] = self.stages[i - 1].clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycler(num_stages: usize) -> DataCycler {
        DataCycler::new(num_stages, UsageHint::Static, UpdateSeq::initial())
    }

    #[test]
    fn test_stages_share_initial_snapshot() {
        let cycler = cycler(3);
        assert!(Arc::ptr_eq(cycler.read(0), cycler.read(1)));
        assert!(Arc::ptr_eq(cycler.read(1), cycler.read(2)));
    }

    #[test]
    fn test_write_clones_shared_snapshot() {
        let mut cycler = cycler(2);
        cycler.write(0, false).data = vec![1, 2, 3, 4];
        // Stage 1 still sees the prior (empty) snapshot.
        assert_eq!(cycler.read(0).data(), &[1, 2, 3, 4]);
        assert!(cycler.read(1).data().is_empty());
    }

    #[test]
    fn test_cycle_propagates_downstream() {
        let mut cycler = cycler(2);
        cycler.write(0, false).data = vec![1, 2, 3, 4];
        cycler.cycle();
        assert_eq!(cycler.read(1).data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_cycle_drops_oldest() {
        let mut cycler = cycler(2);
        cycler.write(0, false).data = vec![1];
        cycler.cycle();
        cycler.write(0, false).data = vec![2];
        cycler.cycle();
        assert_eq!(cycler.read(1).data(), &[2]);
    }

    #[test]
    fn test_force_copy_replaces_unique_snapshot() {
        let mut cycler = cycler(1);
        let before = cycler.read(0).clone();
        cycler.write(0, true).data = vec![9];
        assert!(!Arc::ptr_eq(&before, cycler.read(0)));
        assert!(before.data().is_empty());
    }

    #[test]
    fn test_outside_reader_keeps_prior_version() {
        let mut cycler = cycler(1);
        cycler.write(0, false).data = vec![1, 2];
        let snapshot = cycler.read(0).clone();
        cycler.write(0, false).data = vec![3, 4];
        assert_eq!(snapshot.data(), &[1, 2]);
        assert_eq!(cycler.read(0).data(), &[3, 4]);
    }
}
