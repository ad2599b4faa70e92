//! The four pipeline queues and the task descriptors travelling through them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::commit::O3Commit;
use crate::primitives::concurrency::JobQueue;
use crate::storage::ColumnBatch;

/// Pipeline stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    /// Orders the batch by timestamp and cuts it at partition boundaries.
    Sort,
    /// Classifies one partition's slice and plans its rewrite.
    Partition,
    /// Opens one target column file.
    OpenColumn,
    /// Writes one column of one partition.
    Copy,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Sort, Stage::Partition, Stage::OpenColumn, Stage::Copy];

    /// Position in pipeline order.
    pub fn index(self) -> usize {
        match self {
            Stage::Sort => 0,
            Stage::Partition => 1,
            Stage::OpenColumn => 2,
            Stage::Copy => 3,
        }
    }

    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Sort => "sort",
            Stage::Partition => "partition",
            Stage::OpenColumn => "open_column",
            Stage::Copy => "copy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage's tasks are executed, fixed when the bus is built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StageDispatch {
    /// The producer runs the task itself, right away.
    Inline,
    /// Tasks go through a bounded queue drained by workers and waiting writers.
    Queued {
        /// Queue capacity.
        capacity: usize,
    },
}

impl StageDispatch {
    /// `Inline` for capacity 0, `Queued` otherwise.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            StageDispatch::Inline
        } else {
            StageDispatch::Queued { capacity }
        }
    }

    fn capacity(self) -> usize {
        match self {
            StageDispatch::Inline => 0,
            StageDispatch::Queued { capacity } => capacity,
        }
    }
}

/// Sort the whole batch.
pub struct SortTask {
    pub(crate) commit: Arc<O3Commit>,
    pub(crate) batch: ColumnBatch,
}

/// Plan the partition owning slice `slot` of the sorted run.
pub struct PartitionTask {
    pub(crate) commit: Arc<O3Commit>,
    pub(crate) slot: usize,
}

/// Open column `column` of the partition planned in `slot`.
pub struct OpenColumnTask {
    pub(crate) commit: Arc<O3Commit>,
    pub(crate) slot: usize,
    pub(crate) column: usize,
}

/// Write column `column` of the partition planned in `slot`.
pub struct CopyTask {
    pub(crate) commit: Arc<O3Commit>,
    pub(crate) slot: usize,
    pub(crate) column: usize,
}

/// A unit of pipeline work, tagged by stage.
pub enum O3Task {
    /// See [`SortTask`].
    Sort(SortTask),
    /// See [`PartitionTask`].
    Partition(PartitionTask),
    /// See [`OpenColumnTask`].
    OpenColumn(OpenColumnTask),
    /// See [`CopyTask`].
    Copy(CopyTask),
}

impl O3Task {
    /// Stage the task belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            O3Task::Sort(_) => Stage::Sort,
            O3Task::Partition(_) => Stage::Partition,
            O3Task::OpenColumn(_) => Stage::OpenColumn,
            O3Task::Copy(_) => Stage::Copy,
        }
    }

    pub(crate) fn commit(&self) -> &Arc<O3Commit> {
        match self {
            O3Task::Sort(t) => &t.commit,
            O3Task::Partition(t) => &t.commit,
            O3Task::OpenColumn(t) => &t.commit,
            O3Task::Copy(t) => &t.commit,
        }
    }

    /// Partition slot the task works on, when it is partition-specific.
    pub fn slot(&self) -> Option<usize> {
        match self {
            O3Task::Sort(_) => None,
            O3Task::Partition(t) => Some(t.slot),
            O3Task::OpenColumn(t) => Some(t.slot),
            O3Task::Copy(t) => Some(t.slot),
        }
    }
}

/// Four bounded queues, one per stage.
pub struct MessageBus {
    sort: JobQueue<SortTask>,
    partition: JobQueue<PartitionTask>,
    open_column: JobQueue<OpenColumnTask>,
    copy: JobQueue<CopyTask>,
}

impl MessageBus {
    /// Builds the queues; capacities are given in pipeline order.
    pub fn new(dispatch: [StageDispatch; 4]) -> Self {
        Self {
            sort: JobQueue::new("o3.sort", dispatch[0].capacity()),
            partition: JobQueue::new("o3.partition", dispatch[1].capacity()),
            open_column: JobQueue::new("o3.open_column", dispatch[2].capacity()),
            copy: JobQueue::new("o3.copy", dispatch[3].capacity()),
        }
    }

    /// Dispatch strategy of `stage`.
    pub fn dispatch(&self, stage: Stage) -> StageDispatch {
        let capacity = match stage {
            Stage::Sort => self.sort.capacity(),
            Stage::Partition => self.partition.capacity(),
            Stage::OpenColumn => self.open_column.capacity(),
            Stage::Copy => self.copy.capacity(),
        };
        StageDispatch::from_capacity(capacity)
    }

    /// Queues `task` without waiting; hands it back when the queue is full or inline.
    pub(crate) fn offer(&self, task: O3Task) -> Result<(), O3Task> {
        match task {
            O3Task::Sort(t) => self.sort.try_publish(t).map_err(O3Task::Sort),
            O3Task::Partition(t) => self.partition.try_publish(t).map_err(O3Task::Partition),
            O3Task::OpenColumn(t) => self.open_column.try_publish(t).map_err(O3Task::OpenColumn),
            O3Task::Copy(t) => self.copy.try_publish(t).map_err(O3Task::Copy),
        }
    }

    /// Queues `task`, waiting up to `wait` for room.
    pub(crate) fn offer_timeout(&self, task: O3Task, wait: Duration) -> Result<(), O3Task> {
        match task {
            O3Task::Sort(t) => self.sort.publish_timeout(t, wait).map_err(O3Task::Sort),
            O3Task::Partition(t) => self
                .partition
                .publish_timeout(t, wait)
                .map_err(O3Task::Partition),
            O3Task::OpenColumn(t) => self
                .open_column
                .publish_timeout(t, wait)
                .map_err(O3Task::OpenColumn),
            O3Task::Copy(t) => self.copy.publish_timeout(t, wait).map_err(O3Task::Copy),
        }
    }

    /// Claims one task of `stage`.
    pub fn claim(&self, stage: Stage) -> Option<O3Task> {
        match stage {
            Stage::Sort => self.sort.try_claim().map(O3Task::Sort),
            Stage::Partition => self.partition.try_claim().map(O3Task::Partition),
            Stage::OpenColumn => self.open_column.try_claim().map(O3Task::OpenColumn),
            Stage::Copy => self.copy.try_claim().map(O3Task::Copy),
        }
    }

    /// Claims one task of any stage, downstream stages first so commits in
    /// flight finish before new ones fan out.
    pub fn claim_any(&self) -> Option<O3Task> {
        Stage::ALL.iter().rev().find_map(|&stage| self.claim(stage))
    }

    /// Tasks waiting across all queues.
    pub fn pending(&self) -> usize {
        self.sort.len() + self.partition.len() + self.open_column.len() + self.copy.len()
    }
}
