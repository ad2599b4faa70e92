//! Out-of-order commit pipeline.
//!
//! A batch whose rows are not all newer than the table's committed maximum is
//! committed in four stages: sort, partition, open column and copy. Every
//! stage fans out tasks for the next one through the [`MessageBus`]; a stage
//! whose queue is inline, or full, runs the next task on the publishing thread.
//!
//! Each commit counts its outstanding tasks per stage. Tasks are counted
//! before they are handed out and uncounted after they ran, so the thread that
//! finishes the last task sees every counter at zero and publishes the new
//! partition list, or rolls back when any task failed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::primitives::concurrency::{panic_message, Job};
use crate::storage::{ColumnBatch, Table};
use crate::types::{Result, StoreError};

pub mod bus;
mod commit;
mod copy;
pub mod merge;
mod open_column;
mod partition;
mod sort;

pub use bus::{MessageBus, O3Task, Stage, StageDispatch};
pub use commit::{CommitHandle, CommitPhase, CommitSummary};
pub use merge::{merge_index, MergeRef};

use bus::SortTask;
use commit::O3Commit;

/// Runtime switch between rename commits and in-place `.o3` rewrites of merged partitions.
///
/// Clones share the flag. The controller reads it once per commit, at submit time.
#[derive(Clone, Debug)]
pub struct RenameFlag(Arc<AtomicBool>);

impl RenameFlag {
    /// Creates a flag with the given initial value.
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Current value.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Changes the value for commits submitted from now on.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

impl Default for RenameFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Pipeline settings.
#[derive(Clone, Debug)]
pub struct O3Options {
    /// Dispatch per stage, in pipeline order.
    pub dispatch: [StageDispatch; 4],
    /// Fewest existing rows that must stay in front of a merge for the
    /// partition to be split instead of rewritten.
    pub split_min_rows: u64,
    /// Rename commit switch.
    pub rename: RenameFlag,
}

impl Default for O3Options {
    fn default() -> Self {
        Self {
            dispatch: [StageDispatch::Queued { capacity: 64 }; 4],
            split_min_rows: 50_000,
            rename: RenameFlag::default(),
        }
    }
}

/// Accepts out-of-order batches and drives them through the stages.
pub struct O3Controller {
    bus: Arc<MessageBus>,
    options: O3Options,
    next_id: AtomicU64,
}

impl O3Controller {
    /// Builds the bus for `options.dispatch`.
    pub fn new(options: O3Options) -> Self {
        Self {
            bus: Arc::new(MessageBus::new(options.dispatch)),
            options,
            next_id: AtomicU64::new(1),
        }
    }

    /// The bus workers poll.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Shared rename switch.
    pub fn rename_flag(&self) -> &RenameFlag {
        &self.options.rename
    }

    /// One pool job per queued stage.
    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        Stage::ALL
            .iter()
            .filter(|&&stage| self.bus.dispatch(stage) != StageDispatch::Inline)
            .map(|&stage| {
                Arc::new(O3Job {
                    bus: Arc::clone(&self.bus),
                    stage,
                }) as Arc<dyn Job>
            })
            .collect()
    }

    /// Submits `batch` against `table`, waiting for any commit already in flight on it.
    pub fn submit(&self, table: &Arc<Table>, batch: ColumnBatch) -> Result<CommitHandle> {
        table.begin_commit(|| help_one(&self.bus));
        self.submit_locked(table, batch)
    }

    /// Submits `batch` on a table whose commit slot the caller already holds.
    /// The slot is released when the commit resolves, or right away on error.
    pub(crate) fn submit_locked(&self, table: &Arc<Table>, batch: ColumnBatch) -> Result<CommitHandle> {
        if let Err(err) = check_batch(table, &batch) {
            table.end_commit();
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let commit = Arc::new(O3Commit::new(
            id,
            Arc::clone(table),
            batch.row_count() as u64,
            self.options.rename.get(),
            self.options.split_min_rows,
        ));
        info!(
            table = %table.name(),
            commit = id,
            txn = commit.txn,
            rows = batch.row_count(),
            rename = commit.rename,
            "o3.commit.submitted"
        );

        commit.spawned(Stage::Sort);
        let mut task = O3Task::Sort(SortTask {
            commit: Arc::clone(&commit),
            batch,
        });
        if self.bus.dispatch(Stage::Sort) == StageDispatch::Inline {
            // The failure is recorded on the commit and surfaces through the handle.
            let _ = execute(&self.bus, task);
        } else {
            loop {
                match self.bus.offer_timeout(task, Duration::from_millis(1)) {
                    Ok(()) => break,
                    Err(back) => {
                        task = back;
                        help_one(&self.bus);
                    }
                }
            }
        }
        Ok(CommitHandle::new(commit, Arc::clone(&self.bus)))
    }

    /// Runs one queued task of any stage; false when every queue is empty.
    pub fn help_one(&self) -> bool {
        help_one(&self.bus)
    }
}

impl std::fmt::Debug for O3Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("O3Controller")
            .field("dispatch", &self.options.dispatch)
            .field("split_min_rows", &self.options.split_min_rows)
            .field("rename", &self.options.rename.get())
            .field("pending", &self.bus.pending())
            .finish()
    }
}

fn check_batch(table: &Table, batch: &ColumnBatch) -> Result<()> {
    table.check_usable()?;
    if batch.is_empty() {
        return Err(StoreError::Invalid("empty batch".into()));
    }
    let schema = table.schema();
    if batch.column_count() != schema.columns.len() || batch.timestamp_index() != schema.timestamp_index {
        return Err(StoreError::Invalid(format!(
            "batch layout does not match table {}",
            schema.name
        )));
    }
    Ok(())
}

/// Runs `task` and settles its commit's accounting.
///
/// Work for a commit that already failed is skipped. The first error of a
/// commit is kept on the commit; the returned error is the stage failure
/// reported to whoever ran the task.
pub(crate) fn execute(bus: &MessageBus, task: O3Task) -> Result<()> {
    let stage = task.stage();
    let slot = task.slot();
    let commit = Arc::clone(task.commit());
    let result = if commit.is_failed() {
        Ok(())
    } else {
        panic::catch_unwind(AssertUnwindSafe(|| run_stage(bus, task))).unwrap_or_else(|payload| {
            Err(StoreError::JobExecution {
                stage: stage.name(),
                message: panic_message(&*payload),
            })
        })
    };
    if let Err(err) = &result {
        commit.fail(slot, err);
    }
    if commit.completed(stage) {
        commit.finalize();
    }
    result.map_err(|err| err.into_job_failure(stage.name()))
}

fn run_stage(bus: &MessageBus, task: O3Task) -> Result<()> {
    match task {
        O3Task::Sort(task) => sort::run(bus, task),
        O3Task::Partition(task) => partition::run(bus, task),
        O3Task::OpenColumn(task) => open_column::run(bus, task),
        O3Task::Copy(task) => copy::run(task),
    }
}

/// Hands `task` to its queue, or runs it here when the queue is inline or full.
pub(crate) fn publish(bus: &MessageBus, task: O3Task) -> Result<()> {
    task.commit().spawned(task.stage());
    match bus.offer(task) {
        Ok(()) => Ok(()),
        Err(task) => execute(bus, task),
    }
}

pub(crate) fn help_one(bus: &MessageBus) -> bool {
    let Some(task) = bus.claim_any() else {
        return false;
    };
    let stage = task.stage();
    if let Err(err) = execute(bus, task) {
        warn!(stage = %stage, error = %err, "o3.help.failed");
    }
    true
}

/// Polls one stage's queue on behalf of a pool worker.
struct O3Job {
    bus: Arc<MessageBus>,
    stage: Stage,
}

impl Job for O3Job {
    fn name(&self) -> &'static str {
        match self.stage {
            Stage::Sort => "o3.sort",
            Stage::Partition => "o3.partition",
            Stage::OpenColumn => "o3.open_column",
            Stage::Copy => "o3.copy",
        }
    }

    fn run(&self, _worker_id: usize) -> Result<bool> {
        match self.bus.claim(self.stage) {
            Some(task) => execute(&self.bus, task).map(|()| true),
            None => Ok(false),
        }
    }
}
