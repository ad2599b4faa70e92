//! Per-commit bookkeeping: outstanding work per stage, partition plans,
//! publish-after-complete and rollback.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::bus::{MessageBus, Stage};
use super::merge::MergePlan;
use crate::primitives::vm::AppendMemory;
use crate::storage::partition::{
    column_o3_path, column_path, discard_dir, roll_forward_column, truncate_column,
    PartitionSlice,
};
use crate::storage::{
    ColumnBatch, ColumnDef, PartitionEntry, PartitionKind, PartitionList, PartitionOutcome, PartitionStatus,
    Table,
};
use crate::types::{clone_error, Result, StoreError, Timestamp};

/// Where a commit is in the pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CommitPhase {
    /// Handed to the pipeline.
    Received,
    /// Sorted and cut at partition boundaries.
    Sorted,
    /// Every affected partition has a plan.
    Partitioned,
    /// Every target column file is open.
    ColumnsOpened,
    /// Every column is written.
    Copied,
    /// Published to readers.
    Committed,
    /// Abandoned; nothing was published.
    Failed,
}

const STAGE_DONE: [CommitPhase; 5] = [
    CommitPhase::Received,
    CommitPhase::Sorted,
    CommitPhase::Partitioned,
    CommitPhase::ColumnsOpened,
    CommitPhase::Copied,
];

/// Tries per in-place swap before the table is handed to recovery.
const SWAP_ATTEMPTS: u32 = 3;
const SWAP_BACKOFF: Duration = Duration::from_millis(2);

/// Result of a successful commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitSummary {
    /// Table name.
    pub table: String,
    /// Commit number now published.
    pub txn: u64,
    /// Rows committed.
    pub rows: u64,
    /// Whether the rows went through the out-of-order pipeline.
    pub out_of_order: bool,
    /// Structure version after the commit.
    pub structure_version: u64,
    /// Per-partition outcomes in time order.
    pub partitions: Vec<PartitionOutcome>,
}

pub(crate) struct SortedRun {
    pub(crate) batch: ColumnBatch,
    pub(crate) timestamps: Vec<Timestamp>,
    pub(crate) slices: Vec<PartitionSlice>,
}

pub(crate) struct SourcePartition {
    pub(crate) index: usize,
    pub(crate) entry: PartitionEntry,
    pub(crate) dir: PathBuf,
}

/// How one partition is rewritten, decided by the partition stage.
pub(crate) struct PartitionPlan {
    pub(crate) slot: usize,
    pub(crate) kind: PartitionKind,
    pub(crate) slice: PartitionSlice,
    pub(crate) source: Option<SourcePartition>,
    pub(crate) target_dir: PathBuf,
    pub(crate) in_place: bool,
    pub(crate) merge: Option<MergePlan>,
    /// Split only: the source partition after its tail moved out.
    pub(crate) base_after: Option<PartitionEntry>,
    /// The partition written by this plan as it will be published.
    pub(crate) entry: PartitionEntry,
    pub(crate) columns: Vec<Mutex<Option<AppendMemory>>>,
}

impl PartitionPlan {
    pub(crate) fn new(
        slot: usize,
        kind: PartitionKind,
        slice: PartitionSlice,
        target_dir: PathBuf,
        entry: PartitionEntry,
        column_count: usize,
    ) -> Self {
        Self {
            slot,
            kind,
            slice,
            source: None,
            target_dir,
            in_place: false,
            merge: None,
            base_after: None,
            entry,
            columns: (0..column_count).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub(crate) fn source(&self) -> Result<&SourcePartition> {
        self.source.as_ref().ok_or_else(|| {
            StoreError::ConsistencyViolation(format!(
                "{:?} plan for {} has no source partition",
                self.kind,
                self.entry.dir_name()
            ))
        })
    }

    /// Rows already in the target file before the copy stage writes.
    pub(crate) fn write_offset_rows(&self) -> u64 {
        match (self.kind, &self.source) {
            (PartitionKind::Append, Some(src)) => src.entry.rows,
            _ => 0,
        }
    }

    /// Rows the copy stage writes into each column.
    pub(crate) fn rows_written(&self) -> u64 {
        match &self.merge {
            Some(merge) => merge.len() as u64,
            None => self.slice.len() as u64,
        }
    }

    /// File the copy stage writes column `name` into.
    pub(crate) fn column_target(&self, name: &str) -> PathBuf {
        if self.in_place {
            column_o3_path(&self.target_dir, name)
        } else {
            column_path(&self.target_dir, name)
        }
    }

    fn outcome(&self, status: PartitionStatus) -> PartitionOutcome {
        PartitionOutcome {
            lo: self.entry.lo,
            dir: self.entry.dir_name(),
            kind: self.kind,
            rows_added: self.slice.len() as u64,
            rows_total: self.entry.rows,
            status,
        }
    }
}

struct Progress {
    phase: CommitPhase,
    outstanding: [usize; 4],
    failure: Option<StoreError>,
    failed_slots: Vec<(usize, String)>,
    finalized: bool,
    durable: bool,
}

/// Shared state of one out-of-order commit.
pub(crate) struct O3Commit {
    pub(crate) id: u64,
    pub(crate) table: Arc<Table>,
    pub(crate) base: Arc<PartitionList>,
    pub(crate) txn: u64,
    pub(crate) rename: bool,
    pub(crate) split_min_rows: u64,
    rows: u64,
    sorted: OnceLock<SortedRun>,
    plans: Mutex<Vec<Option<Arc<PartitionPlan>>>>,
    progress: Mutex<Progress>,
    result: Mutex<Option<Result<CommitSummary>>>,
    outcomes: Mutex<Vec<PartitionOutcome>>,
    resolved: Condvar,
}

impl O3Commit {
    pub(crate) fn new(
        id: u64,
        table: Arc<Table>,
        rows: u64,
        rename: bool,
        split_min_rows: u64,
    ) -> Self {
        let base = table.snapshot();
        let txn = base.txn + 1;
        Self {
            id,
            table,
            base,
            txn,
            rename,
            split_min_rows,
            rows,
            sorted: OnceLock::new(),
            plans: Mutex::new(Vec::new()),
            progress: Mutex::new(Progress {
                phase: CommitPhase::Received,
                outstanding: [0; 4],
                failure: None,
                failed_slots: Vec::new(),
                finalized: false,
                durable: false,
            }),
            result: Mutex::new(None),
            outcomes: Mutex::new(Vec::new()),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn set_sorted(&self, run: SortedRun) -> Result<()> {
        let slots = run.slices.len();
        self.sorted
            .set(run)
            .map_err(|_| StoreError::ConsistencyViolation(format!("commit {} sorted twice", self.id)))?;
        *self.plans.lock() = vec![None; slots];
        Ok(())
    }

    pub(crate) fn sorted(&self) -> Result<&SortedRun> {
        self.sorted.get().ok_or_else(|| {
            StoreError::ConsistencyViolation(format!("commit {} used before sorting", self.id))
        })
    }

    pub(crate) fn set_plan(&self, plan: PartitionPlan) -> Result<Arc<PartitionPlan>> {
        let slot = plan.slot;
        let plan = Arc::new(plan);
        let mut plans = self.plans.lock();
        match plans.get_mut(slot) {
            Some(cell @ None) => {
                *cell = Some(Arc::clone(&plan));
                Ok(plan)
            }
            _ => Err(StoreError::ConsistencyViolation(format!(
                "commit {} cannot plan slot {slot}",
                self.id
            ))),
        }
    }

    pub(crate) fn plan(&self, slot: usize) -> Result<Arc<PartitionPlan>> {
        self.plans
            .lock()
            .get(slot)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                StoreError::ConsistencyViolation(format!("commit {} has no plan for slot {slot}", self.id))
            })
    }

    /// Counts a task of `stage` about to be handed out.
    pub(crate) fn spawned(&self, stage: Stage) {
        self.progress.lock().outstanding[stage.index()] += 1;
    }

    /// Counts a finished task of `stage`; true when it was the commit's last task.
    pub(crate) fn completed(&self, stage: Stage) -> bool {
        let mut progress = self.progress.lock();
        let idx = stage.index();
        debug_assert!(progress.outstanding[idx] > 0);
        progress.outstanding[idx] = progress.outstanding[idx].saturating_sub(1);
        if progress.failure.is_none() {
            let done = progress.outstanding.iter().take_while(|&&n| n == 0).count();
            let reached = STAGE_DONE[done.min(STAGE_DONE.len() - 1)];
            if reached > progress.phase {
                progress.phase = reached;
            }
        }
        let idle = progress.outstanding.iter().all(|&n| n == 0);
        if idle && !progress.finalized {
            progress.finalized = true;
            true
        } else {
            false
        }
    }

    /// Records a failure; the first one becomes the commit's error.
    pub(crate) fn fail(&self, slot: Option<usize>, err: &StoreError) {
        let mut progress = self.progress.lock();
        if let Some(slot) = slot {
            if !progress.failed_slots.iter().any(|(s, _)| *s == slot) {
                progress.failed_slots.push((slot, err.to_string()));
            }
        }
        if progress.failure.is_none() {
            progress.failure = Some(clone_error(err));
            progress.phase = CommitPhase::Failed;
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.progress.lock().failure.is_some()
    }

    pub(crate) fn phase(&self) -> CommitPhase {
        self.progress.lock().phase
    }

    /// Publishes or rolls back once no task is outstanding, then resolves the handle.
    pub(crate) fn finalize(&self) {
        let failure = self.progress.lock().failure.as_ref().map(clone_error);
        let result = match failure {
            Some(err) => Err(err),
            None => self.publish(),
        };
        let result = match result {
            Ok(summary) => {
                self.progress.lock().phase = CommitPhase::Committed;
                info!(
                    table = %self.table.name(),
                    commit = self.id,
                    txn = summary.txn,
                    rows = summary.rows,
                    partitions = summary.partitions.len(),
                    "o3.commit.published"
                );
                *self.outcomes.lock() = summary.partitions.clone();
                Ok(summary)
            }
            Err(err) => {
                self.fail(None, &err);
                self.rollback();
                *self.outcomes.lock() = self.failed_outcomes();
                warn!(
                    table = %self.table.name(),
                    commit = self.id,
                    error = %err,
                    "o3.commit.failed"
                );
                Err(err)
            }
        };
        self.table.end_commit();
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.resolved.notify_all();
    }

    fn all_plans(&self) -> Vec<Arc<PartitionPlan>> {
        self.plans.lock().iter().flatten().cloned().collect()
    }

    fn publish(&self) -> Result<CommitSummary> {
        let plans = self.all_plans();
        let expected = self.sorted()?.slices.len();
        if plans.len() != expected {
            return Err(StoreError::ConsistencyViolation(format!(
                "commit {} planned {} of {expected} partitions",
                self.id,
                plans.len()
            )));
        }

        let mut next = (*self.base).clone();
        next.txn = self.txn;
        let mut structural = false;
        for plan in &plans {
            match plan.kind {
                PartitionKind::Append | PartitionKind::Merge => {
                    next.partitions[plan.source()?.index] = plan.entry.clone();
                    structural |= plan.kind == PartitionKind::Merge;
                }
                PartitionKind::Split => {
                    let base_after = plan.base_after.clone().ok_or_else(|| {
                        StoreError::ConsistencyViolation("split plan without base".into())
                    })?;
                    next.partitions[plan.source()?.index] = base_after;
                    structural = true;
                }
                PartitionKind::New => {}
            }
        }
        for plan in &plans {
            if matches!(plan.kind, PartitionKind::Split | PartitionKind::New) {
                next.insert(plan.entry.clone());
            }
        }
        if structural {
            next.structure_version += 1;
        }
        next.check()?;
        if next.row_count() != self.base.row_count() + self.rows {
            return Err(StoreError::ConsistencyViolation(format!(
                "commit {} would publish {} rows, expected {}",
                self.id,
                next.row_count(),
                self.base.row_count() + self.rows
            )));
        }

        let ff = self.table.files();
        let table_dir = self.table.dir();
        let mut renamed: Vec<PathBuf> = Vec::new();
        for plan in plans.iter().filter(|p| p.kind == PartitionKind::Merge && !p.in_place) {
            let final_dir = table_dir.join(plan.entry.dir_name());
            if let Err(err) = ff.rename(&plan.target_dir, &final_dir) {
                renamed.iter().for_each(|dir| discard_dir(ff, dir));
                return Err(err);
            }
            renamed.push(final_dir);
        }
        if let Err(err) = next.store(ff, table_dir) {
            renamed.iter().for_each(|dir| discard_dir(ff, dir));
            return Err(err);
        }
        self.progress.lock().durable = true;

        // `_txn` is durable from here on: the commit is reported as committed
        // whatever happens to the swaps below.
        if let Err(err) = self.swap_in_place(&plans) {
            self.table.require_recovery(format!(
                "commit {} left in-place rewrites unswapped: {err}",
                self.txn
            ));
        }
        let structure_version = next.structure_version;
        self.table.install(next);

        for plan in plans.iter().filter(|p| p.kind == PartitionKind::Merge && !p.in_place) {
            if let Ok(src) = plan.source() {
                discard_dir(ff, &src.dir);
            }
        }

        let mut partitions: Vec<PartitionOutcome> = plans
            .iter()
            .map(|p| p.outcome(PartitionStatus::Published))
            .collect();
        partitions.sort_by_key(|o| o.lo);
        Ok(CommitSummary {
            table: self.table.name().to_string(),
            txn: self.txn,
            rows: self.rows,
            out_of_order: true,
            structure_version,
            partitions,
        })
    }

    /// Moves every in-place rewrite over its original, retrying failed swaps.
    fn swap_in_place(&self, plans: &[Arc<PartitionPlan>]) -> Result<()> {
        let ff = self.table.files();
        let mut pending: Vec<(&PartitionPlan, &ColumnDef)> = plans
            .iter()
            .filter(|p| p.in_place)
            .flat_map(|p| self.table.schema().columns.iter().map(move |def| (p.as_ref(), def)))
            .collect();
        let mut last_err = None;
        for attempt in 0..SWAP_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(SWAP_BACKOFF * attempt);
            }
            pending.retain(|(plan, def)| {
                match roll_forward_column(ff, &plan.target_dir, &def.name, def.ty, plan.entry.rows) {
                    Ok(_) => false,
                    Err(err) => {
                        warn!(
                            dir = %plan.target_dir.display(),
                            column = %def.name,
                            attempt,
                            error = %err,
                            "o3.commit.swap_failed"
                        );
                        last_err = Some(err);
                        true
                    }
                }
            });
            if pending.is_empty() {
                return Ok(());
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StoreError::ConsistencyViolation(format!("commit {} could not swap rewrites", self.txn))
        }))
    }

    fn rollback(&self) {
        if self.progress.lock().durable {
            error!(
                table = %self.table.name(),
                commit = self.id,
                "o3.rollback.skipped_after_publish"
            );
            return;
        }
        let ff = self.table.files();
        for plan in self.all_plans() {
            for column in &plan.columns {
                drop(column.lock().take());
            }
            match plan.kind {
                PartitionKind::Append => {
                    let Ok(src) = plan.source() else { continue };
                    for def in &self.table.schema().columns {
                        if !ff.exists(&column_path(&src.dir, &def.name)) {
                            continue;
                        }
                        if let Err(err) = truncate_column(ff, &src.dir, &def.name, def.ty, src.entry.rows) {
                            warn!(
                                path = %src.dir.display(),
                                column = %def.name,
                                error = %err,
                                "o3.rollback.truncate_failed"
                            );
                        }
                    }
                }
                PartitionKind::Merge if plan.in_place => {
                    for def in &self.table.schema().columns {
                        let path = column_o3_path(&plan.target_dir, &def.name);
                        if ff.exists(&path) {
                            if let Err(err) = ff.remove_file(&path) {
                                warn!(path = %path.display(), error = %err, "o3.rollback.remove_failed");
                            }
                        }
                    }
                }
                _ => discard_dir(ff, &plan.target_dir),
            }
            debug!(commit = self.id, slot = plan.slot, kind = ?plan.kind, "o3.rollback.partition");
        }
    }

    fn failed_outcomes(&self) -> Vec<PartitionOutcome> {
        let failed = self.progress.lock().failed_slots.clone();
        let status_of = |slot: usize| {
            failed
                .iter()
                .find(|(s, _)| *s == slot)
                .map(|(_, msg)| PartitionStatus::Failed(msg.clone()))
                .unwrap_or(PartitionStatus::RolledBack)
        };
        let plans = self.plans.lock().clone();
        let slices = self.sorted.get().map(|run| run.slices.as_slice()).unwrap_or(&[]);
        let mut out = Vec::new();
        for (slot, slice) in slices.iter().enumerate() {
            match plans.get(slot).cloned().flatten() {
                Some(plan) => out.push(plan.outcome(status_of(slot))),
                None => out.push(PartitionOutcome {
                    lo: slice.lo,
                    dir: String::new(),
                    kind: if slice.existing.is_some() {
                        PartitionKind::Merge
                    } else {
                        PartitionKind::New
                    },
                    rows_added: slice.len() as u64,
                    rows_total: 0,
                    status: status_of(slot),
                }),
            }
        }
        out
    }

    fn try_result(&self) -> Option<Result<CommitSummary>> {
        self.result.lock().as_ref().map(|r| match r {
            Ok(summary) => Ok(summary.clone()),
            Err(err) => Err(clone_error(err)),
        })
    }
}

/// Handle on a submitted out-of-order commit.
pub struct CommitHandle {
    commit: Arc<O3Commit>,
    bus: Arc<MessageBus>,
}

impl CommitHandle {
    pub(crate) fn new(commit: Arc<O3Commit>, bus: Arc<MessageBus>) -> Self {
        Self { commit, bus }
    }

    /// Commit identifier, unique per engine.
    pub fn id(&self) -> u64 {
        self.commit.id
    }

    /// Commit number the table publishes on success.
    pub fn txn(&self) -> u64 {
        self.commit.txn
    }

    /// Current phase.
    pub fn phase(&self) -> CommitPhase {
        self.commit.phase()
    }

    /// Whether the commit reached `Committed` or `Failed`.
    pub fn is_resolved(&self) -> bool {
        self.commit.result.lock().is_some()
    }

    /// Per-partition outcomes; empty until resolved.
    pub fn partition_outcomes(&self) -> Vec<PartitionOutcome> {
        self.commit.outcomes.lock().clone()
    }

    /// Blocks until the commit resolves, running queued pipeline work meanwhile.
    pub fn wait(&self) -> Result<CommitSummary> {
        loop {
            if let Some(result) = self.commit.try_result() {
                return result;
            }
            if super::help_one(&self.bus) {
                continue;
            }
            let mut result = self.commit.result.lock();
            if result.is_none() {
                let _ = self
                    .commit
                    .resolved
                    .wait_for(&mut result, Duration::from_millis(1));
            }
        }
    }
}

impl std::fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandle")
            .field("id", &self.commit.id)
            .field("table", &self.commit.table.name())
            .field("txn", &self.commit.txn)
            .field("phase", &self.phase())
            .finish()
    }
}
