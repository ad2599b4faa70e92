use std::sync::Arc;

use tracing::debug;

use super::bus::{MessageBus, O3Task, OpenColumnTask, PartitionTask};
use super::commit::{O3Commit, PartitionPlan, SourcePartition};
use super::merge::MergePlan;
use super::publish;
use crate::storage::partition::{read_column_bytes, temp_dir_name};
use crate::storage::schema::{read_i64, split_partition_name};
use crate::storage::{PartitionEntry, PartitionKind};
use crate::types::{Result, StoreError, Timestamp};

/// Plans one partition, prepares its target directory and fans out one open task per column.
pub(crate) fn run(bus: &MessageBus, task: PartitionTask) -> Result<()> {
    let PartitionTask { commit, slot } = task;
    let plan = commit.set_plan(plan(&commit, slot)?)?;
    prepare_target(&commit, &plan)?;
    debug!(
        table = %commit.table.name(),
        commit = commit.id,
        slot,
        kind = ?plan.kind,
        dir = %plan.entry.dir_name(),
        rows = plan.rows_written(),
        "o3.partition.planned"
    );
    for column in 0..plan.columns.len() {
        publish(
            bus,
            O3Task::OpenColumn(OpenColumnTask {
                commit: Arc::clone(&commit),
                slot,
                column,
            }),
        )?;
    }
    Ok(())
}

/// Classifies the slice in `slot` as append, merge, split or new and works out
/// the resulting partition entries.
fn plan(commit: &O3Commit, slot: usize) -> Result<PartitionPlan> {
    let run = commit.sorted()?;
    let slice = run.slices.get(slot).cloned().ok_or_else(|| {
        StoreError::ConsistencyViolation(format!("commit {} has no slice {slot}", commit.id))
    })?;
    let incoming = &run.timestamps[slice.start..slice.end];
    let (first, last) = match (incoming.first(), incoming.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => {
            return Err(StoreError::ConsistencyViolation(format!(
                "commit {} has an empty slice {slot}",
                commit.id
            )))
        }
    };
    let table = &commit.table;
    let schema = table.schema();
    let columns = schema.columns.len();
    let added = slice.len() as u64;

    let Some(index) = slice.existing else {
        let name = schema.partition_by.partition_name(slice.lo)?;
        let entry = PartitionEntry {
            lo: slice.lo,
            hi: slice.hi,
            name,
            name_txn: None,
            rows: added,
            min_ts: first,
            max_ts: last,
        };
        let dir = table.dir().join(entry.dir_name());
        return Ok(PartitionPlan::new(slot, PartitionKind::New, slice, dir, entry, columns));
    };

    let existing = commit.base.partitions[index].clone();
    let source = SourcePartition {
        index,
        entry: existing.clone(),
        dir: table.dir().join(existing.dir_name()),
    };

    if first >= existing.max_ts {
        let mut entry = existing.clone();
        entry.rows += added;
        entry.max_ts = last;
        let mut plan = PartitionPlan::new(
            slot,
            PartitionKind::Append,
            slice,
            source.dir.clone(),
            entry,
            columns,
        );
        plan.source = Some(source);
        return Ok(plan);
    }

    let ts_col = &schema.columns[schema.timestamp_index];
    let existing_ts: Vec<Timestamp> =
        read_column_bytes(table.files(), &source.dir, &ts_col.name, ts_col.ty, existing.rows)?
            .chunks_exact(8)
            .map(read_i64)
            .collect();
    let prefix = existing_ts.partition_point(|&ts| ts < first);

    let mut plan = if prefix > 0 && prefix as u64 >= commit.split_min_rows {
        let name = split_partition_name(first)?;
        let entry = PartitionEntry {
            lo: first,
            hi: existing.hi,
            name,
            name_txn: None,
            rows: existing.rows - prefix as u64 + added,
            min_ts: first,
            max_ts: existing.max_ts.max(last),
        };
        let mut base_after = existing.clone();
        base_after.rows = prefix as u64;
        base_after.max_ts = existing_ts[prefix - 1];
        base_after.hi = first;
        let dir = table.dir().join(entry.dir_name());
        let mut plan = PartitionPlan::new(slot, PartitionKind::Split, slice, dir, entry, columns);
        plan.base_after = Some(base_after);
        plan.merge = Some(MergePlan::new(prefix, &existing_ts, incoming));
        plan
    } else {
        let mut entry = existing.clone();
        entry.rows += added;
        entry.min_ts = existing.min_ts.min(first);
        entry.max_ts = existing.max_ts.max(last);
        let (dir, in_place) = if commit.rename {
            entry.name_txn = Some(commit.txn);
            let tmp = temp_dir_name(&existing.dir_name(), commit.txn);
            (table.dir().join(tmp), false)
        } else {
            (source.dir.clone(), true)
        };
        let mut plan = PartitionPlan::new(slot, PartitionKind::Merge, slice, dir, entry, columns);
        plan.in_place = in_place;
        plan.merge = Some(MergePlan::new(0, &existing_ts, incoming));
        plan
    };
    plan.source = Some(source);
    Ok(plan)
}

/// Creates the directory a plan writes into, clearing leftovers of an earlier abandoned attempt.
fn prepare_target(commit: &O3Commit, plan: &PartitionPlan) -> Result<()> {
    if plan.kind == PartitionKind::Append || plan.in_place {
        return Ok(());
    }
    let ff = commit.table.files();
    if ff.exists(&plan.target_dir) {
        ff.remove_dir_all(&plan.target_dir)?;
    }
    ff.mkdirs(&plan.target_dir)
}
