use tracing::debug;

use super::bus::CopyTask;
use super::merge::verify_timestamps;
use crate::storage::partition::read_column_bytes;
use crate::types::{Result, StoreError};

/// Writes one column of one partition: a plain append of the incoming rows,
/// or the merge of the existing column with them.
pub(crate) fn run(task: CopyTask) -> Result<()> {
    let CopyTask {
        commit,
        slot,
        column,
    } = task;
    let plan = commit.plan(slot)?;
    let run = commit.sorted()?;
    let table = &commit.table;
    let schema = table.schema();
    let def = &schema.columns[column];
    let shift = def.ty.size_shift();

    let mut mem = plan.columns[column].lock().take().ok_or_else(|| {
        StoreError::ConsistencyViolation(format!(
            "column {} of {} was not opened",
            def.name,
            plan.entry.dir_name()
        ))
    })?;
    let incoming = run
        .batch
        .column_rows(column, plan.slice.start, plan.slice.end);

    match &plan.merge {
        None => mem.append_bytes(incoming)?,
        Some(merge) => {
            let src = plan.source()?;
            let existing =
                read_column_bytes(table.files(), &src.dir, &def.name, def.ty, src.entry.rows)?;
            let merged = merge.apply(&existing, incoming, def.ty.size());
            if column == schema.timestamp_index {
                verify_timestamps(&merged, plan.entry.lo, plan.entry.hi)?;
            }
            mem.append_bytes(&merged)?;
        }
    }

    let expected = (plan.write_offset_rows() + plan.rows_written()) << shift;
    if mem.size() != expected {
        return Err(StoreError::ConsistencyViolation(format!(
            "{} holds {} bytes after copy, expected {expected}",
            mem.path().display(),
            mem.size()
        )));
    }
    if table.options().commit_fsync {
        mem.sync()?;
    }
    mem.close()?;
    debug!(
        commit = commit.id,
        slot,
        column = %def.name,
        bytes = expected,
        "o3.copy.done"
    );
    Ok(())
}
