use tracing::debug;

use super::bus::{CopyTask, MessageBus, O3Task, OpenColumnTask};
use super::publish;
use crate::primitives::vm::AppendMemory;
use crate::types::Result;

/// Opens the target file of one column and hands it to a copy task.
///
/// Fresh targets are sized up front for every row the copy will write, so
/// running out of space surfaces here rather than halfway through the copy.
pub(crate) fn run(bus: &MessageBus, task: OpenColumnTask) -> Result<()> {
    let OpenColumnTask {
        commit,
        slot,
        column,
    } = task;
    let plan = commit.plan(slot)?;
    let table = &commit.table;
    let ff = table.files();
    let def = &table.schema().columns[column];
    let shift = def.ty.size_shift();
    let path = plan.column_target(&def.name);
    let offset = plan.write_offset_rows() << shift;

    if offset == 0 {
        let fh = ff.open_rw(&path)?;
        ff.truncate(&fh, 0)?;
        ff.truncate(&fh, plan.rows_written() << shift)?;
    }
    let mem = AppendMemory::open(ff.clone(), &path, table.options().page_bits, offset)?;
    *plan.columns[column].lock() = Some(mem);
    debug!(
        commit = commit.id,
        slot,
        column = %def.name,
        path = %path.display(),
        offset,
        "o3.open_column.done"
    );
    publish(
        bus,
        O3Task::Copy(CopyTask {
            commit,
            slot,
            column,
        }),
    )
}
