use std::sync::Arc;

use tracing::debug;

use super::bus::{MessageBus, O3Task, PartitionTask, SortTask};
use super::commit::SortedRun;
use super::publish;
use crate::storage::partition::slice_by_partition;
use crate::types::{Result, Timestamp};

/// Sorts the batch, cuts it per partition and fans out one partition task per slice.
pub(crate) fn run(bus: &MessageBus, task: SortTask) -> Result<()> {
    let SortTask { commit, batch } = task;
    let sorted = if batch.is_sorted() {
        batch
    } else {
        batch.stable_sorted()
    };
    let timestamps: Vec<Timestamp> = sorted.timestamps().collect();
    let slices = slice_by_partition(
        &commit.base,
        commit.table.schema().partition_by,
        &timestamps,
    )?;
    let slots = slices.len();
    debug!(
        table = %commit.table.name(),
        commit = commit.id,
        rows = timestamps.len(),
        partitions = slots,
        "o3.sort.done"
    );
    commit.set_sorted(SortedRun {
        batch: sorted,
        timestamps,
        slices,
    })?;
    for slot in 0..slots {
        publish(
            bus,
            O3Task::Partition(PartitionTask {
                commit: Arc::clone(&commit),
                slot,
            }),
        )?;
    }
    Ok(())
}
