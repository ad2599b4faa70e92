#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use chronocol::primitives::io::SharedFilesFacade;
use chronocol::storage::{PartitionStatus, Value};
use chronocol::types::{Result, StoreError};
use chronocol::{CommitPhase, Engine, TableId};
use common::{
    checksums, contents, dir_names, engine_with_table, small_pages, table_dir, tagged, FaultOp,
    FaultyFiles, DAY,
};
use tempfile::tempdir;

fn faulty_engine(root: &std::path::Path) -> Result<(Arc<FaultyFiles>, Engine, TableId)> {
    faulty_engine_with_workers(root, 0)
}

fn faulty_engine_with_workers(
    root: &std::path::Path,
    workers: usize,
) -> Result<(Arc<FaultyFiles>, Engine, TableId)> {
    let files = FaultyFiles::new();
    let shared: SharedFilesFacade = files.clone();
    let mut config = small_pages(root, workers);
    config.files = shared;
    let (engine, id) = engine_with_table(config)?;
    Ok((files, engine, id))
}

#[test]
fn failed_page_mapping_leaves_published_partitions_untouched() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    let existing: Vec<i64> = (0..12).map(|i| i * 10).collect();
    engine.write(id, &tagged(&existing, 0))?;
    let before = checksums(&engine, id)?;
    let rows_before = contents(&engine, id)?;

    // The second page of any rebuilt column cannot be mapped.
    files.fail(FaultOp::Map, ".o3tmp-", 1);
    let incoming: Vec<i64> = (0..12).rev().map(|i| i * 10 + 5).collect();
    let handle = engine.submit_out_of_order_batch(id, &tagged(&incoming, 100))?;
    let err = handle.wait().unwrap_err();
    assert!(matches!(err, StoreError::StorageIo { op: "map", .. }), "{err}");
    assert_eq!(handle.phase(), CommitPhase::Failed);
    assert!(files.injected() >= 1);
    let outcomes = handle.partition_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].status, PartitionStatus::Failed(_)));

    assert_eq!(checksums(&engine, id)?, before);
    assert_eq!(contents(&engine, id)?, rows_before);
    assert_eq!(engine.reader(id)?.txn(), 1);
    let leftovers: Vec<String> = dir_names(&table_dir(root.path()))
        .into_iter()
        .filter(|name| name.contains(".o3tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    files.clear();
    let summary = engine.write(id, &tagged(&incoming, 100))?;
    assert_eq!(summary.txn, 2);
    assert_eq!(engine.reader(id)?.row_count(), 24);
    Ok(())
}

#[test]
fn failure_in_one_partition_rolls_back_the_append_to_another() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    engine.write(id, &tagged(&[10], 0))?;
    let before = checksums(&engine, id)?;
    let ts_file = table_dir(root.path()).join("1970-01-01").join("ts.d");
    assert_eq!(std::fs::metadata(&ts_file)?.len(), 8);

    files.fail(FaultOp::Map, "1970-01-02", 1);
    let mut batch: Vec<i64> = (0..20).map(|i| DAY + i).collect();
    batch.push(20);
    let err = engine.write(id, &tagged(&batch, 50)).unwrap_err();
    assert!(matches!(err, StoreError::StorageIo { .. }), "{err}");

    assert_eq!(std::fs::metadata(&ts_file)?.len(), 8);
    assert_eq!(checksums(&engine, id)?, before);
    assert!(!table_dir(root.path()).join("1970-01-02").exists());
    assert_eq!(contents(&engine, id)?, vec![(10, Value::Long(0))]);

    files.clear();
    let summary = engine.write(id, &tagged(&batch, 50))?;
    assert_eq!(summary.partitions.len(), 2);
    assert_eq!(engine.reader(id)?.row_count(), 22);
    Ok(())
}

#[test]
fn failed_in_place_rewrite_removes_its_side_files() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    engine.write(id, &tagged(&[10, 20, 30], 0))?;
    engine.rename_flag().set(false);
    let before = checksums(&engine, id)?;

    files.fail(FaultOp::Map, ".d.o3", 0);
    assert!(engine.write(id, &tagged(&[15], 9)).is_err());
    assert_eq!(checksums(&engine, id)?, before);
    let part = table_dir(root.path()).join("1970-01-01");
    assert_eq!(dir_names(&part), vec!["px.d", "qty.d", "ts.d"]);

    files.clear();
    engine.write(id, &tagged(&[15], 9))?;
    let ts: Vec<i64> = contents(&engine, id)?.into_iter().map(|(t, _)| t).collect();
    assert_eq!(ts, vec![10, 15, 20, 30]);
    Ok(())
}

#[test]
fn failed_page_mapping_on_a_worker_pool_leaves_partitions_untouched() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine_with_workers(root.path(), 4)?;
    let existing: Vec<i64> = (0..12).map(|i| i * 10).collect();
    engine.write(id, &tagged(&existing, 0))?;
    let before = checksums(&engine, id)?;
    let rows_before = contents(&engine, id)?;

    files.fail(FaultOp::Map, ".o3tmp-", 1);
    let incoming: Vec<i64> = (0..12).rev().map(|i| i * 10 + 5).collect();
    let err = engine.write(id, &tagged(&incoming, 100)).unwrap_err();
    assert!(matches!(err, StoreError::StorageIo { op: "map", .. }), "{err}");
    assert!(files.injected() >= 1);

    assert_eq!(checksums(&engine, id)?, before);
    assert_eq!(contents(&engine, id)?, rows_before);
    assert_eq!(engine.reader(id)?.txn(), 1);
    assert!(dir_names(&table_dir(root.path()))
        .iter()
        .all(|name| !name.contains(".o3tmp-")));

    files.clear();
    let summary = engine.write(id, &tagged(&incoming, 100))?;
    assert_eq!(summary.txn, 2);
    let ts: Vec<i64> = contents(&engine, id)?.into_iter().map(|(t, _)| t).collect();
    assert_eq!(ts, (0..24).map(|i| i * 5).collect::<Vec<i64>>());
    engine.shutdown();
    Ok(())
}

#[test]
fn transient_swap_failure_is_retried_within_the_commit() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    engine.write(id, &tagged(&[10, 20, 30], 0))?;
    engine.rename_flag().set(false);

    files.fail_times(FaultOp::Rename, "qty.d.o3", 1);
    let summary = engine.write(id, &tagged(&[25], 7))?;
    assert_eq!(summary.txn, 2);
    assert_eq!(files.injected(), 1);

    let part = table_dir(root.path()).join("1970-01-01");
    assert_eq!(dir_names(&part), vec!["px.d", "qty.d", "ts.d"]);
    engine.write(id, &tagged(&[26], 8))?;
    assert_eq!(
        contents(&engine, id)?,
        vec![
            (10, Value::Long(0)),
            (20, Value::Long(1)),
            (25, Value::Long(7)),
            (26, Value::Long(8)),
            (30, Value::Long(2)),
        ]
    );

    engine.close_table(id)?;
    let id = engine.open_table("trades")?;
    assert!(engine.recovery_report(id)?.is_clean());
    Ok(())
}

#[test]
fn unfinished_swap_keeps_the_commit_and_defers_to_recovery() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    engine.write(id, &tagged(&[10, 20, 30], 0))?;
    engine.rename_flag().set(false);

    // `_txn` is written before the side files are swapped in.
    files.fail(FaultOp::Rename, ".d.o3", 0);
    let summary = engine.write(id, &tagged(&[25], 7))?;
    assert_eq!(summary.txn, 2);
    assert_eq!(summary.rows, 1);

    let err = engine.reader(id).unwrap_err();
    assert!(matches!(err, StoreError::NeedsRecovery { .. }), "{err}");
    let err = engine.write(id, &tagged(&[26], 8)).unwrap_err();
    assert!(matches!(err, StoreError::NeedsRecovery { .. }), "{err}");
    assert!(engine.submit_out_of_order_batch(id, &tagged(&[1], 9)).is_err());

    files.clear();
    engine.close_table(id)?;
    let id = engine.open_table("trades")?;
    let report = engine.recovery_report(id)?;
    assert_eq!(report.rolled_forward.len(), 3);
    assert!(report.removed_files.is_empty());
    assert_eq!(engine.reader(id)?.txn(), 2);
    assert_eq!(
        contents(&engine, id)?,
        vec![
            (10, Value::Long(0)),
            (20, Value::Long(1)),
            (25, Value::Long(7)),
            (30, Value::Long(2)),
        ]
    );

    engine.write(id, &tagged(&[26], 8))?;
    assert_eq!(engine.reader(id)?.row_count(), 5);
    engine.close_table(id)?;
    let id = engine.open_table("trades")?;
    assert!(engine.recovery_report(id)?.is_clean());
    Ok(())
}

#[test]
fn failed_open_of_a_new_partition_is_rejected_cleanly() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (files, engine, id) = faulty_engine(root.path())?;
    engine.write(id, &tagged(&[DAY + 10], 0))?;

    files.fail(FaultOp::OpenRw, "1970-01-01", 0);
    let handle = engine.submit_out_of_order_batch(id, &tagged(&[5, 6], 1))?;
    assert!(handle.wait().is_err());
    assert!(handle.is_resolved());
    assert!(!table_dir(root.path()).join("1970-01-01").exists());
    assert_eq!(engine.reader(id)?.partitions().len(), 1);

    files.clear();
    engine.submit_out_of_order_batch(id, &tagged(&[5, 6], 1))?.wait()?;
    assert_eq!(engine.reader(id)?.partitions().len(), 2);
    Ok(())
}
