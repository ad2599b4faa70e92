#![allow(missing_docs)]

mod common;

use chronocol::storage::{PartitionKind, PartitionStatus, Value};
use chronocol::types::Result;
use chronocol::{CommitPhase, EngineConfig};
use common::{contents, engine_with_table, small_pages, tagged, table_dir, DAY};
use proptest::prelude::*;
use tempfile::tempdir;

#[test]
fn older_rows_interleave_with_committed_partition() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (engine, id) = engine_with_table(small_pages(root.path(), 0))?;
    let t0 = 1_577_836_800_000_000; // 2020-01-01
    engine.write(id, &tagged(&[t0 + 10, t0 + 20, t0 + 30], 0))?;

    let handle = engine.submit_out_of_order_batch(id, &tagged(&[t0 + 25, t0 + 5, t0 + 15], 100))?;
    let summary = handle.wait()?;
    assert_eq!(handle.phase(), CommitPhase::Committed);
    assert!(summary.out_of_order);
    assert_eq!(summary.rows, 3);

    let reader = engine.reader(id)?;
    assert_eq!(reader.row_count(), 6);
    let ts: Vec<i64> = reader.timestamps()?.into_iter().map(|t| t - t0).collect();
    assert_eq!(ts, vec![5, 10, 15, 20, 25, 30]);
    assert_eq!(reader.partitions().len(), 1);
    assert_eq!(reader.partitions()[0].dir_name(), "2020-01-01.2");
    assert_eq!(
        reader.read_column("qty")?,
        [101, 0, 102, 1, 100, 2].map(Value::Long).to_vec()
    );
    Ok(())
}

#[test]
fn batch_straddling_a_boundary_yields_one_outcome_per_partition() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (engine, id) = engine_with_table(small_pages(root.path(), 0))?;
    engine.write(id, &tagged(&[DAY + 100, DAY + 200], 0))?;

    let batch = [DAY + 150, DAY - 1, 3, DAY + 300, DAY + 50];
    let summary = engine.write(id, &tagged(&batch, 10))?;
    assert_eq!(summary.partitions.len(), 2);
    assert_eq!(
        summary.partitions.iter().map(|p| p.rows_added).sum::<u64>(),
        batch.len() as u64
    );
    assert_eq!(summary.partitions[0].kind, PartitionKind::New);
    assert_eq!(summary.partitions[0].rows_added, 2);
    assert_eq!(summary.partitions[1].kind, PartitionKind::Merge);
    assert_eq!(summary.partitions[1].rows_total, 5);
    assert!(summary
        .partitions
        .iter()
        .all(|p| p.status == PartitionStatus::Published));

    let ts: Vec<i64> = contents(&engine, id)?.into_iter().map(|(t, _)| t).collect();
    assert_eq!(
        ts,
        vec![3, DAY - 1, DAY + 50, DAY + 100, DAY + 150, DAY + 200, DAY + 300]
    );
    Ok(())
}

#[test]
fn batch_spanning_two_committed_partitions_merges_both() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (engine, id) = engine_with_table(small_pages(root.path(), 0))?;
    engine.write(id, &tagged(&[10, 20, 30, DAY + 10, DAY + 20, DAY + 30], 0))?;

    let batch = [DAY + 15, 15, DAY + 40, 5];
    let summary = engine.write(id, &tagged(&batch, 50))?;
    assert_eq!(summary.txn, 2);
    assert_eq!(summary.partitions.len(), 2);
    assert_eq!(
        summary.partitions.iter().map(|p| p.rows_added).sum::<u64>(),
        batch.len() as u64
    );
    for (outcome, lo) in summary.partitions.iter().zip([0, DAY]) {
        assert_eq!(outcome.lo, lo);
        assert_eq!(outcome.kind, PartitionKind::Merge);
        assert_eq!(outcome.rows_added, 2);
        assert_eq!(outcome.rows_total, 5);
        assert_eq!(outcome.status, PartitionStatus::Published);
    }

    let reader = engine.reader(id)?;
    let dirs: Vec<String> = reader.partitions().iter().map(|p| p.dir_name()).collect();
    assert_eq!(dirs, vec!["1970-01-01.2", "1970-01-02.2"]);
    assert_eq!(
        contents(&engine, id)?,
        vec![
            (5, Value::Long(53)),
            (10, Value::Long(0)),
            (15, Value::Long(51)),
            (20, Value::Long(1)),
            (30, Value::Long(2)),
            (DAY + 10, Value::Long(3)),
            (DAY + 15, Value::Long(50)),
            (DAY + 20, Value::Long(4)),
            (DAY + 30, Value::Long(5)),
            (DAY + 40, Value::Long(52)),
        ]
    );
    Ok(())
}

#[test]
fn split_keeps_prefix_in_place_and_reader_goes_stale() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let mut config = small_pages(root.path(), 0);
    config.o3_partition_split_min_rows = 4;
    let (engine, id) = engine_with_table(config)?;
    let existing: Vec<i64> = (0..10).map(|i| i * 100).collect();
    engine.write(id, &tagged(&existing, 0))?;
    let mut reader = engine.reader(id)?;

    let summary = engine.write(id, &tagged(&[650, 420], 50))?;
    assert_eq!(summary.partitions[0].kind, PartitionKind::Split);
    assert!(reader.is_stale());
    assert!(reader.refresh_partition_list());
    assert!(!reader.is_stale());

    let parts = reader.partitions();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].dir_name(), "1970-01-01");
    assert_eq!((parts[0].rows, parts[0].max_ts, parts[0].hi), (5, 400, 420));
    assert_eq!(parts[1].dir_name(), "1970-01-01T000000-000420");
    assert_eq!((parts[1].lo, parts[1].rows, parts[1].max_ts), (420, 7, 900));

    let ts = reader.timestamps()?;
    assert_eq!(ts, vec![0, 100, 200, 300, 400, 420, 500, 600, 650, 700, 800, 900]);

    // Prefix rows were not rewritten; the stale tail is trimmed on the next open.
    drop(reader);
    engine.close_table(id)?;
    let id = engine.open_table("trades")?;
    assert_eq!(engine.recovery_report(id)?.truncated.len(), 3);
    assert_eq!(engine.reader(id)?.timestamps()?, ts);
    Ok(())
}

#[test]
fn rows_on_both_sides_of_a_split_land_in_their_own_partitions() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let mut config = small_pages(root.path(), 0);
    config.o3_partition_split_min_rows = 2;
    let (engine, id) = engine_with_table(config)?;
    engine.write(id, &tagged(&[10, 20, 30, 40], 0))?;
    engine.write(id, &tagged(&[35], 10))?;
    let summary = engine.write(id, &tagged(&[41, 15], 20))?;

    let kinds: Vec<PartitionKind> = summary.partitions.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![PartitionKind::Merge, PartitionKind::Append]);
    let ts: Vec<i64> = contents(&engine, id)?.into_iter().map(|(t, _)| t).collect();
    assert_eq!(ts, vec![10, 15, 20, 30, 35, 40, 41]);
    Ok(())
}

#[test]
fn in_place_rewrite_when_rename_is_switched_off() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (engine, id) = engine_with_table(small_pages(root.path(), 0))?;
    engine.write(id, &tagged(&[10, 20, 30], 0))?;
    engine.rename_flag().set(false);
    let summary = engine.write(id, &tagged(&[15], 7))?;
    assert_eq!(summary.partitions[0].dir, "1970-01-01");

    let files = common::dir_names(&table_dir(root.path()).join("1970-01-01"));
    assert_eq!(files, vec!["px.d", "qty.d", "ts.d"]);
    assert_eq!(
        contents(&engine, id)?,
        vec![
            (10, Value::Long(0)),
            (15, Value::Long(7)),
            (20, Value::Long(1)),
            (30, Value::Long(2)),
        ]
    );

    engine.rename_flag().set(true);
    let summary = engine.write(id, &tagged(&[16], 8))?;
    assert_eq!(summary.partitions[0].dir, "1970-01-01.3");
    Ok(())
}

fn expected_order(existing: &[i64], incoming: &[i64]) -> Vec<(i64, Value)> {
    let mut all: Vec<(i64, u8, usize)> = existing
        .iter()
        .enumerate()
        .map(|(i, &t)| (t, 0, i))
        .chain(incoming.iter().enumerate().map(|(i, &t)| (t, 1, i)))
        .collect();
    all.sort();
    all.into_iter()
        .map(|(t, origin, i)| {
            let tag = if origin == 0 { i as i64 } else { 10_000 + i as i64 };
            (t, Value::Long(tag))
        })
        .collect()
}

fn run_case(existing: Vec<i64>, incoming: Vec<i64>, split_min_rows: u64, rename: bool) -> Result<()> {
    let root = tempdir().expect("tempdir");
    let mut config = EngineConfig::inline(root.path());
    config.page_bits = 6;
    config.o3_partition_split_min_rows = split_min_rows;
    config.o3_rename_enabled = rename;
    let (engine, id) = engine_with_table(config)?;
    if !existing.is_empty() {
        engine.write(id, &tagged(&existing, 0))?;
    }
    engine.submit_out_of_order_batch(id, &tagged(&incoming, 10_000))?.wait()?;
    let got = contents(&engine, id)?;
    assert_eq!(got, expected_order(&existing, &incoming));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn merged_table_is_the_stable_union(
        mut existing in proptest::collection::vec(0i64..3 * DAY, 0..40),
        incoming in proptest::collection::vec(prop_oneof![0i64..60, 0i64..3 * DAY], 1..40),
        split_min_rows in prop_oneof![Just(1u64), Just(3u64), Just(1_000u64)],
        rename in any::<bool>(),
    ) {
        existing.sort();
        run_case(existing, incoming, split_min_rows, rename).unwrap();
    }

    #[test]
    fn duplicate_timestamps_keep_ingestion_order(
        incoming in proptest::collection::vec(0i64..8, 1..64),
    ) {
        run_case(Vec::new(), incoming, 1_000, true).unwrap();
    }
}
