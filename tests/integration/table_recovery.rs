#![allow(missing_docs)]

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chronocol::types::{Result, StoreError};
use chronocol::{Engine, EngineConfig};
use common::{checksums, contents, engine_with_table, init_tracing, table_dir, tagged, DAY};
use tempfile::tempdir;

fn seeded(root: &Path) -> Result<Vec<(String, u32)>> {
    let (engine, id) = engine_with_table(EngineConfig::inline(root))?;
    engine.write(id, &tagged(&[10, 20, 30], 0))?;
    engine.write(id, &tagged(&[DAY + 5], 3))?;
    checksums(&engine, id)
}

fn grow(path: &Path, bytes: usize) {
    let mut file = OpenOptions::new().append(true).open(path).expect("open");
    file.write_all(&vec![0xAB; bytes]).expect("append");
}

#[test]
fn leftovers_of_an_interrupted_commit_are_cleared_on_open() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let published = seeded(root.path())?;
    let dir = table_dir(root.path());

    fs::create_dir(dir.join("1970-01-01.o3tmp-3"))?;
    fs::write(dir.join("1970-01-01.o3tmp-3").join("ts.d"), [1u8; 16])?;
    fs::create_dir(dir.join("1970-01-03"))?;
    fs::write(dir.join("_txn.tmp"), b"{")?;
    fs::write(dir.join("1970-01-01").join("ts.d.o3"), [7u8; 5])?;
    grow(&dir.join("1970-01-02").join("qty.d"), 16);
    grow(&dir.join("1970-01-02").join("ts.d"), 8);

    init_tracing();
    let engine = Engine::open(EngineConfig::inline(root.path()))?;
    let id = engine.open_table("trades")?;
    let report = engine.recovery_report(id)?;
    assert!(!report.is_clean());

    let mut removed = report.removed_dirs.clone();
    removed.sort();
    assert_eq!(removed, vec!["1970-01-01.o3tmp-3", "1970-01-03"]);
    let mut files = report.removed_files.clone();
    files.sort();
    assert_eq!(files, vec!["1970-01-01/ts.d.o3", "_txn.tmp"]);
    let mut truncated = report.truncated.clone();
    truncated.sort();
    assert_eq!(truncated, vec!["1970-01-02/qty.d", "1970-01-02/ts.d"]);
    assert!(report.rolled_forward.is_empty());

    assert_eq!(checksums(&engine, id)?, published);
    assert_eq!(fs::metadata(dir.join("1970-01-02").join("qty.d"))?.len(), 8);
    assert_eq!(common::dir_names(&dir), vec!["1970-01-01", "1970-01-02", "_lock", "_meta", "_txn"]);

    engine.write(id, &tagged(&[DAY + 6], 4))?;
    let ts: Vec<i64> = contents(&engine, id)?.into_iter().map(|(t, _)| t).collect();
    assert_eq!(ts, vec![10, 20, 30, DAY + 5, DAY + 6]);
    Ok(())
}

#[test]
fn clean_table_reopens_without_repairs() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let published = seeded(root.path())?;
    let engine = Engine::open(EngineConfig::inline(root.path()))?;
    let id = engine.open_table("trades")?;
    assert!(engine.recovery_report(id)?.is_clean());
    assert_eq!(checksums(&engine, id)?, published);
    assert_eq!(engine.open_table("trades")?, id);
    assert_eq!(engine.list_tables()?, vec!["trades"]);
    Ok(())
}

#[test]
fn short_column_file_is_reported_not_repaired() -> Result<()> {
    let root = tempdir().expect("tempdir");
    seeded(root.path())?;
    let path = table_dir(root.path()).join("1970-01-01").join("px.d");
    let file = OpenOptions::new().write(true).open(&path)?;
    file.set_len(16)?;
    drop(file);

    let engine = Engine::open(EngineConfig::inline(root.path()))?;
    let err = engine.open_table("trades").unwrap_err();
    assert!(matches!(err, StoreError::ConsistencyViolation(_)), "{err}");
    assert_eq!(fs::metadata(&path)?.len(), 16);
    Ok(())
}

#[test]
fn second_writer_on_the_same_table_is_rejected() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let (engine, _id) = engine_with_table(EngineConfig::inline(root.path()))?;
    let other = Engine::open(EngineConfig::inline(root.path()))?;
    let err = other.open_table("trades").unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)), "{err}");

    drop(engine);
    let id = other.open_table("trades")?;
    assert_eq!(other.reader(id)?.row_count(), 0);
    Ok(())
}

#[test]
fn unknown_table_is_not_found() -> Result<()> {
    let root = tempdir().expect("tempdir");
    let engine = Engine::open(EngineConfig::inline(root.path()))?;
    assert!(matches!(engine.open_table("nope"), Err(StoreError::NotFound(_))));
    assert!(engine.list_tables()?.is_empty());
    Ok(())
}
