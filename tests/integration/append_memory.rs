#![allow(missing_docs)]

mod common;

use chronocol::primitives::io::{FilesFacade, StdFilesFacade};
use chronocol::primitives::vm::{AppendMemory, PagedMemory};
use chronocol::types::{Result, StoreError};
use common::{FaultOp, FaultyFiles};
use tempfile::tempdir;

#[test]
fn appended_records_read_back_in_order_across_pages() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("col.d");
    let mut mem = AppendMemory::open(StdFilesFacade::shared(), &path, 6, 0)?;
    for i in 0..10u8 {
        let record: Vec<u8> = (0..20).map(|j| i * 20 + j).collect();
        mem.append_bytes(&record)?;
    }
    assert_eq!(mem.size(), 200);
    mem.close()?;

    let bytes = StdFilesFacade.read_file(&path)?;
    assert_eq!(bytes.len(), 200);
    assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
    Ok(())
}

#[test]
fn truncate_then_reopen_is_empty() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("col.d");
    {
        let mut mem = AppendMemory::open(StdFilesFacade::shared(), &path, 6, 0)?;
        mem.append_bytes(&[9u8; 150])?;
        mem.truncate()?;
        assert_eq!(mem.size(), 0);
        mem.truncate()?;
        assert_eq!(mem.size(), 0);
        assert_eq!(mem.current_page(), 0);
        mem.close()?;
    }
    let mut mem = AppendMemory::open(StdFilesFacade::shared(), &path, 6, 0)?;
    assert_eq!(mem.size(), 0);
    mem.put_i64(42)?;
    mem.close()?;
    assert_eq!(std::fs::metadata(&path)?.len(), 8);
    Ok(())
}

#[test]
fn close_leaves_exact_length() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("col.d");
    let mut mem = AppendMemory::open(StdFilesFacade::shared(), &path, 12, 0)?;
    assert_eq!(mem.page_size(), 4096);
    mem.append_bytes(b"0123456789")?;
    assert!(std::fs::metadata(&path)?.len() >= 4096);
    mem.close()?;
    assert_eq!(std::fs::metadata(&path)?.len(), 10);
    assert_eq!(std::fs::read(&path)?, b"0123456789");
    Ok(())
}

#[test]
fn failed_rollover_reports_the_mapping_error() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("col.d");
    let files = FaultyFiles::new();
    files.fail(FaultOp::Map, "col.d", 1);
    let mut mem = AppendMemory::open(files.clone(), &path, 6, 0)?;
    mem.append_bytes(&[1u8; 64])?;
    let err = mem.append_bytes(&[2u8; 8]).unwrap_err();
    assert!(matches!(err, StoreError::StorageIo { op: "map", .. }), "{err}");
    assert_eq!(mem.mapped_pages(), 0);
    assert_eq!(files.injected(), 1);
    Ok(())
}
