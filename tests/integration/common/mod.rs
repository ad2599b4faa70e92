#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use chronocol::primitives::io::{
    DirEntryInfo, FileHandle, FilesFacade, SharedFilesFacade, StdFilesFacade,
};
use chronocol::storage::{ColumnType, PartitionBy, Row, TableSchema, Value};
use chronocol::types::{Result, StoreError};
use chronocol::{Engine, EngineConfig, TableId};
use memmap2::MmapMut;
use parking_lot::Mutex;

pub const DAY: i64 = 86_400_000_000;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("CHRONOCOL_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn trades() -> TableSchema {
    TableSchema::new("trades", "ts", PartitionBy::Day)
        .column("qty", ColumnType::Long)
        .column("px", ColumnType::Double)
}

/// Rows whose `qty` is `tag + position`, so every row can be traced back to its origin.
pub fn tagged(ts: &[i64], tag: i64) -> Vec<Row> {
    ts.iter()
        .enumerate()
        .map(|(i, &t)| {
            Row::new(t)
                .with(Value::Long(tag + i as i64))
                .with(Value::Double(t as f64 * 0.25))
        })
        .collect()
}

pub fn small_pages(root: &Path, workers: usize) -> EngineConfig {
    let mut config = if workers == 0 {
        EngineConfig::inline(root)
    } else {
        EngineConfig::new(root)
    };
    config.worker_count = workers;
    config.page_bits = 6;
    config
}

pub fn engine_with_table(config: EngineConfig) -> Result<(Engine, TableId)> {
    init_tracing();
    let engine = Engine::open(config)?;
    let id = engine.create_table(trades())?;
    Ok((engine, id))
}

/// Timestamps and `qty` tags of every row in reader order.
pub fn contents(engine: &Engine, id: TableId) -> Result<Vec<(i64, Value)>> {
    let reader = engine.reader(id)?;
    let ts = reader.timestamps()?;
    let qty = reader.read_column("qty")?;
    Ok(ts.into_iter().zip(qty).collect())
}

/// CRC of every published partition, keyed by directory name.
pub fn checksums(engine: &Engine, id: TableId) -> Result<Vec<(String, u32)>> {
    let reader = engine.reader(id)?;
    (0..reader.partitions().len())
        .map(|i| Ok((reader.partitions()[i].dir_name(), reader.partition_checksum(i)?)))
        .collect()
}

pub fn dir_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// File operation a [`FaultyFiles`] rule can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOp {
    OpenRw,
    Truncate,
    Map,
    Rename,
}

struct Rule {
    op: FaultOp,
    needle: String,
    /// Matching calls let through before the first failure.
    skip: usize,
    /// Failures injected before the rule goes quiet; `None` fails forever.
    times: Option<usize>,
    seen: AtomicUsize,
}

/// Facade that fails selected operations on paths containing a substring.
pub struct FaultyFiles {
    inner: SharedFilesFacade,
    rules: Mutex<Vec<Rule>>,
    injected: AtomicUsize,
}

impl FaultyFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdFilesFacade::shared(),
            rules: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        })
    }

    /// Fails every `op` on a path containing `needle` after `skip` matching calls succeeded.
    pub fn fail(&self, op: FaultOp, needle: &str, skip: usize) {
        self.push(op, needle, skip, None);
    }

    /// Fails the first `times` matching calls, then lets everything through.
    pub fn fail_times(&self, op: FaultOp, needle: &str, times: usize) {
        self.push(op, needle, 0, Some(times));
    }

    fn push(&self, op: FaultOp, needle: &str, skip: usize, times: Option<usize>) {
        self.rules.lock().push(Rule {
            op,
            needle: needle.to_string(),
            skip,
            times,
            seen: AtomicUsize::new(0),
        });
    }

    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, op: FaultOp, path: &Path, name: &'static str) -> Result<()> {
        let text = path.to_string_lossy();
        let rules = self.rules.lock();
        for rule in rules.iter().filter(|r| r.op == op && text.contains(&r.needle)) {
            let n = rule.seen.fetch_add(1, Ordering::SeqCst);
            let active = n >= rule.skip && rule.times.map_or(true, |t| n < rule.skip + t);
            if active {
                self.injected.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::storage_io(
                    name,
                    path,
                    io::Error::other("injected fault"),
                ));
            }
        }
        Ok(())
    }
}

impl FilesFacade for FaultyFiles {
    fn open_rw(&self, path: &Path) -> Result<FileHandle> {
        self.check(FaultOp::OpenRw, path, "open")?;
        self.inner.open_rw(path)
    }

    fn open_ro(&self, path: &Path) -> Result<FileHandle> {
        self.inner.open_ro(path)
    }

    fn length(&self, fh: &FileHandle) -> Result<u64> {
        self.inner.length(fh)
    }

    fn truncate(&self, fh: &FileHandle, len: u64) -> Result<()> {
        self.check(FaultOp::Truncate, fh.path(), "truncate")?;
        self.inner.truncate(fh, len)
    }

    fn map_rw(&self, fh: &FileHandle, offset: u64, len: usize) -> Result<MmapMut> {
        self.check(FaultOp::Map, fh.path(), "map")?;
        self.inner.map_rw(fh, offset, len)
    }

    fn read_at(&self, fh: &FileHandle, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(fh, off, dst)
    }

    fn fsync(&self, fh: &FileHandle) -> Result<()> {
        self.inner.fsync(fh)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.check(FaultOp::Rename, from, "rename")?;
        self.inner.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.remove_dir_all(path)
    }

    fn mkdirs(&self, path: &Path) -> Result<()> {
        self.inner.mkdirs(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        self.inner.list_dir(path)
    }

    fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.inner.write_file_atomic(path, bytes)
    }
}

pub fn table_dir(root: &Path) -> PathBuf {
    root.join("trades")
}
