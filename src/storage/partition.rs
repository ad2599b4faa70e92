//! Partition directories, the published partition list and crash recovery.
//!
//! A table directory holds `_meta`, `_txn`, `_lock` and one directory per
//! partition. A partition directory holds one `<column>.d` file per column.
//! `_txn` is the only source of truth for which directories are live and how
//! many rows each holds; files may be longer than the published row count
//! after a crash, never shorter.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::schema::{ColumnType, PartitionBy, TableSchema};
use crate::primitives::io::SharedFilesFacade;
use crate::primitives::vm::AppendMemory;
use crate::types::{Result, StoreError, Timestamp};

/// Published partition list file.
pub const TXN_FILE: &str = "_txn";
/// Table schema file.
pub const META_FILE: &str = "_meta";
/// Writer lock file.
pub const LOCK_FILE: &str = "_lock";
/// Marker inside the name of a partition directory still being built.
pub const O3_TMP_MARKER: &str = ".o3tmp-";
/// Suffix of a column file rewritten in place, before it replaces the original.
pub const O3_FILE_SUFFIX: &str = ".o3";

/// How a commit touched a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Rows appended after the partition's maximum timestamp.
    Append,
    /// Rows interleaved with existing rows; the partition was rewritten.
    Merge,
    /// The partition's tail was moved into a new adjacent partition holding the merge.
    Split,
    /// A partition created for a previously empty time range.
    New,
}

/// One live partition as recorded in `_txn`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Inclusive lower bound of the time range.
    pub lo: Timestamp,
    /// Exclusive upper bound of the time range.
    pub hi: Timestamp,
    /// Base directory name, derived from `lo`.
    pub name: String,
    /// Commit that last rewrote the partition; part of the directory name when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_txn: Option<u64>,
    /// Published row count.
    pub rows: u64,
    /// Smallest timestamp stored.
    pub min_ts: Timestamp,
    /// Largest timestamp stored.
    pub max_ts: Timestamp,
}

impl PartitionEntry {
    /// Directory name on disk: `name` or `name.<txn>`.
    pub fn dir_name(&self) -> String {
        match self.name_txn {
            Some(txn) => format!("{}.{}", self.name, txn),
            None => self.name.clone(),
        }
    }

    /// Whether `ts` falls inside `[lo, hi)`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.lo <= ts && ts < self.hi
    }
}

/// The set of partitions readers may see, persisted as `_txn`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartitionList {
    /// Number of the commit that published this list.
    pub txn: u64,
    /// Bumped whenever a partition is split, renamed or rewritten in place.
    pub structure_version: u64,
    /// Live partitions ordered by `lo`.
    pub partitions: Vec<PartitionEntry>,
}

impl PartitionList {
    /// Reads `_txn` from `table_dir`; a table without one has no partitions.
    pub fn load(ff: &SharedFilesFacade, table_dir: &Path) -> Result<Self> {
        let path = table_dir.join(TXN_FILE);
        if !ff.exists(&path) {
            return Ok(Self::default());
        }
        let bytes = ff.read_file(&path)?;
        let list: PartitionList = serde_json::from_slice(&bytes)?;
        list.check()?;
        Ok(list)
    }

    /// Atomically replaces `_txn` in `table_dir`.
    pub fn store(&self, ff: &SharedFilesFacade, table_dir: &Path) -> Result<()> {
        self.check()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        ff.write_file_atomic(&table_dir.join(TXN_FILE), &bytes)
    }

    /// Verifies partitions are ordered, disjoint and hold timestamps inside their range.
    pub fn check(&self) -> Result<()> {
        for pair in self.partitions.windows(2) {
            if pair[0].hi > pair[1].lo {
                return Err(StoreError::ConsistencyViolation(format!(
                    "partitions {} and {} overlap",
                    pair[0].dir_name(),
                    pair[1].dir_name()
                )));
            }
        }
        for p in &self.partitions {
            if p.rows > 0 && (p.min_ts < p.lo || p.max_ts >= p.hi || p.min_ts > p.max_ts) {
                return Err(StoreError::ConsistencyViolation(format!(
                    "partition {} holds [{}, {}] outside [{}, {})",
                    p.dir_name(),
                    p.min_ts,
                    p.max_ts,
                    p.lo,
                    p.hi
                )));
            }
        }
        Ok(())
    }

    /// Index of the partition whose range holds `ts`.
    pub fn find(&self, ts: Timestamp) -> Option<usize> {
        let idx = self.partitions.partition_point(|p| p.lo <= ts);
        if idx > 0 && self.partitions[idx - 1].contains(ts) {
            Some(idx - 1)
        } else {
            None
        }
    }

    /// Range of the partition `ts` belongs to, existing or not.
    pub fn range_for(&self, ts: Timestamp, by: PartitionBy) -> Result<(Timestamp, Timestamp)> {
        match self.find(ts) {
            Some(idx) => Ok((self.partitions[idx].lo, self.partitions[idx].hi)),
            None => {
                let lo = by.floor(ts)?;
                Ok((lo, by.next(lo)?))
            }
        }
    }

    /// Inserts `entry` keeping the list ordered by `lo`.
    pub fn insert(&mut self, entry: PartitionEntry) {
        let at = self.partitions.partition_point(|p| p.lo < entry.lo);
        self.partitions.insert(at, entry);
    }

    /// Total published rows.
    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    /// Largest published timestamp.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.partitions
            .iter()
            .rev()
            .find(|p| p.rows > 0)
            .map(|p| p.max_ts)
    }
}

/// Publication state of one partition touched by a commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PartitionStatus {
    /// The partition's new contents are visible to readers.
    Published,
    /// Work on this partition failed with the given cause.
    Failed(String),
    /// The partition's own work succeeded but another partition failed, so it was rolled back.
    RolledBack,
}

/// What a commit did to one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionOutcome {
    /// Lower bound of the partition's range.
    pub lo: Timestamp,
    /// Directory name after the commit.
    pub dir: String,
    /// Kind of change.
    pub kind: PartitionKind,
    /// Rows contributed by the commit.
    pub rows_added: u64,
    /// Rows in the partition after the commit.
    pub rows_total: u64,
    /// Whether the change was published.
    pub status: PartitionStatus,
}

/// Rows of a sorted batch that belong to one partition range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionSlice {
    /// Range start.
    pub lo: Timestamp,
    /// Range end, exclusive.
    pub hi: Timestamp,
    /// Index of the live partition owning the range, if any.
    pub existing: Option<usize>,
    /// First row of the slice in the batch.
    pub start: usize,
    /// One past the last row.
    pub end: usize,
}

impl PartitionSlice {
    /// Rows in the slice.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Cuts sorted timestamps at partition boundaries.
pub fn slice_by_partition(
    list: &PartitionList,
    by: PartitionBy,
    timestamps: &[Timestamp],
) -> Result<Vec<PartitionSlice>> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < timestamps.len() {
        let ts = timestamps[start];
        let (lo, hi) = list.range_for(ts, by)?;
        let end = start + timestamps[start..].partition_point(|&t| t < hi);
        if end == start {
            return Err(StoreError::Invalid(format!(
                "timestamp {ts} falls outside partition [{lo}, {hi})"
            )));
        }
        out.push(PartitionSlice {
            lo,
            hi,
            existing: list.find(ts),
            start,
            end,
        });
        start = end;
    }
    Ok(out)
}

/// Appends `bytes` to the column file at `path` whose logical size is `offset`; returns the new size.
pub fn append_column(
    ff: &SharedFilesFacade,
    path: &Path,
    page_bits: u32,
    offset: u64,
    bytes: &[u8],
    fsync: bool,
) -> Result<u64> {
    let mut mem = AppendMemory::open(ff.clone(), path, page_bits, offset)?;
    mem.append_bytes(bytes)?;
    if fsync {
        mem.sync()?;
    }
    let size = mem.size();
    mem.close()?;
    Ok(size)
}

/// `<column>.d`
pub fn column_file_name(column: &str) -> String {
    format!("{column}.d")
}

/// Path of `column`'s file inside partition directory `dir`.
pub fn column_path(dir: &Path, column: &str) -> PathBuf {
    dir.join(column_file_name(column))
}

/// Path of the in-place rewrite of `column` inside `dir`.
pub fn column_o3_path(dir: &Path, column: &str) -> PathBuf {
    dir.join(format!("{}{}", column_file_name(column), O3_FILE_SUFFIX))
}

/// Whether the in-place rewrite at `o3_path` holds exactly `rows` values of `ty`,
/// i.e. it is the version `_txn` published.
pub fn rewrite_is_published(
    ff: &SharedFilesFacade,
    o3_path: &Path,
    ty: ColumnType,
    rows: u64,
) -> Result<bool> {
    Ok(ff.length(&ff.open_ro(o3_path)?)? == rows << ty.size_shift())
}

/// Moves the published in-place rewrite of `column` over its original.
///
/// Returns whether a side file was swapped in. A missing side file means the
/// swap already happened. A side file of the wrong length is a
/// [`StoreError::ConsistencyViolation`].
pub fn roll_forward_column(
    ff: &SharedFilesFacade,
    dir: &Path,
    column: &str,
    ty: ColumnType,
    rows: u64,
) -> Result<bool> {
    let from = column_o3_path(dir, column);
    if !ff.exists(&from) {
        return Ok(false);
    }
    if !rewrite_is_published(ff, &from, ty, rows)? {
        return Err(StoreError::ConsistencyViolation(format!(
            "{} does not hold the {rows} published rows",
            from.display()
        )));
    }
    ff.rename(&from, &column_path(dir, column))?;
    Ok(true)
}

/// Name of the directory a rewrite of `dir_name` is built in.
pub fn temp_dir_name(dir_name: &str, txn: u64) -> String {
    format!("{dir_name}{O3_TMP_MARKER}{txn}")
}

/// Reads the first `rows` values of a column file.
pub fn read_column_bytes(
    ff: &SharedFilesFacade,
    dir: &Path,
    column: &str,
    ty: ColumnType,
    rows: u64,
) -> Result<Vec<u8>> {
    let len = (rows << ty.size_shift()) as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        let fh = ff.open_ro(&column_path(dir, column))?;
        ff.read_at(&fh, 0, &mut buf)?;
    }
    Ok(buf)
}

/// Cuts a column file back to `rows` values.
pub fn truncate_column(
    ff: &SharedFilesFacade,
    dir: &Path,
    column: &str,
    ty: ColumnType,
    rows: u64,
) -> Result<()> {
    let fh = ff.open_rw(&column_path(dir, column))?;
    ff.truncate(&fh, rows << ty.size_shift())
}

/// CRC32 over every column's name and published bytes in schema order.
pub fn partition_checksum(
    ff: &SharedFilesFacade,
    dir: &Path,
    schema: &TableSchema,
    rows: u64,
) -> Result<u32> {
    let mut crc = crc32fast::Hasher::new();
    for col in &schema.columns {
        crc.update(col.name.as_bytes());
        crc.update(&[col.ty.size_shift() as u8]);
        crc.update(&read_column_bytes(ff, dir, &col.name, col.ty, rows)?);
    }
    Ok(crc.finalize())
}

/// What recovery removed or repaired when a table was opened.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Unpublished or abandoned partition directories deleted.
    pub removed_dirs: Vec<String>,
    /// Leftover temporary files deleted.
    pub removed_files: Vec<String>,
    /// Column files cut back to their published length.
    pub truncated: Vec<String>,
    /// In-place rewrites swapped over their originals.
    pub rolled_forward: Vec<String>,
}

impl RecoveryReport {
    /// Whether recovery found nothing to do.
    pub fn is_clean(&self) -> bool {
        self.removed_dirs.is_empty()
            && self.removed_files.is_empty()
            && self.truncated.is_empty()
            && self.rolled_forward.is_empty()
    }
}

/// Brings a table directory back in line with its published partition list.
///
/// Must run under the table's writer lock, before any commit.
pub fn recover(
    ff: &SharedFilesFacade,
    table_dir: &Path,
    schema: &TableSchema,
    list: &PartitionList,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let live: HashSet<String> = list.partitions.iter().map(PartitionEntry::dir_name).collect();

    for entry in ff.list_dir(table_dir)? {
        let path = table_dir.join(&entry.name);
        if entry.is_dir {
            if !live.contains(&entry.name) {
                ff.remove_dir_all(&path)?;
                report.removed_dirs.push(entry.name);
            }
        } else if entry.name.ends_with(".tmp") {
            ff.remove_file(&path)?;
            report.removed_files.push(entry.name);
        }
    }

    for part in &list.partitions {
        let dir = table_dir.join(part.dir_name());
        for entry in ff.list_dir(&dir)? {
            let Some(target) = entry.name.strip_suffix(O3_FILE_SUFFIX) else {
                continue;
            };
            if entry.is_dir {
                continue;
            }
            let path = dir.join(&entry.name);
            // An in-place rewrite whose length matches `_txn` was published
            // before the swap finished; anything else never was.
            let column = schema
                .columns
                .iter()
                .find(|c| column_file_name(&c.name) == target);
            let published = match column {
                Some(col) => rewrite_is_published(ff, &path, col.ty, part.rows)?,
                None => false,
            };
            if let (true, Some(col)) = (published, column) {
                roll_forward_column(ff, &dir, &col.name, col.ty, part.rows)?;
                report.rolled_forward.push(format!("{}/{}", part.dir_name(), target));
            } else {
                ff.remove_file(&path)?;
                report.removed_files.push(format!("{}/{}", part.dir_name(), entry.name));
            }
        }
        for col in &schema.columns {
            let path = column_path(&dir, &col.name);
            let expected = part.rows << col.ty.size_shift();
            if !ff.exists(&path) {
                if part.rows == 0 {
                    continue;
                }
                return Err(StoreError::ConsistencyViolation(format!(
                    "partition {} lost column file {}",
                    part.dir_name(),
                    col.name
                )));
            }
            let fh = ff.open_rw(&path)?;
            let len = ff.length(&fh)?;
            if len < expected {
                return Err(StoreError::ConsistencyViolation(format!(
                    "{} holds {len} bytes, {expected} published",
                    path.display()
                )));
            }
            if len > expected {
                ff.truncate(&fh, expected)?;
                debug!(path = %path.display(), len, expected, "table.recover.truncated");
                report
                    .truncated
                    .push(format!("{}/{}", part.dir_name(), column_file_name(&col.name)));
            }
        }
    }

    if report.is_clean() {
        debug!(table = %schema.name, "table.recover.clean");
    } else {
        info!(
            table = %schema.name,
            dirs = report.removed_dirs.len(),
            files = report.removed_files.len(),
            truncated = report.truncated.len(),
            rolled_forward = report.rolled_forward.len(),
            "table.recover.repaired"
        );
    }
    Ok(report)
}

/// Best-effort removal of a directory; failures are only logged.
pub fn discard_dir(ff: &SharedFilesFacade, dir: &Path) {
    if ff.exists(dir) {
        if let Err(err) = ff.remove_dir_all(dir) {
            warn!(path = %dir.display(), error = %err, "table.discard.failed");
        }
    }
}
