//! Open tables: schema, published partition list, commit serialization,
//! the in-order append path and snapshot readers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::batch::ColumnBatch;
use super::partition::{
    append_column, column_path, discard_dir, partition_checksum, read_column_bytes, recover,
    slice_by_partition, truncate_column, PartitionEntry, PartitionKind, PartitionList,
    PartitionOutcome, PartitionSlice, PartitionStatus, RecoveryReport, LOCK_FILE, META_FILE,
};
use super::schema::{read_i64, Row, TableSchema, Value};
use crate::primitives::concurrency::TableLock;
use crate::primitives::io::SharedFilesFacade;
use crate::primitives::vm::check_page_bits;
use crate::types::{Result, StoreError, Timestamp};

/// Per-table storage knobs.
#[derive(Copy, Clone, Debug)]
pub struct TableOptions {
    /// Page size exponent for column files.
    pub page_bits: u32,
    /// Whether appended column bytes are fsynced before publishing.
    pub commit_fsync: bool,
}

/// An open table owned by this process's writer.
pub struct Table {
    schema: Arc<TableSchema>,
    dir: PathBuf,
    ff: SharedFilesFacade,
    options: TableOptions,
    published: RwLock<Arc<PartitionList>>,
    busy: Mutex<bool>,
    idle: Condvar,
    unfinished: Mutex<Option<String>>,
    _lock: TableLock,
}

enum Undo {
    Truncate { dir: PathBuf, rows: u64 },
    Remove(PathBuf),
}

impl Table {
    /// Creates the table directory, writes `_meta` and an empty `_txn`.
    pub fn create(
        ff: SharedFilesFacade,
        root: &Path,
        schema: TableSchema,
        options: TableOptions,
    ) -> Result<Self> {
        schema.validate()?;
        check_page_bits(options.page_bits)?;
        let dir = root.join(&schema.name);
        if ff.exists(&dir.join(META_FILE)) {
            return Err(StoreError::Invalid(format!("table {} already exists", schema.name)));
        }
        ff.mkdirs(&dir)?;
        let lock = TableLock::acquire(dir.join(LOCK_FILE))?;
        ff.write_file_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(&schema)?)?;
        let list = PartitionList::default();
        list.store(&ff, &dir)?;
        info!(table = %schema.name, columns = schema.columns.len(), "table.created");
        Ok(Self::assemble(ff, dir, schema, options, list, lock))
    }

    /// Opens an existing table, taking its writer lock and running recovery.
    pub fn open(
        ff: SharedFilesFacade,
        root: &Path,
        name: &str,
        options: TableOptions,
    ) -> Result<(Self, RecoveryReport)> {
        check_page_bits(options.page_bits)?;
        let dir = root.join(name);
        let meta = dir.join(META_FILE);
        if !ff.exists(&meta) {
            return Err(StoreError::NotFound(format!("table {name}")));
        }
        let lock = TableLock::acquire(dir.join(LOCK_FILE))?;
        let schema: TableSchema = serde_json::from_slice(&ff.read_file(&meta)?)?;
        schema.validate()?;
        let list = PartitionList::load(&ff, &dir)?;
        let report = recover(&ff, &dir, &schema, &list)?;
        info!(
            table = %schema.name,
            partitions = list.partitions.len(),
            rows = list.row_count(),
            txn = list.txn,
            "table.opened"
        );
        Ok((Self::assemble(ff, dir, schema, options, list, lock), report))
    }

    fn assemble(
        ff: SharedFilesFacade,
        dir: PathBuf,
        schema: TableSchema,
        options: TableOptions,
        list: PartitionList,
        lock: TableLock,
    ) -> Self {
        Self {
            schema: Arc::new(schema),
            dir,
            ff,
            options,
            published: RwLock::new(Arc::new(list)),
            busy: Mutex::new(false),
            idle: Condvar::new(),
            unfinished: Mutex::new(None),
            _lock: lock,
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Table schema.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Table directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File system facade the table writes through.
    pub fn files(&self) -> &SharedFilesFacade {
        &self.ff
    }

    /// Storage knobs.
    pub fn options(&self) -> TableOptions {
        self.options
    }

    /// Currently published partition list.
    pub fn snapshot(&self) -> Arc<PartitionList> {
        Arc::clone(&self.published.read())
    }

    /// Persists `list` as `_txn`, then makes it the list readers see.
    pub fn publish(&self, list: PartitionList) -> Result<()> {
        list.store(&self.ff, &self.dir)?;
        self.install(list);
        Ok(())
    }

    /// Swaps in a list whose `_txn` file is already durable.
    pub(crate) fn install(&self, list: PartitionList) {
        let txn = list.txn;
        let version = list.structure_version;
        *self.published.write() = Arc::new(list);
        debug!(table = %self.schema.name, txn, version, "table.published");
    }

    /// Refuses further reads and commits until the table is reopened.
    ///
    /// Used when `_txn` already references files that could not be put in
    /// place; recovery on the next open finishes the job.
    pub(crate) fn require_recovery(&self, reason: String) {
        error!(table = %self.schema.name, reason = %reason, "table.needs_recovery");
        self.unfinished.lock().get_or_insert(reason);
    }

    /// Fails with [`StoreError::NeedsRecovery`] once the table must be reopened.
    pub fn check_usable(&self) -> Result<()> {
        match self.unfinished.lock().as_ref() {
            None => Ok(()),
            Some(reason) => Err(StoreError::NeedsRecovery {
                table: self.schema.name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Marks the table as having a commit in flight, waiting for the previous one.
    ///
    /// While waiting, `help` is invoked so the caller can run pending pipeline
    /// work; it returns whether it did anything.
    pub fn begin_commit(&self, mut help: impl FnMut() -> bool) {
        let mut busy = self.busy.lock();
        while *busy {
            let helped = MutexGuard::unlocked(&mut busy, &mut help);
            if !helped && *busy {
                let _ = self.idle.wait_for(&mut busy, Duration::from_millis(1));
            }
        }
        *busy = true;
    }

    /// Clears the in-flight marker set by [`Table::begin_commit`].
    pub fn end_commit(&self) {
        *self.busy.lock() = false;
        self.idle.notify_all();
    }

    /// Whether a commit is in flight.
    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    /// Appends a sorted batch whose first timestamp is not below the
    /// published maximum. The caller holds the commit marker.
    pub fn append_in_order(&self, batch: &ColumnBatch) -> Result<(u64, Vec<PartitionOutcome>)> {
        let current = self.snapshot();
        let timestamps: Vec<Timestamp> = batch.timestamps().collect();
        let slices = slice_by_partition(&current, self.schema.partition_by, &timestamps)?;
        let mut next = (*current).clone();
        next.txn += 1;
        let mut undo = Vec::with_capacity(slices.len());
        let mut outcomes = Vec::with_capacity(slices.len());

        let mut written = Ok(());
        for slice in &slices {
            written = self.append_slice(batch, slice, &timestamps, &mut next, &mut undo, &mut outcomes);
            if written.is_err() {
                break;
            }
        }
        let published = written.and_then(|()| self.publish(next.clone()));
        if let Err(err) = published {
            warn!(table = %self.schema.name, error = %err, "table.append.rollback");
            self.rollback(undo);
            return Err(err);
        }
        info!(
            table = %self.schema.name,
            txn = next.txn,
            rows = batch.row_count(),
            partitions = outcomes.len(),
            "table.append.published"
        );
        Ok((next.txn, outcomes))
    }

    fn append_slice(
        &self,
        batch: &ColumnBatch,
        slice: &PartitionSlice,
        timestamps: &[Timestamp],
        next: &mut PartitionList,
        undo: &mut Vec<Undo>,
        outcomes: &mut Vec<PartitionOutcome>,
    ) -> Result<()> {
        let first = timestamps[slice.start];
        let last = timestamps[slice.end - 1];
        let added = slice.len() as u64;
        let (kind, idx) = match slice.existing {
            Some(idx) => (PartitionKind::Append, idx),
            None => {
                let name = self.schema.partition_by.partition_name(slice.lo)?;
                next.insert(PartitionEntry {
                    lo: slice.lo,
                    hi: slice.hi,
                    name,
                    name_txn: None,
                    rows: 0,
                    min_ts: first,
                    max_ts: last,
                });
                let idx = next.find(first).ok_or_else(|| {
                    StoreError::ConsistencyViolation(format!("new partition for {first} not found"))
                })?;
                (PartitionKind::New, idx)
            }
        };
        let entry = &mut next.partitions[idx];
        let dir = self.dir.join(entry.dir_name());
        if kind == PartitionKind::New {
            undo.push(Undo::Remove(dir.clone()));
            self.ff.mkdirs(&dir)?;
        } else {
            undo.push(Undo::Truncate {
                dir: dir.clone(),
                rows: entry.rows,
            });
        }
        for (col, def) in self.schema.columns.iter().enumerate() {
            append_column(
                &self.ff,
                &column_path(&dir, &def.name),
                self.options.page_bits,
                entry.rows << def.ty.size_shift(),
                batch.column_rows(col, slice.start, slice.end),
                self.options.commit_fsync,
            )?;
        }
        if entry.rows == 0 {
            entry.min_ts = first;
        }
        entry.rows += added;
        entry.max_ts = last;
        outcomes.push(PartitionOutcome {
            lo: entry.lo,
            dir: entry.dir_name(),
            kind,
            rows_added: added,
            rows_total: entry.rows,
            status: PartitionStatus::Published,
        });
        Ok(())
    }

    fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Remove(dir) => discard_dir(&self.ff, &dir),
                Undo::Truncate { dir, rows } => {
                    for def in &self.schema.columns {
                        if let Err(err) = truncate_column(&self.ff, &dir, &def.name, def.ty, rows) {
                            warn!(path = %dir.display(), column = %def.name, error = %err, "table.rollback.truncate_failed");
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.snapshot();
        f.debug_struct("Table")
            .field("name", &self.schema.name)
            .field("dir", &self.dir)
            .field("txn", &list.txn)
            .field("partitions", &list.partitions.len())
            .finish()
    }
}

/// Read-only view over one published partition list.
///
/// The view never changes by itself: call
/// [`TableReader::refresh_partition_list`] to move to the latest list. When
/// [`TableReader::is_stale`] reports true, directories of the held snapshot
/// may already be gone and the reader must refresh before reading.
pub struct TableReader {
    table: Arc<Table>,
    snapshot: Arc<PartitionList>,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl TableReader {
    /// Reader over the table's current list.
    pub fn new(table: Arc<Table>) -> Self {
        let snapshot = table.snapshot();
        Self { table, snapshot }
    }

    /// Moves to the latest published list; returns whether it changed.
    pub fn refresh_partition_list(&mut self) -> bool {
        let latest = self.table.snapshot();
        let changed = latest.txn != self.snapshot.txn;
        self.snapshot = latest;
        changed
    }

    /// Whether partitions were split, renamed or rewritten since the snapshot was taken.
    pub fn is_stale(&self) -> bool {
        self.table.snapshot().structure_version != self.snapshot.structure_version
    }

    /// Table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.table.schema
    }

    /// Partitions of the snapshot.
    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.snapshot.partitions
    }

    /// Commit number of the snapshot.
    pub fn txn(&self) -> u64 {
        self.snapshot.txn
    }

    /// Rows in the snapshot.
    pub fn row_count(&self) -> u64 {
        self.snapshot.row_count()
    }

    /// Values of column `name` across all partitions in time order.
    pub fn read_column(&self, name: &str) -> Result<Vec<Value>> {
        let col = self.table.schema.column_index(name)?;
        let ty = self.table.schema.columns[col].ty;
        let mut out = Vec::with_capacity(self.row_count() as usize);
        for part in &self.snapshot.partitions {
            let bytes = self.partition_column(part, col)?;
            out.extend(bytes.chunks_exact(ty.size()).map(|v| ty.decode(v)));
        }
        Ok(out)
    }

    /// Designated timestamps across all partitions.
    pub fn timestamps(&self) -> Result<Vec<Timestamp>> {
        let mut out = Vec::with_capacity(self.row_count() as usize);
        for idx in 0..self.snapshot.partitions.len() {
            out.extend(self.partition_timestamps(idx)?);
        }
        Ok(out)
    }

    /// Designated timestamps of partition `idx`.
    pub fn partition_timestamps(&self, idx: usize) -> Result<Vec<Timestamp>> {
        let part = self.partition(idx)?;
        let bytes = self.partition_column(part, self.table.schema.timestamp_index)?;
        Ok(bytes.chunks_exact(8).map(read_i64).collect())
    }

    /// Every row in time order.
    pub fn rows(&self) -> Result<Vec<Row>> {
        let schema = &self.table.schema;
        let columns: Vec<Vec<Value>> = schema
            .columns
            .iter()
            .map(|c| self.read_column(&c.name))
            .collect::<Result<_>>()?;
        let rows = self.row_count() as usize;
        let mut out = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut values = Vec::with_capacity(columns.len() - 1);
            let mut ts = Timestamp::MIN;
            for (col, data) in columns.iter().enumerate() {
                if col == schema.timestamp_index {
                    if let Value::Timestamp(v) = data[row] {
                        ts = v;
                    }
                } else {
                    values.push(data[row].clone());
                }
            }
            out.push(Row { timestamp: ts, values });
        }
        Ok(out)
    }

    /// CRC32 over the published bytes of partition `idx`.
    pub fn partition_checksum(&self, idx: usize) -> Result<u32> {
        self.table.check_usable()?;
        let part = self.partition(idx)?;
        let dir = self.table.dir.join(part.dir_name());
        partition_checksum(&self.table.ff, &dir, &self.table.schema, part.rows)
    }

    fn partition(&self, idx: usize) -> Result<&PartitionEntry> {
        self.snapshot
            .partitions
            .get(idx)
            .ok_or_else(|| StoreError::NotFound(format!("partition #{idx}")))
    }

    fn partition_column(&self, part: &PartitionEntry, col: usize) -> Result<Vec<u8>> {
        self.table.check_usable()?;
        let def = &self.table.schema.columns[col];
        let dir = self.table.dir.join(part.dir_name());
        read_column_bytes(&self.table.ff, &dir, &def.name, def.ty, part.rows)
    }
}
