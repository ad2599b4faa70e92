//! The engine: open tables, the out-of-order pipeline and the worker pool behind it.

mod config;

pub use config::EngineConfig;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::o3::{CommitHandle, CommitSummary, O3Controller, O3Options, RenameFlag};
use crate::primitives::concurrency::{PoolError, WorkerPool, WorkerPoolConfig};
use crate::storage::partition::META_FILE;
use crate::storage::{ColumnBatch, RecoveryReport, Row, Table, TableReader, TableSchema};
use crate::types::{Result, StoreError, TableId};

struct OpenTable {
    table: Arc<Table>,
    recovery: RecoveryReport,
}

/// Entry point for writers and readers.
pub struct Engine {
    config: EngineConfig,
    controller: O3Controller,
    pool: WorkerPool,
    tables: RwLock<HashMap<TableId, OpenTable>>,
    next_table: AtomicU32,
}

impl Engine {
    /// Creates the root directory if needed and starts the worker pool.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.files.mkdirs(&config.root)?;
        let controller = O3Controller::new(O3Options {
            dispatch: config.dispatch(),
            split_min_rows: config.o3_partition_split_min_rows,
            rename: RenameFlag::new(config.o3_rename_enabled),
        });
        let pool = WorkerPool::new(WorkerPoolConfig::from(&config));
        if config.worker_count > 0 {
            for job in controller.jobs() {
                pool.assign(job)?;
            }
            pool.start()?;
        }
        info!(
            root = %config.root.display(),
            workers = config.worker_count,
            o3 = config.o3_enabled,
            "engine.opened"
        );
        Ok(Self {
            config,
            controller,
            pool,
            tables: RwLock::new(HashMap::new()),
            next_table: AtomicU32::new(1),
        })
    }

    /// Settings the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a table and opens it.
    pub fn create_table(&self, schema: TableSchema) -> Result<TableId> {
        if self.table_id(&schema.name).is_some() {
            return Err(StoreError::Invalid(format!("table {} is already open", schema.name)));
        }
        let table = Table::create(
            self.config.files.clone(),
            &self.config.root,
            schema,
            self.config.table_options(),
        )?;
        Ok(self.register(table, RecoveryReport::default()))
    }

    /// Opens an existing table, recovering it first. Opening an open table returns its id.
    pub fn open_table(&self, name: &str) -> Result<TableId> {
        if let Some(id) = self.table_id(name) {
            return Ok(id);
        }
        let (table, recovery) = Table::open(
            self.config.files.clone(),
            &self.config.root,
            name,
            self.config.table_options(),
        )?;
        Ok(self.register(table, recovery))
    }

    fn register(&self, table: Table, recovery: RecoveryReport) -> TableId {
        let id = TableId(self.next_table.fetch_add(1, Ordering::Relaxed));
        debug!(table = %table.name(), id = %id, "engine.table.registered");
        self.tables.write().insert(
            id,
            OpenTable {
                table: Arc::new(table),
                recovery,
            },
        );
        id
    }

    /// Closes a table once its commit in flight, if any, resolved.
    pub fn close_table(&self, id: TableId) -> Result<()> {
        let table = self.table(id)?;
        table.begin_commit(|| self.controller.help_one());
        self.tables.write().remove(&id);
        table.end_commit();
        info!(table = %table.name(), "engine.table.closed");
        Ok(())
    }

    /// Id of the open table called `name`.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .read()
            .iter()
            .find(|(_, open)| open.table.name() == name)
            .map(|(id, _)| *id)
    }

    /// Names of every table under the root, open or not.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let ff = &self.config.files;
        let mut names: Vec<String> = ff
            .list_dir(&self.config.root)?
            .into_iter()
            .filter(|entry| entry.is_dir && ff.exists(&self.config.root.join(&entry.name).join(META_FILE)))
            .map(|entry| entry.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Commits `rows`: appended directly when they are sorted and no older than
    /// anything committed, through the out-of-order pipeline otherwise.
    pub fn write(&self, id: TableId, rows: &[Row]) -> Result<CommitSummary> {
        let table = self.table(id)?;
        let batch = ColumnBatch::from_rows(table.schema(), rows)?;
        if batch.is_empty() {
            return Err(StoreError::Invalid("empty batch".into()));
        }
        table.begin_commit(|| self.controller.help_one());
        if let Err(err) = table.check_usable() {
            table.end_commit();
            return Err(err);
        }
        let max = table.snapshot().max_timestamp();
        let in_order = batch.is_sorted()
            && match (max, batch.bounds()) {
                (Some(max), Some((first, _))) => first >= max,
                _ => true,
            };
        if in_order {
            let appended = table.append_in_order(&batch);
            table.end_commit();
            let (txn, partitions) = appended?;
            return Ok(CommitSummary {
                table: table.name().to_string(),
                txn,
                rows: batch.row_count() as u64,
                out_of_order: false,
                structure_version: table.snapshot().structure_version,
                partitions,
            });
        }
        if !self.config.o3_enabled {
            table.end_commit();
            return Err(StoreError::OutOfOrderDisabled(table.name().to_string()));
        }
        self.controller.submit_locked(&table, batch)?.wait()
    }

    /// Sends `rows` through the out-of-order pipeline whatever their order.
    pub fn submit_out_of_order_batch(&self, id: TableId, rows: &[Row]) -> Result<CommitHandle> {
        let table = self.table(id)?;
        if !self.config.o3_enabled {
            return Err(StoreError::OutOfOrderDisabled(table.name().to_string()));
        }
        let batch = ColumnBatch::from_rows(table.schema(), rows)?;
        self.controller.submit(&table, batch)
    }

    /// Reader over the table's current snapshot.
    pub fn reader(&self, id: TableId) -> Result<TableReader> {
        let table = self.table(id)?;
        table.check_usable()?;
        Ok(TableReader::new(table))
    }

    /// Shared rename switch; changes apply to commits submitted afterwards.
    pub fn rename_flag(&self) -> RenameFlag {
        self.controller.rename_flag().clone()
    }

    /// What recovery did when the table was opened.
    pub fn recovery_report(&self, id: TableId) -> Result<RecoveryReport> {
        self.tables
            .read()
            .get(&id)
            .map(|open| open.recovery.clone())
            .ok_or_else(|| StoreError::NotFound(format!("table id {id}")))
    }

    /// Failures reported by pool workers since the last call.
    pub fn pool_errors(&self) -> Vec<PoolError> {
        self.pool.drain_errors()
    }

    /// Runs whatever is still queued, then stops the workers.
    pub fn shutdown(&self) {
        while self.controller.help_one() {}
        self.pool.halt();
        info!(root = %self.config.root.display(), "engine.shutdown");
    }

    fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(&id)
            .map(|open| Arc::clone(&open.table))
            .ok_or_else(|| StoreError::NotFound(format!("table id {id}")))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pool.halt();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.config.root)
            .field("tables", &self.tables.read().len())
            .field("controller", &self.controller)
            .finish()
    }
}
