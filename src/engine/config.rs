use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::o3::StageDispatch;
use crate::primitives::concurrency::WorkerPoolConfig;
use crate::primitives::io::{SharedFilesFacade, StdFilesFacade};
use crate::primitives::vm::DEFAULT_PAGE_BITS;
use crate::storage::TableOptions;
use crate::types::{Result, StoreError};

/// Engine settings.
#[derive(Clone)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per table.
    pub root: PathBuf,
    /// File system every table goes through.
    pub files: SharedFilesFacade,
    /// Worker threads; 0 runs every stage on the writer thread.
    pub worker_count: usize,
    /// Queue capacity per stage in pipeline order (sort, partition, open column, copy).
    pub queue_capacities: [usize; 4],
    /// CPU per worker; `None` leaves a worker unpinned.
    pub affinity: Vec<Option<usize>>,
    /// Whether one failed job stops the pool.
    pub halt_on_error: bool,
    /// Whether out-of-order rows are accepted at all.
    pub o3_enabled: bool,
    /// Whether merged partitions are rebuilt in a new directory rather than rewritten in place.
    pub o3_rename_enabled: bool,
    /// Existing rows a merge must leave in front of it before the partition is split.
    pub o3_partition_split_min_rows: u64,
    /// Page size exponent of column files.
    pub page_bits: u32,
    /// Whether committed column bytes are fsynced before `_txn` is written.
    pub commit_fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            files: StdFilesFacade::shared(),
            worker_count: 2,
            queue_capacities: [64, 64, 256, 1024],
            affinity: Vec::new(),
            halt_on_error: false,
            o3_enabled: true,
            o3_rename_enabled: true,
            o3_partition_split_min_rows: 50_000,
            page_bits: DEFAULT_PAGE_BITS,
            commit_fsync: false,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("root", &self.root)
            .field("worker_count", &self.worker_count)
            .field("queue_capacities", &self.queue_capacities)
            .field("affinity", &self.affinity)
            .field("halt_on_error", &self.halt_on_error)
            .field("o3_enabled", &self.o3_enabled)
            .field("o3_rename_enabled", &self.o3_rename_enabled)
            .field("o3_partition_split_min_rows", &self.o3_partition_split_min_rows)
            .field("page_bits", &self.page_bits)
            .field("commit_fsync", &self.commit_fsync)
            .finish()
    }
}

impl EngineConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Every stage inline on the writer thread, no workers.
    pub fn inline(root: impl Into<PathBuf>) -> Self {
        Self {
            worker_count: 0,
            queue_capacities: [0; 4],
            ..Self::new(root)
        }
    }

    /// Parses a TOML document; keys it does not set keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|err| StoreError::Serialization(err.to_string()))?;
        raw.apply(Self::default())
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| StoreError::storage_io("read", path, err))?;
        Self::from_toml_str(&text).map_err(|err| match err {
            StoreError::Serialization(msg) => {
                StoreError::Serialization(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Stage dispatch; without workers every stage runs inline.
    pub fn dispatch(&self) -> [StageDispatch; 4] {
        if self.worker_count == 0 {
            return [StageDispatch::Inline; 4];
        }
        self.queue_capacities.map(StageDispatch::from_capacity)
    }

    pub(crate) fn table_options(&self) -> TableOptions {
        TableOptions {
            page_bits: self.page_bits,
            commit_fsync: self.commit_fsync,
        }
    }
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        WorkerPoolConfig {
            worker_count: config.worker_count,
            affinity: config.affinity.clone(),
            halt_on_error: config.halt_on_error,
            ..WorkerPoolConfig::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    engine: EngineSection,
    #[serde(default)]
    o3: O3Section,
    #[serde(default)]
    pool: PoolSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineSection {
    root: Option<PathBuf>,
    page_bits: Option<u32>,
    commit_fsync: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct O3Section {
    enabled: Option<bool>,
    rename_enabled: Option<bool>,
    partition_split_min_rows: Option<u64>,
    sort_queue_capacity: Option<usize>,
    partition_queue_capacity: Option<usize>,
    open_column_queue_capacity: Option<usize>,
    copy_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    workers: Option<usize>,
    /// One CPU per worker; negative means unpinned.
    affinity: Option<Vec<i64>>,
    halt_on_error: Option<bool>,
}

impl RawConfig {
    fn apply(self, mut config: EngineConfig) -> Result<EngineConfig> {
        let RawConfig { engine, o3, pool } = self;
        if let Some(root) = engine.root {
            config.root = root;
        }
        if let Some(bits) = engine.page_bits {
            crate::primitives::vm::check_page_bits(bits)?;
            config.page_bits = bits;
        }
        if let Some(fsync) = engine.commit_fsync {
            config.commit_fsync = fsync;
        }

        if let Some(enabled) = o3.enabled {
            config.o3_enabled = enabled;
        }
        if let Some(rename) = o3.rename_enabled {
            config.o3_rename_enabled = rename;
        }
        if let Some(rows) = o3.partition_split_min_rows {
            config.o3_partition_split_min_rows = rows;
        }
        let capacities = [
            o3.sort_queue_capacity,
            o3.partition_queue_capacity,
            o3.open_column_queue_capacity,
            o3.copy_queue_capacity,
        ];
        for (slot, capacity) in config.queue_capacities.iter_mut().zip(capacities) {
            if let Some(capacity) = capacity {
                *slot = capacity;
            }
        }

        if let Some(workers) = pool.workers {
            config.worker_count = workers;
        }
        if let Some(affinity) = pool.affinity {
            config.affinity = affinity
                .into_iter()
                .map(|cpu| usize::try_from(cpu).ok())
                .collect();
        }
        if let Some(halt) = pool.halt_on_error {
            config.halt_on_error = halt;
        }
        Ok(config)
    }
}
