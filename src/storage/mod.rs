//! Columnar table storage.
//!
//! Tables are directories of time partitions; partitions are directories of
//! fixed-width column files written through [`crate::primitives::vm::AppendMemory`].

/// Column-major row buffers.
pub mod batch;

/// Partition directories, the published partition list and recovery.
pub mod partition;

/// Column types, partitioning and the row model.
pub mod schema;

/// Open tables and readers.
pub mod table;

pub use batch::ColumnBatch;
pub use partition::{
    PartitionEntry, PartitionKind, PartitionList, PartitionOutcome, PartitionStatus,
    RecoveryReport,
};
pub use schema::{ColumnDef, ColumnType, PartitionBy, Row, TableSchema, Value};
pub use table::{Table, TableOptions, TableReader};
