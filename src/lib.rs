//! Chronocol: a columnar time-series store with an out-of-order commit pipeline.
//!
//! Tables are split into time partitions of fixed-width column files. Rows
//! that arrive in timestamp order are appended directly; older rows go through
//! a staged pipeline that sorts them, merges them into the partitions they
//! belong to and publishes the result atomically.

#![warn(missing_docs)]

pub mod engine;
pub mod o3;
pub mod primitives;
pub mod storage;
pub mod types;

pub use engine::{Engine, EngineConfig};
pub use o3::{CommitHandle, CommitPhase, CommitSummary, RenameFlag};
pub use storage::{ColumnType, PartitionBy, Row, TableReader, TableSchema, Value};
pub use types::{Result, StoreError, TableId, Timestamp};
