//! Low-level primitives for building the storage engine.
//!
//! Includes the file system facade, paged virtual memory over column files,
//! and the concurrency building blocks the out-of-order pipeline runs on.

/// Concurrency primitives: writer lock, job queues and the worker pool.
///
/// Thread-safe data structures and coordination mechanisms for concurrent access.
pub mod concurrency;

/// File system facade.
///
/// Every open, map, truncate, rename and fsync goes through [`io::FilesFacade`].
pub mod io;

/// Paged virtual memory backing append-only column files.
pub mod vm;
