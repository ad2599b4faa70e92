//! Column-major row buffers handed between the writer and the O3 stages.

use super::schema::{read_i64, ColumnType, Row, TableSchema};
use crate::types::{Result, StoreError, Timestamp};

/// Rows laid out as one little-endian byte buffer per column, in the same
/// encoding the column files use.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnBatch {
    types: Vec<ColumnType>,
    timestamp_index: usize,
    columns: Vec<Vec<u8>>,
    rows: usize,
}

impl ColumnBatch {
    /// Encodes `rows` against `schema`.
    ///
    /// Designated timestamps must lie strictly between `i64::MIN` and
    /// `i64::MAX`: the lowest value is the null sentinel and the highest is
    /// the exclusive end of the unpartitioned bucket.
    pub fn from_rows(schema: &TableSchema, rows: &[Row]) -> Result<Self> {
        let types: Vec<ColumnType> = schema.columns.iter().map(|c| c.ty).collect();
        let ts_index = schema.timestamp_index;
        let mut columns: Vec<Vec<u8>> = types
            .iter()
            .map(|ty| Vec::with_capacity(rows.len() << ty.size_shift()))
            .collect();
        for (row_no, row) in rows.iter().enumerate() {
            if row.values.len() + 1 != types.len() {
                return Err(StoreError::Invalid(format!(
                    "row {row_no} has {} values, table {} expects {}",
                    row.values.len(),
                    schema.name,
                    types.len() - 1
                )));
            }
            if row.timestamp == Timestamp::MIN {
                return Err(StoreError::Invalid(format!(
                    "row {row_no} has a null designated timestamp"
                )));
            }
            if row.timestamp == Timestamp::MAX {
                return Err(StoreError::Invalid(format!(
                    "row {row_no} has designated timestamp {}, past the last partition",
                    Timestamp::MAX
                )));
            }
            columns[ts_index].extend_from_slice(&row.timestamp.to_le_bytes());
            let others = (0..types.len()).filter(|&i| i != ts_index);
            for (value, col) in row.values.iter().zip(others) {
                types[col].encode(value, &mut columns[col])?;
            }
        }
        Ok(Self {
            types,
            timestamp_index: ts_index,
            columns,
            rows: rows.len(),
        })
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Number of columns, designated timestamp included.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Type of column `col`.
    pub fn column_type(&self, col: usize) -> ColumnType {
        self.types[col]
    }

    /// Index of the designated timestamp column.
    pub fn timestamp_index(&self) -> usize {
        self.timestamp_index
    }

    /// Encoded bytes of column `col`.
    pub fn column(&self, col: usize) -> &[u8] {
        &self.columns[col]
    }

    /// Encoded bytes of rows `lo..hi` of column `col`.
    pub fn column_rows(&self, col: usize, lo: usize, hi: usize) -> &[u8] {
        let shift = self.types[col].size_shift();
        &self.columns[col][lo << shift..hi << shift]
    }

    /// Designated timestamp of `row`.
    pub fn timestamp(&self, row: usize) -> Timestamp {
        read_i64(&self.columns[self.timestamp_index][row << 3..])
    }

    /// All designated timestamps in row order.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.columns[self.timestamp_index]
            .chunks_exact(8)
            .map(read_i64)
    }

    /// Smallest and largest timestamp, `None` when empty.
    pub fn bounds(&self) -> Option<(Timestamp, Timestamp)> {
        self.timestamps().fold(None, |acc, ts| match acc {
            None => Some((ts, ts)),
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
        })
    }

    /// Whether timestamps never decrease.
    pub fn is_sorted(&self) -> bool {
        let mut prev = Timestamp::MIN;
        self.timestamps().all(|ts| {
            let ok = ts >= prev;
            prev = ts;
            ok
        })
    }

    /// Returns the rows ordered by timestamp; equal timestamps keep their ingestion order.
    pub fn stable_sorted(&self) -> ColumnBatch {
        let keys: Vec<Timestamp> = self.timestamps().collect();
        let mut order: Vec<usize> = (0..self.rows).collect();
        // `sort_by_key` is stable.
        order.sort_by_key(|&i| keys[i]);
        self.gather(&order)
    }

    /// Builds a batch whose row `i` is row `order[i]` of `self`.
    pub fn gather(&self, order: &[usize]) -> ColumnBatch {
        let columns = self
            .columns
            .iter()
            .zip(&self.types)
            .map(|(src, ty)| {
                let width = ty.size();
                let mut dst = Vec::with_capacity(order.len() * width);
                for &row in order {
                    dst.extend_from_slice(&src[row * width..(row + 1) * width]);
                }
                dst
            })
            .collect();
        ColumnBatch {
            types: self.types.clone(),
            timestamp_index: self.timestamp_index,
            columns,
            rows: order.len(),
        }
    }
}
