//! Two-way merge of an existing sorted column run with an incoming sorted run.

use crate::storage::schema::read_i64;
use crate::types::{Result, StoreError, Timestamp};

/// Where the next output row comes from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeRef {
    /// Row of the existing partition, relative to the merge start.
    Existing(usize),
    /// Row of the incoming slice.
    Incoming(usize),
}

/// Builds the merge order of two sorted timestamp runs.
///
/// On equal timestamps existing rows come first, so incoming rows land after
/// rows already committed with the same timestamp.
pub fn merge_index(existing: &[Timestamp], incoming: &[Timestamp]) -> Vec<MergeRef> {
    let mut out = Vec::with_capacity(existing.len() + incoming.len());
    let (mut i, mut j) = (0, 0);
    while i < existing.len() && j < incoming.len() {
        if existing[i] <= incoming[j] {
            out.push(MergeRef::Existing(i));
            i += 1;
        } else {
            out.push(MergeRef::Incoming(j));
            j += 1;
        }
    }
    out.extend((i..existing.len()).map(MergeRef::Existing));
    out.extend((j..incoming.len()).map(MergeRef::Incoming));
    out
}

/// Merge order computed once per partition and replayed for every column.
#[derive(Clone, Debug)]
pub(crate) struct MergePlan {
    /// First existing row taking part in the merge; rows before it stay where they are.
    pub(crate) from: usize,
    pub(crate) index: Vec<MergeRef>,
}

impl MergePlan {
    pub(crate) fn new(from: usize, existing: &[Timestamp], incoming: &[Timestamp]) -> Self {
        Self {
            from,
            index: merge_index(&existing[from..], incoming),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Interleaves one column's bytes. `existing` is the whole column of the
    /// source partition, `incoming` the slice's rows of the same column.
    pub(crate) fn apply(&self, existing: &[u8], incoming: &[u8], width: usize) -> Vec<u8> {
        let existing = &existing[self.from * width..];
        let mut out = Vec::with_capacity(self.index.len() * width);
        for r in &self.index {
            let (src, row) = match *r {
                MergeRef::Existing(row) => (existing, row),
                MergeRef::Incoming(row) => (incoming, row),
            };
            out.extend_from_slice(&src[row * width..(row + 1) * width]);
        }
        out
    }
}

/// Checks that merged timestamp bytes never decrease and stay inside `[lo, hi)`.
pub(crate) fn verify_timestamps(bytes: &[u8], lo: Timestamp, hi: Timestamp) -> Result<()> {
    let mut prev = lo;
    for (row, chunk) in bytes.chunks_exact(8).enumerate() {
        let ts = read_i64(chunk);
        if ts < prev || ts >= hi {
            return Err(StoreError::ConsistencyViolation(format!(
                "merged row {row} has timestamp {ts} after {prev}, range [{lo}, {hi})"
            )));
        }
        prev = ts;
    }
    Ok(())
}
