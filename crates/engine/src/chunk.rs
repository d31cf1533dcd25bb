//! Chunk planning: partitioning `[1, total_rows]` into contiguous ranges.

use serde::{Deserialize, Serialize};

/// Monotonic chunk identifier (0-based, ascending with row order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive, 1-based range of input rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub start_row: u64,
    pub end_row: u64,
}

impl RowRange {
    pub fn new(start_row: u64, end_row: u64) -> Self {
        debug_assert!(start_row >= 1 && start_row <= end_row);
        Self { start_row, end_row }
    }

    pub fn len(&self) -> u64 {
        self.end_row - self.start_row + 1
    }

    pub fn contains(&self, row: u64) -> bool {
        row >= self.start_row && row <= self.end_row
    }
}

impl std::fmt::Display for RowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start_row, self.end_row)
    }
}

/// Split `total_rows` rows into chunks of at most `chunk_size` rows.
///
/// The returned ranges partition `[1, total_rows]` exactly, in ascending
/// order, with ids `0..n`. `chunk_size` must be non-zero.
pub fn plan_chunks(total_rows: u64, chunk_size: u64) -> Vec<(ChunkId, RowRange)> {
    assert!(chunk_size > 0, "chunk size must be positive");

    let mut chunks = Vec::with_capacity(total_rows.div_ceil(chunk_size) as usize);
    let mut start = 1u64;
    let mut id = 0u32;
    while start <= total_rows {
        let end = start.saturating_add(chunk_size - 1).min(total_rows);
        chunks.push((ChunkId(id), RowRange::new(start, end)));
        start = end + 1;
        id += 1;
    }
    chunks
}
