//! Input row sources.
//!
//! Sources hand out already-mapped [`ImportRecord`]s by 1-based row number.
//! Mapping provider exports into records happens upstream.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use idmigrate_core::ImportRecord;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::chunk::RowRange;

/// One numbered input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub row_number: u64,
    pub record: ImportRecord,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("row {row} is malformed: {message}")]
    Malformed { row: u64, message: String },
    #[error("row range {range} is outside the input ({total} rows)")]
    OutOfRange { range: RowRange, total: u64 },
}

/// Random access to the rows of one input.
#[async_trait::async_trait]
pub trait RowSource: Send + Sync {
    async fn total_rows(&self) -> Result<u64, SourceError>;

    /// Read every row of `range`, in row order.
    async fn read_range(&self, range: RowRange) -> Result<Vec<SourceRow>, SourceError>;
}

/// Rows held in memory (tests, embedding callers).
#[derive(Debug, Clone, Default)]
pub struct InMemoryRowSource {
    records: Vec<ImportRecord>,
}

impl InMemoryRowSource {
    pub fn new(records: Vec<ImportRecord>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl RowSource for InMemoryRowSource {
    async fn total_rows(&self) -> Result<u64, SourceError> {
        Ok(self.records.len() as u64)
    }

    async fn read_range(&self, range: RowRange) -> Result<Vec<SourceRow>, SourceError> {
        let total = self.records.len() as u64;
        if range.end_row > total {
            return Err(SourceError::OutOfRange { range, total });
        }
        Ok((range.start_row..=range.end_row)
            .map(|row_number| SourceRow {
                row_number,
                record: self.records[(row_number - 1) as usize].clone(),
            })
            .collect())
    }
}

/// Rows between two entries of the byte-offset index.
pub const DEFAULT_INDEX_STRIDE: u64 = 1024;

/// Newline-delimited JSON file of [`ImportRecord`]s. Blank lines are not rows.
///
/// Every scan records the byte offset of each `stride`-th row, so a later
/// range read seeks close to its first row instead of re-reading the file
/// from the top. Clones share the index.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
    stride: u64,
    /// `offsets[k]` is where row `k * stride + 1` starts.
    offsets: Arc<Mutex<Vec<u64>>>,
}

/// Buffered line scanner that tracks row numbers and byte offsets.
struct Scanner {
    reader: BufReader<tokio::fs::File>,
    offset: u64,
    row: u64,
    line: String,
}

impl Scanner {
    /// Advance to the next non-blank line. Returns its row number and the
    /// byte offset it starts at.
    async fn next_row(&mut self) -> std::io::Result<Option<(u64, u64)>> {
        loop {
            self.line.clear();
            let start = self.offset;
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            self.offset += n as u64;
            if !self.line.trim().is_empty() {
                self.row += 1;
                return Ok(Some((self.row, start)));
            }
        }
    }

    fn text(&self) -> &str {
        self.line.trim()
    }
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_index_stride(path, DEFAULT_INDEX_STRIDE)
    }

    pub fn with_index_stride(path: impl Into<PathBuf>, stride: u64) -> Self {
        Self {
            path: path.into(),
            stride: stride.max(1),
            offsets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows whose offset is known.
    pub fn indexed_rows(&self) -> usize {
        self.offsets.lock().unwrap().len()
    }

    fn io_error(&self, err: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }

    fn remember(&self, row: u64, offset: u64) {
        if (row - 1) % self.stride != 0 {
            return;
        }
        let slot = ((row - 1) / self.stride) as usize;
        let mut offsets = self.offsets.lock().unwrap();
        if slot == offsets.len() {
            offsets.push(offset);
        }
    }

    /// Open the file positioned at the closest indexed row not after `row`.
    async fn scan_from(&self, row: u64) -> Result<Scanner, SourceError> {
        let (offset, rows_before) = {
            let offsets = self.offsets.lock().unwrap();
            let wanted = (row.saturating_sub(1) / self.stride) as usize;
            match offsets.len().checked_sub(1).map(|last| last.min(wanted)) {
                Some(slot) => (offsets[slot], slot as u64 * self.stride),
                None => (0, 0),
            }
        };

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| self.io_error(e))?;
        }
        Ok(Scanner {
            reader: BufReader::new(file),
            offset,
            row: rows_before,
            line: String::new(),
        })
    }
}

#[async_trait::async_trait]
impl RowSource for JsonLinesSource {
    async fn total_rows(&self) -> Result<u64, SourceError> {
        let mut scanner = self.scan_from(1).await?;
        while let Some((row, offset)) = scanner.next_row().await.map_err(|e| self.io_error(e))? {
            self.remember(row, offset);
        }
        Ok(scanner.row)
    }

    async fn read_range(&self, range: RowRange) -> Result<Vec<SourceRow>, SourceError> {
        let mut scanner = self.scan_from(range.start_row).await?;
        let mut rows = Vec::with_capacity(range.len() as usize);

        while let Some((row_number, offset)) = scanner.next_row().await.map_err(|e| self.io_error(e))? {
            self.remember(row_number, offset);
            if row_number < range.start_row {
                continue;
            }

            let record: ImportRecord = serde_json::from_str(scanner.text()).map_err(|e| SourceError::Malformed {
                row: row_number,
                message: e.to_string(),
            })?;
            rows.push(SourceRow { row_number, record });

            if row_number == range.end_row {
                return Ok(rows);
            }
        }

        Err(SourceError::OutOfRange {
            range,
            total: scanner.row,
        })
    }
}
