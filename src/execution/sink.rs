//! Result sinks and per-batch outcome folding.
//!
//! A [`BatchSink`] receives every successful row batch from a stateless run. Per-batch results
//! are recorded as [`BatchOutcome`]s; whether the first failure aborts the run or every outcome
//! is returned is the caller's [`ErrorPolicy`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ingestion::csv::row_to_json;
use crate::types::{Row, RowBatch};

/// How per-batch failures are folded into the run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The first failure aborts the run; the run result is that error.
    #[default]
    FailFast,
    /// Every outcome is kept; the caller inspects them for failures.
    CollectAll,
}

/// Result of processing one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Read index of the batch.
    pub index: u64,
    /// Data rows the batch carried.
    pub rows_in: usize,
    /// Rows emitted by the batch, or why it failed.
    pub result: EngineResult<usize>,
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.result.as_ref().err()
    }
}

/// Fail-fast fold: total rows emitted, or the first failure in iteration order.
pub fn fold_fail_fast<I>(outcomes: I) -> EngineResult<usize>
where
    I: IntoIterator<Item = BatchOutcome>,
{
    outcomes.into_iter().try_fold(0usize, |total, outcome| Ok(total + outcome.result?))
}

/// Collect-all: every outcome, ordered by batch index.
pub fn collect_all<I>(outcomes: I) -> Vec<BatchOutcome>
where
    I: IntoIterator<Item = BatchOutcome>,
{
    let mut all: Vec<BatchOutcome> = outcomes.into_iter().collect();
    all.sort_by_key(|o| o.index);
    all
}

/// Destination for result batches.
///
/// Sinks are driven from a single thread; `accept` is never called concurrently.
pub trait BatchSink {
    /// Consume one result batch. Empty batches are delivered too.
    fn accept(&mut self, batch: RowBatch) -> EngineResult<()>;

    /// Called once after the last batch.
    fn finish(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct CollectSink {
    batches: Vec<RowBatch>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches in the order they were delivered.
    pub fn batches(&self) -> &[RowBatch] {
        &self.batches
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(RowBatch::row_count).sum()
    }

    /// All rows, ordered by batch index.
    pub fn into_rows(mut self) -> Vec<Row> {
        self.batches.sort_by_key(|b| b.index);
        self.batches.into_iter().flat_map(|b| b.rows).collect()
    }
}

impl BatchSink for CollectSink {
    fn accept(&mut self, batch: RowBatch) -> EngineResult<()> {
        self.batches.push(batch);
        Ok(())
    }
}

/// Counts batches and rows without retaining them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountSink {
    pub batches: u64,
    pub rows: u64,
}

impl BatchSink for CountSink {
    fn accept(&mut self, batch: RowBatch) -> EngineResult<()> {
        self.batches += 1;
        self.rows += batch.row_count() as u64;
        Ok(())
    }
}

/// Append-only newline-delimited JSON file: one line per batch, holding a JSON array of row
/// objects. Each line is flushed as soon as it is written.
pub struct NdjsonFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    batches_written: u64,
}

impl NdjsonFileSink {
    /// Create (or truncate) the output file.
    pub fn create(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| EngineError::Sink {
            batch_index: 0,
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            batches_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written
    }
}

impl BatchSink for NdjsonFileSink {
    fn accept(&mut self, batch: RowBatch) -> EngineResult<()> {
        let rows = batch
            .rows
            .iter()
            .map(|row| row_to_json(&batch.schema, row))
            .collect::<EngineResult<Vec<_>>>()?;
        let line = serde_json::to_string(&serde_json::Value::Array(rows))?;

        let index = batch.index;
        let io = |source| EngineError::Sink {
            batch_index: index,
            source,
        };
        self.writer.write_all(line.as_bytes()).map_err(io)?;
        self.writer.write_all(b"\n").map_err(io)?;
        self.writer.flush().map_err(io)?;
        self.batches_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        let index = self.batches_written;
        self.writer.flush().map_err(|source| EngineError::Sink {
            batch_index: index,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BatchOutcome, BatchSink, CollectSink, NdjsonFileSink, collect_all, fold_fail_fast};
    use crate::error::EngineError;
    use crate::types::{Row, RowBatch, Schema, Value};

    fn ok(index: u64, rows: usize) -> BatchOutcome {
        BatchOutcome {
            index,
            rows_in: rows,
            result: Ok(rows),
        }
    }

    fn failed(index: u64) -> BatchOutcome {
        BatchOutcome {
            index,
            rows_in: 1,
            result: Err(EngineError::OperatorApplication {
                batch_index: index,
                reason: "boom".to_string(),
            }),
        }
    }

    #[test]
    fn fail_fast_returns_first_failure() {
        assert_eq!(fold_fail_fast(vec![ok(0, 2), ok(1, 3)]).unwrap(), 5);
        let err = fold_fail_fast(vec![ok(0, 2), failed(1), failed(2)]).unwrap_err();
        assert_eq!(err.batch_index(), Some(1));
    }

    #[test]
    fn collect_all_keeps_every_outcome_in_index_order() {
        let all = collect_all(vec![ok(2, 1), failed(1), ok(0, 1)]);
        let indices: Vec<u64> = all.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(all.iter().filter(|o| !o.is_ok()).count(), 1);
        assert!(all[1].error().is_some());
    }

    fn batch(index: u64, names: &[&str]) -> RowBatch {
        let rows = names
            .iter()
            .map(|n| Row::new(vec![Value::from(*n), Value::Int64(1), Value::Int64(2), Value::from("D")]))
            .collect();
        RowBatch::new(index, Arc::new(Schema::employees()), rows)
    }

    #[test]
    fn collect_sink_orders_rows_by_batch_index() {
        let mut sink = CollectSink::new();
        sink.accept(batch(1, &["b"])).unwrap();
        sink.accept(batch(0, &["a"])).unwrap();
        sink.accept(batch(2, &[])).unwrap();
        assert_eq!(sink.batches().len(), 3);
        assert_eq!(sink.row_count(), 2);
        let names: Vec<_> = sink
            .into_rows()
            .iter()
            .filter_map(|r| r.get(0).and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn ndjson_sink_writes_one_line_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let mut sink = NdjsonFileSink::create(&path).unwrap();
        sink.accept(batch(0, &["a", "b"])).unwrap();
        sink.accept(batch(1, &[])).unwrap();
        assert_eq!(sink.batches_written(), 2);

        // flushed per batch, readable before finish
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first[1]["name"], "b");
        assert_eq!(first[0]["salary"], 2);
        assert_eq!(lines[1], "[]");
        sink.finish().unwrap();
    }
}
