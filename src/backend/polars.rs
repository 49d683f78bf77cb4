//! Polars-backed session backend (cargo feature `polars`).
//!
//! Pushed chunks are parsed into DataFrames and stacked; the session's operation runs lazily over
//! the accumulated frame when results are drained. Without a declared schema, data lines are held
//! back until `infer_sample_rows` of them (or the end of input) have arrived; the schema inferred
//! from that sample is then fixed for the rest of the session.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use polars::prelude as pl;
use polars::prelude::{IntoLazy, SerReader, col, lit};

use crate::config::PipelineOptions;
use crate::error::{EngineError, EngineResult};
use crate::processing::{GroupAccumulator, Operation};
use crate::types::{DataType, Field, Row, Schema, Value};

use super::{ChunkProgress, ProcessingBackend, SessionId, SessionResults};

const ENGINE: &str = "polars";

pub struct PolarsBackend {
    delimiter: u8,
    infer_sample_rows: usize,
    sessions: Mutex<BTreeMap<u64, Arc<Mutex<FrameSession>>>>,
    next_id: AtomicU64,
}

impl PolarsBackend {
    pub fn new(opts: &PipelineOptions) -> Self {
        Self {
            delimiter: opts.delimiter_byte(),
            infer_sample_rows: opts.infer_sample_rows,
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn session(&self, id: SessionId) -> EngineResult<Arc<Mutex<FrameSession>>> {
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .get(&id.0)
            .cloned()
            .ok_or(EngineError::UnknownSession { handle: id.0 })
    }
}

struct FrameSession {
    operation: Operation,
    schema: Option<pl::SchemaRef>,
    header: Option<Vec<u8>>,
    carry: Vec<u8>,
    /// Complete data lines held back until the schema is known.
    sample: Vec<u8>,
    sample_rows: usize,
    frame: Option<pl::DataFrame>,
    total_rows: u64,
    chunks: u64,
}

fn engine_error(batch_index: u64, e: pl::PolarsError) -> EngineError {
    EngineError::OperatorApplication {
        batch_index,
        reason: format!("polars: {e}"),
    }
}

fn to_polars_schema(schema: &Schema) -> pl::Schema {
    schema
        .fields
        .iter()
        .map(|f| {
            let dtype = match f.data_type {
                DataType::Int64 => pl::DataType::Int64,
                DataType::Float64 => pl::DataType::Float64,
                DataType::Utf8 => pl::DataType::String,
            };
            pl::Field::new(f.name.as_str().into(), dtype)
        })
        .collect()
}

fn from_polars_dtype(dtype: &pl::DataType) -> DataType {
    if dtype.is_integer() {
        DataType::Int64
    } else if dtype.is_float() {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

fn from_any_value(column: &str, value: pl::AnyValue<'_>) -> EngineResult<Value> {
    Ok(match value {
        pl::AnyValue::Int64(v) => Value::Int64(v),
        pl::AnyValue::Int32(v) => Value::Int64(v.into()),
        pl::AnyValue::UInt32(v) => Value::Int64(v.into()),
        pl::AnyValue::Float64(v) => Value::Float64(v),
        pl::AnyValue::Float32(v) => Value::Float64(v.into()),
        pl::AnyValue::String(s) => Value::Utf8(s.to_string()),
        pl::AnyValue::StringOwned(s) => Value::Utf8(s.to_string()),
        pl::AnyValue::Null => {
            return Err(EngineError::serialization(format!("null value in column '{column}'")));
        }
        other => Value::Utf8(other.to_string()),
    })
}

impl FrameSession {
    fn ingest(&mut self, mut bytes: Vec<u8>, delimiter: u8, sample_rows: usize, last: bool) -> EngineResult<u64> {
        if self.header.is_none() {
            let Some(end) = bytes.iter().position(|&b| b == b'\n') else {
                if !bytes.is_empty() {
                    self.header = Some(bytes);
                }
                return Ok(0);
            };
            let rest = bytes.split_off(end + 1);
            self.header = Some(std::mem::replace(&mut bytes, rest));
        }
        if self.schema.is_none() {
            self.sample_rows += bytes
                .split(|&b| b == b'\n')
                .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
                .count();
            self.sample.extend_from_slice(&bytes);
            if self.sample_rows < sample_rows && !last {
                return Ok(0);
            }
            bytes = std::mem::take(&mut self.sample);
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }

        let df = self.parse(bytes, delimiter)?;
        if self.schema.is_none() {
            self.schema = Some(Arc::new(frame_schema(&df)));
        }
        let n = df.height() as u64;
        // Stack before replacing so a failed stack leaves the accumulated frame intact.
        let stacked = match &self.frame {
            Some(frame) => frame.vstack(&df).map_err(|e| engine_error(self.chunks, e))?,
            None => df,
        };
        self.frame = Some(stacked);
        self.total_rows += n;
        Ok(n)
    }

    fn parse(&self, bytes: Vec<u8>, delimiter: u8) -> EngineResult<pl::DataFrame> {
        let mut buf = self.header.clone().unwrap_or_default();
        if buf.last() != Some(&b'\n') {
            buf.push(b'\n');
        }
        buf.extend_from_slice(&bytes);

        let parse_options = pl::CsvParseOptions::default().with_separator(delimiter);
        pl::CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(None)
            .with_schema_overwrite(self.schema.clone())
            .with_parse_options(parse_options)
            .into_reader_with_file_handle(Cursor::new(buf))
            .finish()
            .map_err(|e| engine_error(self.chunks, e))
    }

    fn results(&self) -> EngineResult<SessionResults> {
        let index = self.chunks;
        let Some(frame) = self.frame.clone() else {
            return Err(EngineError::SchemaMismatch {
                message: "session received no data rows".to_string(),
            });
        };
        match &self.operation {
            Operation::Passthrough => rows_result(&frame),
            Operation::Filter { column, threshold } => {
                let out = frame
                    .lazy()
                    .filter(col(column.as_str()).gt_eq(lit(*threshold)))
                    .collect()
                    .map_err(|e| engine_error(index, e))?;
                rows_result(&out)
            }
            Operation::GroupSum {
                group_column,
                sum_column,
            } => {
                let out = frame
                    .lazy()
                    .group_by([col(group_column.as_str())])
                    .agg([col(sum_column.as_str()).sum()])
                    .collect()
                    .map_err(|e| engine_error(index, e))?;
                let (schema, rows) = frame_to_rows(&out)?;
                let sum_type = schema.fields.get(1).map_or(DataType::Float64, |f| f.data_type);
                let mut acc = GroupAccumulator::new(sum_type);
                for row in rows {
                    let mut values = row.into_values().into_iter();
                    if let (Some(key), Some(sum)) = (values.next(), values.next()) {
                        acc.add(key, &sum)
                            .map_err(|reason| EngineError::OperatorApplication { batch_index: index, reason })?;
                    }
                }
                Ok(SessionResults::Groups(acc.into_table(schema)))
            }
        }
    }
}

fn frame_schema(df: &pl::DataFrame) -> pl::Schema {
    df.columns()
        .iter()
        .map(|c| pl::Field::new(c.name().clone(), c.dtype().clone()))
        .collect()
}

fn rows_result(df: &pl::DataFrame) -> EngineResult<SessionResults> {
    let (schema, rows) = frame_to_rows(df)?;
    Ok(SessionResults::Rows { schema, rows })
}

fn frame_to_rows(df: &pl::DataFrame) -> EngineResult<(Arc<Schema>, Vec<Row>)> {
    let columns = df.columns();
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(c.name().as_str(), from_polars_dtype(c.dtype())))
            .collect(),
    ));
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let mut values = Vec::with_capacity(columns.len());
        for c in columns {
            let av = c.get(i).map_err(EngineError::serialization)?;
            values.push(from_any_value(c.name().as_str(), av)?);
        }
        rows.push(Row::new(values));
    }
    Ok((schema, rows))
}

impl ProcessingBackend for PolarsBackend {
    fn name(&self) -> &str {
        ENGINE
    }

    fn open(&self, operation: &Operation, schema: Option<&Schema>) -> EngineResult<SessionId> {
        if let Some(schema) = schema {
            crate::processing::compile(operation, Arc::new(schema.clone()))?;
        }
        let session = FrameSession {
            operation: operation.clone(),
            schema: schema.map(|s| Arc::new(to_polars_schema(s))),
            header: None,
            carry: Vec::new(),
            sample: Vec::new(),
            sample_rows: 0,
            frame: None,
            total_rows: 0,
            chunks: 0,
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .insert(id, Arc::new(Mutex::new(session)));
        Ok(SessionId(id))
    }

    fn push_chunk(&self, session: SessionId, chunk: &[u8]) -> EngineResult<ChunkProgress> {
        let state = self.session(session)?;
        let mut state = state.lock().expect("session mutex poisoned");
        state.carry.extend_from_slice(chunk);
        let complete = match state.carry.iter().rposition(|&b| b == b'\n') {
            Some(pos) => state.carry.drain(..=pos).collect::<Vec<u8>>(),
            None => Vec::new(),
        };
        let processed = state.ingest(complete, self.delimiter, self.infer_sample_rows, false)?;
        state.chunks += 1;
        Ok(ChunkProgress {
            processed_rows: processed,
            total_accumulated: state.total_rows,
        })
    }

    fn drain_results(&self, session: SessionId) -> EngineResult<SessionResults> {
        let state = self.session(session)?;
        let mut state = state.lock().expect("session mutex poisoned");
        let mut tail = std::mem::take(&mut state.carry);
        if !tail.is_empty() {
            tail.push(b'\n');
        }
        state.ingest(tail, self.delimiter, self.infer_sample_rows, true)?;
        state.results()
    }

    fn close(&self, session: SessionId) -> EngineResult<()> {
        match self
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .remove(&session.0)
        {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownSession { handle: session.0 }),
        }
    }
}
