//! Pure-Rust session backend.
//!
//! Each session buffers the partial record at the end of every pushed chunk, parses the complete
//! lines with a [`RecordCodec`] and applies the compiled operator immediately. Aggregations fold
//! into one accumulator per session under the session's lock (single writer).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::PipelineOptions;
use crate::error::{EngineError, EngineResult, RecordError};
use crate::ingestion::csv::{RecordCodec, infer_schema_from_lines};
use crate::ingestion::reader::{RawBatch, SourceLine};
use crate::processing::{GroupAccumulator, Operation, Operator, OperatorOutput, compile};
use crate::types::{Row, Schema};

use super::{ChunkProgress, ProcessingBackend, SessionId, SessionResults};

const ENGINE: &str = "in_process";

/// In-process backend. Sessions live until closed or until [`InProcessBackend::shutdown`].
pub struct InProcessBackend {
    delimiter: u8,
    infer_sample_rows: usize,
    /// `None` once shut down.
    sessions: Mutex<Option<BTreeMap<u64, Arc<Mutex<SessionState>>>>>,
    next_id: AtomicU64,
}

impl InProcessBackend {
    pub fn new(opts: &PipelineOptions) -> Self {
        Self {
            delimiter: opts.delimiter_byte(),
            infer_sample_rows: opts.infer_sample_rows,
            sessions: Mutex::new(Some(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Drop every open session. Later calls fail with [`EngineError::EngineUnavailable`].
    pub fn shutdown(&self) {
        let dropped = self
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .take()
            .map_or(0, |s| s.len());
        tracing::info!(engine = ENGINE, dropped, "backend shut down");
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .as_ref()
            .map_or(0, |s| s.len())
    }

    fn session(&self, id: SessionId) -> EngineResult<Arc<Mutex<SessionState>>> {
        let table = self.sessions.lock().expect("session table mutex poisoned");
        let sessions = table.as_ref().ok_or_else(unavailable)?;
        sessions
            .get(&id.0)
            .cloned()
            .ok_or(EngineError::UnknownSession { handle: id.0 })
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new(&PipelineOptions::default())
    }
}

fn unavailable() -> EngineError {
    EngineError::EngineUnavailable {
        engine: ENGINE.to_string(),
    }
}

impl ProcessingBackend for InProcessBackend {
    fn name(&self) -> &str {
        ENGINE
    }

    fn open(&self, operation: &Operation, schema: Option<&Schema>) -> EngineResult<SessionId> {
        let declared = schema.map(|s| Arc::new(s.clone()));
        // Catch bad columns up front when the schema is known.
        let bound = match &declared {
            Some(schema) => Some(compile(operation, Arc::clone(schema))?),
            None => None,
        };
        let state = SessionState {
            operation: operation.clone(),
            declared,
            header: None,
            bound: None,
            pending_lines: Vec::new(),
            carry: Vec::new(),
            line_no: 0,
            chunks: 0,
            total_rows: 0,
            rows: Vec::new(),
            acc: bound.and_then(|op| op.new_state()),
            drained: false,
        };

        let mut table = self.sessions.lock().expect("session table mutex poisoned");
        let sessions = table.as_mut().ok_or_else(unavailable)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        sessions.insert(id, Arc::new(Mutex::new(state)));
        Ok(SessionId(id))
    }

    fn push_chunk(&self, session: SessionId, chunk: &[u8]) -> EngineResult<ChunkProgress> {
        let state = self.session(session)?;
        let mut state = state.lock().expect("session mutex poisoned");
        if state.drained {
            return Err(EngineError::OperatorApplication {
                batch_index: state.chunks,
                reason: format!("session {session} was already drained"),
            });
        }
        state.carry.extend_from_slice(chunk);
        let complete = match state.carry.iter().rposition(|&b| b == b'\n') {
            Some(pos) => state.carry.drain(..=pos).collect::<Vec<u8>>(),
            None => Vec::new(),
        };
        let processed = state.ingest(&complete, self.delimiter, self.infer_sample_rows, false)?;
        state.chunks += 1;
        Ok(ChunkProgress {
            processed_rows: processed,
            total_accumulated: state.total_rows,
        })
    }

    fn drain_results(&self, session: SessionId) -> EngineResult<SessionResults> {
        let state = self.session(session)?;
        let mut state = state.lock().expect("session mutex poisoned");
        if !state.drained {
            let tail = std::mem::take(&mut state.carry);
            state.ingest(&tail, self.delimiter, self.infer_sample_rows, true)?;
            state.drained = true;
        }
        state.results()
    }

    fn close(&self, session: SessionId) -> EngineResult<()> {
        let mut table = self.sessions.lock().expect("session table mutex poisoned");
        let sessions = table.as_mut().ok_or_else(unavailable)?;
        match sessions.remove(&session.0) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownSession { handle: session.0 }),
        }
    }
}

struct Bound {
    codec: RecordCodec,
    operator: Arc<dyn Operator>,
}

struct SessionState {
    operation: Operation,
    declared: Option<Arc<Schema>>,
    header: Option<String>,
    bound: Option<Bound>,
    /// Data lines seen before the schema could be inferred.
    pending_lines: Vec<SourceLine>,
    /// Bytes of a record not yet terminated.
    carry: Vec<u8>,
    line_no: u64,
    chunks: u64,
    total_rows: u64,
    rows: Vec<Row>,
    acc: Option<GroupAccumulator>,
    drained: bool,
}

impl SessionState {
    /// Take complete lines in `bytes`; returns the number of data rows processed.
    fn ingest(&mut self, bytes: &[u8], delimiter: u8, sample_rows: usize, last: bool) -> EngineResult<u64> {
        let mut lines = Vec::new();
        let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        let pieces = if bytes.is_empty() { None } else { Some(body.split(|&b| b == b'\n')) };
        for raw in pieces.into_iter().flatten() {
            self.line_no += 1;
            let text = std::str::from_utf8(raw).map_err(|e| EngineError::Parse {
                batch_index: Some(self.chunks),
                line: self.line_no,
                source: RecordError::Malformed {
                    message: format!("invalid UTF-8: {e}"),
                },
            })?;
            let text = text.trim_end_matches('\r');
            if text.trim().is_empty() {
                continue;
            }
            if self.header.is_none() {
                self.header = Some(text.to_string());
                continue;
            }
            lines.push(SourceLine {
                number: self.line_no,
                text: text.to_string(),
            });
        }

        if self.bound.is_none() {
            self.pending_lines.append(&mut lines);
            let enough = self.declared.is_some() || self.pending_lines.len() >= sample_rows || last;
            if !enough || self.header.is_none() {
                return Ok(0);
            }
            self.bind(delimiter)?;
            lines = std::mem::take(&mut self.pending_lines);
        }
        self.apply(lines)
    }

    fn bind(&mut self, delimiter: u8) -> EngineResult<()> {
        let header = self.header.as_deref().unwrap_or_default();
        let schema = match &self.declared {
            Some(schema) => Arc::clone(schema),
            None => Arc::new(infer_schema_from_lines(
                header,
                self.pending_lines.iter().map(|l| l.text.as_str()),
                delimiter,
            )?),
        };
        let codec = RecordCodec::bind_header(Arc::clone(&schema), header, delimiter)?;
        let operator = compile(&self.operation, schema)?;
        if self.acc.is_none() {
            self.acc = operator.new_state();
        }
        self.bound = Some(Bound { codec, operator });
        Ok(())
    }

    fn apply(&mut self, lines: Vec<SourceLine>) -> EngineResult<u64> {
        let Some(bound) = &self.bound else {
            return Ok(0);
        };
        if lines.is_empty() {
            return Ok(0);
        }
        let n = lines.len() as u64;
        let raw = RawBatch {
            index: self.chunks,
            lines,
            byte_len: 0,
            bytes_consumed: 0,
            rows_consumed: self.total_rows + n,
        };
        let batch = bound.codec.parse_batch(&raw)?;
        match bound.operator.apply(batch)? {
            OperatorOutput::Rows(rows) => self.rows.extend(rows),
            OperatorOutput::Partial(partial) => match self.acc.as_mut() {
                Some(acc) => acc.merge(partial).map_err(|reason| EngineError::OperatorApplication {
                    batch_index: raw.index,
                    reason,
                })?,
                None => self.acc = Some(partial),
            },
        }
        self.total_rows += n;
        Ok(n)
    }

    fn results(&self) -> EngineResult<SessionResults> {
        match &self.bound {
            Some(bound) => {
                let schema = bound.operator.output_schema();
                Ok(match &self.acc {
                    Some(acc) => SessionResults::Groups(acc.clone().into_table(schema)),
                    None => SessionResults::Rows {
                        schema,
                        rows: self.rows.clone(),
                    },
                })
            }
            None => match &self.declared {
                // Header-only or empty source with a known schema.
                Some(schema) => {
                    let operator = compile(&self.operation, Arc::clone(schema))?;
                    let output = operator.output_schema();
                    Ok(match operator.new_state() {
                        Some(acc) => SessionResults::Groups(acc.into_table(output)),
                        None => SessionResults::Rows {
                            schema: output,
                            rows: Vec::new(),
                        },
                    })
                }
                None => Err(EngineError::SchemaMismatch {
                    message: "cannot infer schema: source has no header".to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InProcessBackend;
    use crate::backend::{ProcessingBackend, SessionResults};
    use crate::error::EngineError;
    use crate::types::{Schema, Value};

    const CSV: &str = "name,age,salary,department\nAlice,25,50000,Engineering\nBob,30,60000,Sales\n\nCarol,35,70000,Engineering\nDan,40,55000,Sales";

    fn push_in_chunks(backend: &InProcessBackend, op: &str, schema: Option<&Schema>, size: usize) -> SessionResults {
        let id = backend.open(&op.parse().unwrap(), schema).unwrap();
        for chunk in CSV.as_bytes().chunks(size) {
            backend.push_chunk(id, chunk).unwrap();
        }
        let results = backend.drain_results(id).unwrap();
        backend.close(id).unwrap();
        results
    }

    #[test]
    fn results_do_not_depend_on_chunk_boundaries() {
        let backend = InProcessBackend::default();
        let reference = push_in_chunks(&backend, "groupby:department:salary", Some(&Schema::employees()), CSV.len());
        for size in [1, 2, 7, 16, 33] {
            let got = push_in_chunks(&backend, "groupby:department:salary", Some(&Schema::employees()), size);
            assert_eq!(got, reference, "chunk size {size}");
        }
        match reference {
            SessionResults::Groups(table) => {
                assert_eq!(table.get(&Value::from("Engineering")), Some(&Value::Int64(120_000)));
                assert_eq!(table.get(&Value::from("Sales")), Some(&Value::Int64(115_000)));
            }
            other => panic!("expected groups, got {other:?}"),
        }
        assert_eq!(backend.open_sessions(), 0);
    }

    #[test]
    fn filter_with_inferred_schema_returns_json_rows() {
        let backend = InProcessBackend::default();
        let results = push_in_chunks(&backend, "filter:salary:60000", None, 10);
        assert_eq!(
            results.to_json().unwrap(),
            serde_json::json!([
                {"name": "Bob", "age": 30, "salary": 60000, "department": "Sales"},
                {"name": "Carol", "age": 35, "salary": 70000, "department": "Engineering"},
            ])
        );
    }

    #[test]
    fn chunk_progress_counts_whole_rows_only() {
        let backend = InProcessBackend::default();
        let id = backend
            .open(&"passthrough".parse().unwrap(), Some(&Schema::employees()))
            .unwrap();
        let p = backend.push_chunk(id, b"name,age,salary,department\nAl,1,2,D\nBo,3,").unwrap();
        assert_eq!((p.processed_rows, p.total_accumulated), (1, 1));
        let p = backend.push_chunk(id, b"4,E\n").unwrap();
        assert_eq!((p.processed_rows, p.total_accumulated), (1, 2));
        assert_eq!(backend.drain_results(id).unwrap().len(), 2);
        assert!(backend.push_chunk(id, b"Cy,5,6,F\n").is_err());
        backend.close(id).unwrap();
    }

    #[test]
    fn parse_errors_name_the_line() {
        let backend = InProcessBackend::default();
        let id = backend
            .open(&"passthrough".parse().unwrap(), Some(&Schema::employees()))
            .unwrap();
        let err = backend
            .push_chunk(id, b"name,age,salary,department\nAl,1,2,D\nBo,x,3,E\n")
            .unwrap_err();
        assert_eq!(err.column(), Some("age"));
        assert!(err.to_string().contains("line 3"));
        backend.close(id).unwrap();
    }

    #[test]
    fn unknown_handles_and_shutdown() {
        let backend = InProcessBackend::default();
        assert!(matches!(
            backend.push_chunk(crate::backend::SessionId(99), b"x"),
            Err(EngineError::UnknownSession { handle: 99 })
        ));
        let id = backend.open(&"passthrough".parse().unwrap(), None).unwrap();
        assert_eq!(backend.open_sessions(), 1);
        backend.shutdown();
        assert!(matches!(backend.push_chunk(id, b"a\n"), Err(EngineError::EngineUnavailable { .. })));
        assert!(matches!(backend.close(id), Err(EngineError::EngineUnavailable { .. })));
        assert!(matches!(
            backend.open(&"passthrough".parse().unwrap(), None),
            Err(EngineError::EngineUnavailable { .. })
        ));
    }

    #[test]
    fn bad_operation_fails_at_open_when_schema_is_known() {
        let backend = InProcessBackend::default();
        let err = backend
            .open(&"filter:department:5".parse().unwrap(), Some(&Schema::employees()))
            .unwrap_err();
        assert!(matches!(err, EngineError::OperatorConstruction { .. }));
        assert_eq!(backend.open_sessions(), 0);
    }
}
