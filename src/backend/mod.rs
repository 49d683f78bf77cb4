//! Session-based processing backends.
//!
//! A backend owns stateful streaming sessions addressed by an opaque [`SessionId`]. Raw byte
//! chunks are pushed into a session (a chunk may end mid-record; the backend buffers the partial
//! tail), results are drained once the source is exhausted, and the session is closed.
//!
//! Callers normally go through [`Session`], a scoped guard that closes its session exactly once,
//! on drop if not explicitly, and downgrades close failures to warnings.
//!
//! Backends are constructed explicitly and passed in; see [`create_backend`].

pub mod driver;
pub mod in_process;
#[cfg(feature = "polars")]
pub mod polars;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PipelineOptions;
use crate::error::{EngineError, EngineResult};
use crate::ingestion::csv::row_to_json;
use crate::processing::{GroupTable, Operation};
use crate::types::{Row, Schema};

pub use driver::{BackendRun, stream_through_backend};
pub use in_process::InProcessBackend;

/// Opaque handle for one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Progress returned by [`ProcessingBackend::push_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    /// Data rows taken from this chunk.
    pub processed_rows: u64,
    /// Data rows the session has taken in so far.
    pub total_accumulated: u64,
}

impl ChunkProgress {
    /// `{"processed_rows": .., "total_accumulated": ..}`
    pub fn to_json(&self) -> EngineResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Final results of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionResults {
    /// Row results of a stateless operation.
    Rows { schema: Arc<Schema>, rows: Vec<Row> },
    /// Grouped sums, ordered by key.
    Groups(GroupTable),
}

impl SessionResults {
    pub fn schema(&self) -> &Arc<Schema> {
        match self {
            SessionResults::Rows { schema, .. } => schema,
            SessionResults::Groups(table) => table.schema(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SessionResults::Rows { rows, .. } => rows.len(),
            SessionResults::Groups(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON array of row objects keyed by column name.
    pub fn to_json(&self) -> EngineResult<serde_json::Value> {
        match self {
            SessionResults::Rows { schema, rows } => Ok(serde_json::Value::Array(
                rows.iter()
                    .map(|row| row_to_json(schema, row))
                    .collect::<EngineResult<Vec<_>>>()?,
            )),
            SessionResults::Groups(table) => table.to_json(),
        }
    }
}

/// A stateful streaming engine addressed through session handles.
///
/// Implementations must tolerate calls from any thread, but at most one call is in flight per
/// session at a time. Calls on a backend that is no longer available fail with
/// [`EngineError::EngineUnavailable`]; unknown handles with [`EngineError::UnknownSession`].
pub trait ProcessingBackend: Send + Sync {
    /// Short engine name used in errors and logs.
    fn name(&self) -> &str;

    /// Open a session for `operation`. With `schema == None` the schema is inferred from the data.
    fn open(&self, operation: &Operation, schema: Option<&Schema>) -> EngineResult<SessionId>;

    /// Feed the next chunk of the source, starting with the header. Chunks may split records.
    fn push_chunk(&self, session: SessionId, chunk: &[u8]) -> EngineResult<ChunkProgress>;

    /// Flush buffered input and return the results of the session's operation.
    fn drain_results(&self, session: SessionId) -> EngineResult<SessionResults>;

    /// Release the session.
    fn close(&self, session: SessionId) -> EngineResult<()>;
}

/// Scoped session: closed exactly once, when [`Session::close`] is called or on drop.
pub struct Session<'b> {
    backend: &'b dyn ProcessingBackend,
    id: SessionId,
    closed: bool,
}

impl<'b> Session<'b> {
    pub fn open(backend: &'b dyn ProcessingBackend, operation: &Operation, schema: Option<&Schema>) -> EngineResult<Self> {
        let id = backend.open(operation, schema)?;
        tracing::debug!(engine = backend.name(), session = %id, %operation, "session opened");
        Ok(Self {
            backend,
            id,
            closed: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> EngineResult<ChunkProgress> {
        self.backend.push_chunk(self.id, chunk)
    }

    pub fn drain_results(&mut self) -> EngineResult<SessionResults> {
        self.backend.drain_results(self.id)
    }

    /// Close now, returning the backend's verdict.
    pub fn close(mut self) -> EngineResult<()> {
        self.closed = true;
        let result = self.backend.close(self.id);
        tracing::debug!(engine = self.backend.name(), session = %self.id, ok = result.is_ok(), "session closed");
        result
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.backend.close(self.id) {
            tracing::warn!(engine = self.backend.name(), session = %self.id, error = %e, "failed to close session");
        }
    }
}

/// Which backend [`create_backend`] should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    InProcess,
    /// Polars DataFrame engine; needs the `polars` cargo feature.
    Polars,
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" | "inprocess" => Ok(BackendKind::InProcess),
            "polars" => Ok(BackendKind::Polars),
            other => Err(EngineError::InvalidConfig {
                message: format!("unknown backend '{other}' (expected in_process or polars)"),
            }),
        }
    }
}

/// Build a backend of `kind` configured from `opts`.
pub fn create_backend(kind: BackendKind, opts: &PipelineOptions) -> EngineResult<Arc<dyn ProcessingBackend>> {
    opts.validate()?;
    match kind {
        BackendKind::InProcess => Ok(Arc::new(InProcessBackend::new(opts))),
        #[cfg(feature = "polars")]
        BackendKind::Polars => Ok(Arc::new(polars::PolarsBackend::new(opts))),
        #[cfg(not(feature = "polars"))]
        BackendKind::Polars => Err(EngineError::EngineUnavailable {
            engine: "polars".to_string(),
        }),
    }
}
