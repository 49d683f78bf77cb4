use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Pipeline stage an [`EngineError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Options, schema or operator validation before any data is read.
    Configure,
    /// Opening or reading the source.
    Read,
    /// Turning raw lines into typed rows.
    Parse,
    /// Applying an operator to a batch.
    Operate,
    /// Encoding rows or results (JSON / CSV).
    Serialize,
    /// Writing to an output sink.
    Sink,
    /// Processing backend boundary calls.
    Engine,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Configure => "configure",
            Stage::Read => "read",
            Stage::Parse => "parse",
            Stage::Operate => "operate",
            Stage::Serialize => "serialize",
            Stage::Sink => "sink",
            Stage::Engine => "engine",
        };
        f.write_str(s)
    }
}

/// A single delimited record could not be turned into a typed row.
///
/// Carries no batch context; the pipeline wraps it in [`EngineError::Parse`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// The record has a different number of fields than the schema.
    #[error("expected {expected} fields, found {found}")]
    Arity { expected: usize, found: usize },

    /// A field could not be coerced to its declared type.
    #[error("column '{column}': {message} (raw='{raw}')")]
    Field {
        column: String,
        raw: String,
        message: String,
    },

    /// The record is not valid delimited text.
    #[error("malformed record: {message}")]
    Malformed { message: String },
}

impl RecordError {
    /// Offending column, when the failure is tied to one.
    pub fn column(&self) -> Option<&str> {
        match self {
            RecordError::Field { column, .. } => Some(column.as_str()),
            _ => None,
        }
    }
}

/// Error type shared by every stage of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The input path does not exist. Raised before any chunk is produced.
    #[error("read: source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// Underlying I/O error while reading the source.
    #[error("read: io error: {0}")]
    Io(#[from] std::io::Error),

    /// The header does not carry the columns the schema requires.
    #[error("configure: schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A data line failed to parse.
    #[error("{}", describe_parse(.batch_index, .line, .source))]
    Parse {
        batch_index: Option<u64>,
        /// 1-based line number in the source (header is line 1).
        line: u64,
        #[source]
        source: RecordError,
    },

    /// An operator could not be built for the schema (bad column, non-numeric type, bad descriptor).
    #[error("configure: invalid operator: {reason}")]
    OperatorConstruction { reason: String },

    /// An operator failed while processing a batch.
    #[error("operate: batch {batch_index}: {reason}")]
    OperatorApplication { batch_index: u64, reason: String },

    /// The processing backend is not loaded / has been shut down.
    #[error("engine: processing engine '{engine}' is unavailable")]
    EngineUnavailable { engine: String },

    /// A boundary call referenced a session handle the backend does not know.
    #[error("engine: unknown session handle {handle}")]
    UnknownSession { handle: u64 },

    /// Rows or results could not be encoded.
    #[error("serialize: {message}")]
    Serialization { message: String },

    /// An output sink failed to accept a batch.
    #[error("sink: batch {batch_index}: {source}")]
    Sink {
        batch_index: u64,
        #[source]
        source: std::io::Error,
    },

    /// Pipeline options failed validation.
    #[error("configure: invalid options: {message}")]
    InvalidConfig { message: String },
}

impl EngineError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            EngineError::SourceNotFound { .. } | EngineError::Io(_) => Stage::Read,
            EngineError::SchemaMismatch { .. }
            | EngineError::OperatorConstruction { .. }
            | EngineError::InvalidConfig { .. } => Stage::Configure,
            EngineError::Parse { .. } => Stage::Parse,
            EngineError::OperatorApplication { .. } => Stage::Operate,
            EngineError::EngineUnavailable { .. } | EngineError::UnknownSession { .. } => Stage::Engine,
            EngineError::Serialization { .. } => Stage::Serialize,
            EngineError::Sink { .. } => Stage::Sink,
        }
    }

    /// Batch index the error is attached to, if any.
    pub fn batch_index(&self) -> Option<u64> {
        match self {
            EngineError::Parse { batch_index, .. } => *batch_index,
            EngineError::OperatorApplication { batch_index, .. } | EngineError::Sink { batch_index, .. } => {
                Some(*batch_index)
            }
            _ => None,
        }
    }

    /// Offending column, for parse failures tied to a field.
    pub fn column(&self) -> Option<&str> {
        match self {
            EngineError::Parse { source, .. } => source.column(),
            _ => None,
        }
    }

    pub(crate) fn serialization(e: impl fmt::Display) -> Self {
        EngineError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::serialization(e)
    }
}

fn describe_parse(batch_index: &Option<u64>, line: &u64, source: &RecordError) -> String {
    match batch_index {
        Some(b) => format!("parse: batch {b}, line {line}: {source}"),
        None => format!("parse: line {line}: {source}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineError, RecordError, Stage};

    #[test]
    fn parse_error_message_names_stage_batch_and_column() {
        let err = EngineError::Parse {
            batch_index: Some(3),
            line: 42,
            source: RecordError::Field {
                column: "age".to_string(),
                raw: "abc".to_string(),
                message: "invalid digit found in string".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("parse: batch 3, line 42"));
        assert!(msg.contains("column 'age'"));
        assert_eq!(err.stage(), Stage::Parse);
        assert_eq!(err.batch_index(), Some(3));
        assert_eq!(err.column(), Some("age"));
    }

    #[test]
    fn stages_are_assigned_per_variant() {
        let nf = EngineError::SourceNotFound {
            path: "missing.csv".into(),
        };
        assert_eq!(nf.stage(), Stage::Read);
        assert!(nf.to_string().contains("missing.csv"));

        let op = EngineError::OperatorApplication {
            batch_index: 7,
            reason: "overflow".to_string(),
        };
        assert_eq!(op.stage(), Stage::Operate);
        assert_eq!(op.batch_index(), Some(7));

        let un = EngineError::EngineUnavailable {
            engine: "polars".to_string(),
        };
        assert_eq!(un.stage(), Stage::Engine);
        assert_eq!(un.batch_index(), None);
    }
}
