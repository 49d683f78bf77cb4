//! Reading delimited sources.
//!
//! - [`reader`]: [`CsvSource`] and the line-batch / byte-chunk readers over it
//! - [`csv`]: [`RecordCodec`] (typed parsing and encoding of single records) and schema inference

pub mod csv;
pub mod reader;

pub use csv::{RecordCodec, infer_schema, infer_schema_from_lines, row_to_json};
pub use reader::{ByteChunk, ByteChunkReader, CsvSource, LineBatchReader, RawBatch, SourceLine};
