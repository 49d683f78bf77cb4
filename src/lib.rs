//! `rust-stream-processing` streams delimited text sources through relational operations in bounded
//! memory.
//!
//! A source is read in chunks, each chunk is parsed into typed rows against a [`types::Schema`]
//! (supplied or inferred from a sample), and an operation is applied batch by batch on a worker
//! pool. Reading is backpressured: a slow operator or sink stalls the reader instead of growing
//! memory.
//!
//! The primary entrypoint is [`execution::StreamingPipeline`], which runs a
//! [`execution::StreamJob`] into any [`execution::BatchSink`].
//!
//! ## Operations
//!
//! Operations are described by [`processing::Operation`], parseable from a compact form:
//!
//! - `passthrough`: every row, unchanged
//! - `filter:<column>:<threshold>`: rows whose numeric column is `>= threshold`
//! - `groupby:<groupColumn>:<sumColumn>`: one sum per distinct group value, ordered by key
//!
//! **Schema + value types:**
//!
//! - [`types::DataType::Int64`]
//! - [`types::DataType::Float64`]
//! - [`types::DataType::Utf8`]
//!
//! Integer sums are checked; an overflow fails the batch instead of wrapping.
//!
//! ## Quick example: stream a file
//!
//! ```no_run
//! use rust_stream_processing::config::PipelineOptions;
//! use rust_stream_processing::execution::{StreamJob, StreamingPipeline};
//!
//! # fn main() -> Result<(), rust_stream_processing::EngineError> {
//! let pipeline = StreamingPipeline::new(PipelineOptions {
//!     batch_size: 500,
//!     max_concurrency: 4,
//!     ..Default::default()
//! })?;
//! let job = StreamJob::new("employees.csv", "groupby:department:salary".parse()?)
//!     .on_progress(|p| {
//!         println!("batch {} done, {} rows so far", p.batch_index, p.rows_processed);
//!         Ok(())
//!     });
//! let (_, output) = pipeline.collect(job)?;
//! if let Some(groups) = output.groups {
//!     println!("{}", groups.to_json()?);
//! }
//! println!("{}", output.stats);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! [`backend::ProcessingBackend`] is a session-oriented alternative for engines that want raw
//! byte chunks (chunks may split records). [`backend::InProcessBackend`] is always available; a
//! Polars-backed engine is behind the `polars` cargo feature.
//!
//! ```no_run
//! use rust_stream_processing::backend::{create_backend, stream_through_backend, BackendKind};
//! use rust_stream_processing::config::PipelineOptions;
//! use rust_stream_processing::execution::StreamJob;
//!
//! # fn main() -> Result<(), rust_stream_processing::EngineError> {
//! let opts = PipelineOptions::default();
//! let backend = create_backend(BackendKind::InProcess, &opts)?;
//! let job = StreamJob::new("employees.csv", "filter:salary:60000".parse()?);
//! let run = stream_through_backend(backend.as_ref(), job, &opts)?;
//! println!("{}", run.results.to_json()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`ingestion`]: chunked readers, record codec and schema inference
//! - [`processing`]: operation descriptors and operators
//! - [`execution`]: the streaming pipeline, sinks, progress and metrics
//! - [`backend`]: session backends and the chunk driver
//! - [`config`]: pipeline options
//! - [`types`]: schema, values and row batches
//! - [`error`]: error types shared by every stage
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and installs no subscriber; batch-level events are at
//! `debug`/`trace`, run summaries at `info`, swallowed failures (progress callbacks, session
//! close) at `warn`.

pub mod backend;
pub mod config;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod processing;
pub mod types;

pub use error::{EngineError, EngineResult, Stage};
