//! Streams a source through a [`ProcessingBackend`] session in raw byte chunks.

use std::time::Instant;

use crate::config::PipelineOptions;
use crate::error::EngineResult;
use crate::execution::{ProcessingStats, Progress, StreamJob};

use super::{ProcessingBackend, Session, SessionResults};

/// Outcome of [`stream_through_backend`].
#[derive(Debug)]
pub struct BackendRun {
    pub results: SessionResults,
    /// Chunks pushed into the session.
    pub chunks: u64,
    pub stats: ProcessingStats,
    /// Reading stopped early through the job's cancellation token.
    pub cancelled: bool,
}

/// Push `job`'s source into a fresh `backend` session chunk by chunk, then drain its results.
///
/// A missing source fails before a session is opened. The session is released exactly once
/// whatever happens; a failure to close it is logged and never replaces an earlier error.
pub fn stream_through_backend(
    backend: &dyn ProcessingBackend,
    job: StreamJob,
    opts: &PipelineOptions,
) -> EngineResult<BackendRun> {
    opts.validate()?;
    let StreamJob {
        source,
        operation,
        schema,
        mut progress,
        cancel,
    } = job;
    let start = Instant::now();

    let chunks = source.byte_chunks(opts.chunk_bytes)?;
    let mut session = Session::open(backend, &operation, schema.as_deref())?;
    tracing::debug!(
        engine = backend.name(),
        session = %session.id(),
        source = %source.path().display(),
        chunk_bytes = opts.chunk_bytes,
        "streaming source through backend"
    );

    let mut pushed = 0u64;
    let mut rows = 0u64;
    let mut largest_chunk = 0u64;
    for chunk in chunks {
        if cancel.is_cancelled() {
            tracing::info!(engine = backend.name(), pushed, "backend stream cancelled");
            break;
        }
        let chunk = chunk?;
        let accepted = session.push_chunk(&chunk.bytes)?;
        pushed += 1;
        rows = accepted.total_accumulated;
        largest_chunk = largest_chunk.max(chunk.bytes.len() as u64);

        if let Some(callback) = progress.as_mut() {
            let report = Progress {
                batch_index: chunk.index,
                batches_completed: pushed,
                rows_processed: rows,
                bytes_processed: chunk.consumed,
                total_bytes: chunk.total,
            };
            if let Err(e) = callback(&report) {
                tracing::warn!(batch_index = chunk.index, error = %e, "progress callback failed");
            }
        }
    }

    let results = session.drain_results()?;
    if let Err(e) = session.close() {
        tracing::warn!(engine = backend.name(), error = %e, "session close failed after drain");
    }

    let stats = ProcessingStats::new(
        operation.method(),
        start.elapsed(),
        rows,
        results.len() as u64,
        pushed,
        largest_chunk,
    );
    tracing::info!(engine = backend.name(), %stats, "backend stream complete");
    Ok(BackendRun {
        results,
        chunks: pushed,
        stats,
        cancelled: cancel.is_cancelled(),
    })
}
