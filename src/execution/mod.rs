//! Streaming pipeline coordinator.
//!
//! This module sits "above" [`crate::ingestion`] and [`crate::processing`] and wires them into a
//! bounded, optionally parallel pipeline:
//!
//! ```text
//! reader task ──(bounded channel)──▶ N worker tasks ──▶ driving thread (reorder, merge, sink)
//! ```
//!
//! - One reader task assigns batch indices in read order.
//! - Workers parse and apply the operator; up to `max_concurrency` batches run at once.
//! - The calling thread reorders completed batches (when required), merges aggregation partials
//!   in index order, feeds the [`BatchSink`] and invokes the progress callback.
//!
//! Every batch holds a semaphore permit from read until the driving thread has handled it, so at
//! most `buffer_size + max_concurrency` batches are alive at once and a slow sink stalls the reader.

mod observer;
mod progress;
mod semaphore;
pub mod sink;
mod stats;

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::PipelineOptions;
use crate::error::{EngineError, EngineResult};
use crate::ingestion::csv::{RecordCodec, infer_schema};
use crate::ingestion::reader::{CsvSource, LineBatchReader, RawBatch};
use crate::processing::{GroupAccumulator, GroupTable, Operation, Operator, OperatorOutput, compile};
use crate::types::{Row, RowBatch, Schema};

pub use observer::{PipelineEvent, PipelineMetrics, PipelineMetricsSnapshot, PipelineObserver, TracingObserver};
pub use progress::{CancellationToken, Progress, ProgressCallback, ProgressError};
pub use sink::{
    BatchOutcome, BatchSink, CollectSink, CountSink, ErrorPolicy, NdjsonFileSink, collect_all, fold_fail_fast,
};
pub use stats::ProcessingStats;

use semaphore::Semaphore;

/// One source + operation to stream, plus per-run hooks.
pub struct StreamJob {
    pub(crate) source: CsvSource,
    pub(crate) operation: Operation,
    pub(crate) schema: Option<Arc<Schema>>,
    pub(crate) progress: Option<ProgressCallback>,
    pub(crate) cancel: CancellationToken,
}

impl StreamJob {
    /// Stream `path` through `operation`. The schema is inferred unless one is supplied.
    pub fn new(path: impl AsRef<Path>, operation: Operation) -> Self {
        Self {
            source: CsvSource::new(path),
            operation,
            schema: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `schema` instead of inferring one. Columns are located by name in the header.
    pub fn with_schema(mut self, schema: impl Into<Arc<Schema>>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Invoke `callback` after every completed batch. Callback errors are logged, not fatal.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Progress) -> Result<(), ProgressError> + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Stop reading when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &CsvSource {
        &self.source
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// What a completed run produced.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Schema of emitted rows (for aggregations: group column, sum column).
    pub schema: Arc<Schema>,
    /// One outcome per handled batch, ordered by batch index.
    pub outcomes: Vec<BatchOutcome>,
    /// Final grouped sums, for aggregating operations.
    pub groups: Option<GroupTable>,
    pub stats: ProcessingStats,
    /// The run was stopped through its [`CancellationToken`] before the source was exhausted.
    pub cancelled: bool,
}

impl PipelineOutput {
    /// No batch failed.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(BatchOutcome::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

/// Backpressured, bounded-concurrency streaming engine.
pub struct StreamingPipeline {
    pool: ThreadPool,
    opts: PipelineOptions,
    observer: Option<Arc<dyn PipelineObserver>>,
    metrics: Arc<PipelineMetrics>,
    /// Held for the length of a run: the pool and the metrics are sized for one run at a time.
    run_lock: Mutex<()>,
}

impl StreamingPipeline {
    /// Validate `opts` and build the worker pool (`max_concurrency` workers plus the reader).
    pub fn new(opts: PipelineOptions) -> EngineResult<Self> {
        opts.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(opts.max_concurrency + 1)
            .thread_name(|i| format!("stream-pipeline-{i}"))
            .build()
            .map_err(|e| EngineError::InvalidConfig {
                message: format!("failed to build worker pool: {e}"),
            })?;
        Ok(Self {
            pool,
            opts,
            observer: None,
            metrics: Arc::new(PipelineMetrics::new()),
            run_lock: Mutex::new(()),
        })
    }

    /// Attach an observer for pipeline events (metrics/logging).
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Get a handle to real-time pipeline metrics.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.opts
    }

    /// Run `job`, delivering stateless results to `sink`.
    ///
    /// Missing sources, header/schema mismatches and invalid operations fail before any batch is
    /// read. Per-batch failures follow the configured [`ErrorPolicy`]: fail-fast returns the
    /// lowest-index failure, collect-all returns every outcome in [`PipelineOutput::outcomes`].
    ///
    /// Runs sharing one pipeline from several threads are serialized; [`Self::metrics`] always
    /// describes the latest run.
    pub fn run(&self, job: StreamJob, sink: &mut dyn BatchSink) -> EngineResult<PipelineOutput> {
        // A panicking sink or callback poisons the lock but leaves nothing inconsistent behind it.
        let _run = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let StreamJob {
            source,
            operation,
            schema,
            progress,
            cancel,
        } = job;
        let start = Instant::now();

        let reader = source.line_batches(self.opts.batch_size)?;
        let codec = self.bind_codec(&source, reader.header(), schema)?;
        let operator = compile(&operation, Arc::clone(codec.schema()))?;
        let total_bytes = reader.total_bytes();

        self.metrics.begin_run();
        self.emit(PipelineEvent::RunStarted {
            method: operation.method(),
            total_bytes,
        });
        tracing::debug!(
            source = %source.path().display(),
            %operation,
            batch_size = self.opts.batch_size,
            max_concurrency = self.opts.max_concurrency,
            "starting streaming run"
        );

        let sem = Semaphore::new(self.opts.max_outstanding_batches());
        let stop = CancellationToken::new();
        let mut driver = Driver {
            pipeline: self,
            sink: &mut *sink,
            progress,
            sem: &sem,
            stop: &stop,
            schema: operator.output_schema(),
            ordered: self.opts.preserve_order || operation.is_stateful(),
            state: operator.new_state(),
            pending: BTreeMap::new(),
            next_index: 0,
            halted: false,
            outcomes: Vec::new(),
            read_error: None,
            batches_completed: 0,
            rows_processed: 0,
            bytes_processed: reader.bytes_consumed(),
            total_bytes,
        };

        let (work_tx, work_rx) = bounded::<RawBatch>(self.opts.buffer_size);
        let (done_tx, done_rx) = unbounded::<Completion>();

        self.pool.in_place_scope(|scope| {
            {
                let done_tx = done_tx.clone();
                let (sem, stop, cancel) = (&sem, &stop, &cancel);
                scope.spawn(move |_| self.read_loop(reader, work_tx, done_tx, sem, stop, cancel));
            }
            for _ in 0..self.opts.max_concurrency {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let (codec, operator) = (&codec, operator.as_ref());
                scope.spawn(move |_| self.work_loop(work_rx, done_tx, codec, operator));
            }
            drop(work_rx);
            drop(done_tx);

            for completion in done_rx.iter() {
                driver.on_completion(completion);
            }
        });

        let Tally {
            state,
            outcomes,
            read_error,
            batches_completed,
            rows_processed,
            sink_finished,
        } = driver.finish();

        let cancelled = cancel.is_cancelled();
        if cancelled {
            self.emit(PipelineEvent::Cancelled {
                batches_read: self.metrics.snapshot().batches_read,
            });
        }

        let elapsed = start.elapsed();
        self.metrics.end_run(elapsed);
        let snapshot = self.metrics.snapshot();
        self.emit(PipelineEvent::RunFinished {
            elapsed,
            metrics: snapshot.clone(),
        });

        if let Some(e) = read_error {
            return Err(e);
        }
        let mut outcomes = collect_all(outcomes);
        if self.opts.error_policy == ErrorPolicy::FailFast {
            if let Some(pos) = outcomes.iter().position(|o| !o.is_ok()) {
                if let Err(e) = outcomes.swap_remove(pos).result {
                    return Err(e);
                }
            }
        }
        sink_finished?;

        let groups = state.map(|acc| acc.into_table(operator.output_schema()));
        let rows_emitted = match &groups {
            Some(table) => table.len() as u64,
            None => outcomes.iter().filter_map(|o| o.result.as_ref().ok()).sum::<usize>() as u64,
        };
        let stats = ProcessingStats::new(
            operation.method(),
            elapsed,
            rows_processed,
            rows_emitted,
            batches_completed,
            snapshot.peak_buffered_bytes,
        );
        tracing::info!(%stats, cancelled, "streaming run complete");

        Ok(PipelineOutput {
            schema: operator.output_schema(),
            outcomes,
            groups,
            stats,
            cancelled,
        })
    }

    /// Run `job` collecting every result row in memory, ordered by batch index.
    pub fn collect(&self, job: StreamJob) -> EngineResult<(Vec<Row>, PipelineOutput)> {
        let mut sink = CollectSink::new();
        let output = self.run(job, &mut sink)?;
        Ok((sink.into_rows(), output))
    }

    fn bind_codec(
        &self,
        source: &CsvSource,
        header: Option<&str>,
        schema: Option<Arc<Schema>>,
    ) -> EngineResult<RecordCodec> {
        let delimiter = self.opts.delimiter_byte();
        let schema = match schema {
            Some(schema) => schema,
            None => Arc::new(infer_schema(source, delimiter, self.opts.infer_sample_rows)?),
        };
        match header {
            Some(header) => RecordCodec::bind_header(schema, header, delimiter),
            None => Ok(RecordCodec::new(schema, delimiter)),
        }
    }

    fn read_loop<R: BufRead>(
        &self,
        mut reader: LineBatchReader<R>,
        work_tx: Sender<RawBatch>,
        done_tx: Sender<Completion>,
        sem: &Semaphore,
        stop: &CancellationToken,
        cancel: &CancellationToken,
    ) {
        let halted = || stop.is_cancelled() || cancel.is_cancelled();
        while !halted() {
            let waited = sem.acquire();
            if waited > Duration::ZERO {
                self.metrics.on_throttle_wait(waited);
                self.emit(PipelineEvent::ThrottleWaited { duration: waited });
            }
            if halted() {
                sem.release();
                break;
            }
            match reader.next_batch() {
                Ok(Some(batch)) => {
                    self.metrics.on_batch_read(batch.len(), batch.byte_len);
                    self.emit(PipelineEvent::BatchRead {
                        index: batch.index,
                        rows: batch.len(),
                        bytes: batch.byte_len,
                    });
                    if work_tx.send(batch).is_err() {
                        sem.release();
                        break;
                    }
                }
                Ok(None) => {
                    sem.release();
                    break;
                }
                Err(e) => {
                    sem.release();
                    let _ = done_tx.send(Completion::ReadFailed(e));
                    break;
                }
            }
        }
    }

    fn work_loop(
        &self,
        work_rx: Receiver<RawBatch>,
        done_tx: Sender<Completion>,
        codec: &RecordCodec,
        operator: &dyn Operator,
    ) {
        for raw in work_rx {
            let rows_in = raw.len();
            self.metrics.on_batch_start();
            self.emit(PipelineEvent::BatchStarted {
                index: raw.index,
                rows: rows_in,
            });

            let result = codec.parse_batch(&raw).and_then(|batch| operator.apply(batch));

            self.metrics.on_batch_end();
            let done = Completion::Processed(Processed {
                index: raw.index,
                rows_in,
                byte_len: raw.byte_len,
                result,
            });
            if done_tx.send(done).is_err() {
                break;
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(obs) = &self.observer {
            obs.on_event(&event);
        }
    }
}

struct Processed {
    index: u64,
    rows_in: usize,
    byte_len: u64,
    result: EngineResult<OperatorOutput>,
}

enum Completion {
    Processed(Processed),
    ReadFailed(EngineError),
}

/// State owned by the thread driving a run: reorder buffer, accumulator, sink and progress.
struct Driver<'a> {
    pipeline: &'a StreamingPipeline,
    sink: &'a mut dyn BatchSink,
    progress: Option<ProgressCallback>,
    sem: &'a Semaphore,
    stop: &'a CancellationToken,
    schema: Arc<Schema>,
    ordered: bool,
    state: Option<GroupAccumulator>,
    pending: BTreeMap<u64, Processed>,
    next_index: u64,
    /// A fail-fast failure was seen; successful batches are no longer delivered.
    halted: bool,
    outcomes: Vec<BatchOutcome>,
    read_error: Option<EngineError>,
    batches_completed: u64,
    rows_processed: u64,
    bytes_processed: u64,
    total_bytes: Option<u64>,
}

/// What the driving thread accumulated over a run.
struct Tally {
    state: Option<GroupAccumulator>,
    outcomes: Vec<BatchOutcome>,
    read_error: Option<EngineError>,
    batches_completed: u64,
    rows_processed: u64,
    sink_finished: EngineResult<()>,
}

impl Driver<'_> {
    fn finish(self) -> Tally {
        let sink_finished = self.sink.finish();
        Tally {
            state: self.state,
            outcomes: self.outcomes,
            read_error: self.read_error,
            batches_completed: self.batches_completed,
            rows_processed: self.rows_processed,
            sink_finished,
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ReadFailed(e) => {
                tracing::warn!(error = %e, "source read failed mid-stream");
                self.stop.cancel();
                if self.read_error.is_none() {
                    self.read_error = Some(e);
                }
            }
            Completion::Processed(done) if !self.ordered => self.handle(done),
            Completion::Processed(done) => {
                self.pending.insert(done.index, done);
                while let Some(next) = self.pending.remove(&self.next_index) {
                    self.next_index += 1;
                    self.handle(next);
                }
            }
        }
    }

    fn handle(&mut self, done: Processed) {
        let Processed {
            index,
            rows_in,
            byte_len,
            result,
        } = done;
        self.batches_completed += 1;
        self.rows_processed += rows_in as u64;
        self.bytes_processed += byte_len;

        let result = match result {
            Err(e) => Some(Err(e)),
            Ok(_) if self.halted => None,
            Ok(output) => Some(self.deliver(index, output)),
        };
        let metrics = &self.pipeline.metrics;
        match result {
            Some(Ok(rows_out)) => {
                metrics.on_batch_handled(byte_len, rows_out, false);
                self.pipeline.emit(PipelineEvent::BatchFinished {
                    index,
                    rows_in,
                    rows_out,
                });
                self.outcomes.push(BatchOutcome {
                    index,
                    rows_in,
                    result: Ok(rows_out),
                });
            }
            Some(Err(e)) => {
                metrics.on_batch_handled(byte_len, 0, true);
                self.pipeline.emit(PipelineEvent::BatchFailed {
                    index,
                    stage: e.stage(),
                    message: e.to_string(),
                });
                if self.pipeline.opts.error_policy == ErrorPolicy::FailFast && !self.halted {
                    tracing::debug!(index, "fail-fast: no further batches will be read");
                    self.halted = true;
                    self.stop.cancel();
                }
                self.outcomes.push(BatchOutcome {
                    index,
                    rows_in,
                    result: Err(e),
                });
            }
            None => metrics.on_batch_dropped(byte_len),
        }
        self.sem.release();
        self.report_progress(index);
    }

    fn deliver(&mut self, index: u64, output: OperatorOutput) -> EngineResult<usize> {
        match output {
            OperatorOutput::Rows(rows) => {
                let n = rows.len();
                self.sink.accept(RowBatch::new(index, Arc::clone(&self.schema), rows))?;
                Ok(n)
            }
            OperatorOutput::Partial(partial) => {
                match self.state.as_mut() {
                    Some(acc) => acc
                        .merge(partial)
                        .map_err(|reason| EngineError::OperatorApplication {
                            batch_index: index,
                            reason,
                        })?,
                    None => self.state = Some(partial),
                }
                Ok(0)
            }
        }
    }

    fn report_progress(&mut self, batch_index: u64) {
        let Some(callback) = self.progress.as_mut() else {
            return;
        };
        let progress = Progress {
            batch_index,
            batches_completed: self.batches_completed,
            rows_processed: self.rows_processed,
            bytes_processed: self.bytes_processed,
            total_bytes: self.total_bytes,
        };
        if let Err(e) = callback(&progress) {
            tracing::warn!(batch_index, error = %e, "progress callback failed");
            self.pipeline.emit(PipelineEvent::ProgressCallbackFailed {
                batch_index,
                message: e.to_string(),
            });
        }
    }
}
