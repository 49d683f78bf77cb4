use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::Stage;

/// Events emitted by the streaming pipeline.
///
/// `BatchRead` and `BatchStarted` are emitted from reader/worker threads; everything else from
/// the thread driving the run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        method: &'static str,
        total_bytes: Option<u64>,
    },
    BatchRead { index: u64, rows: usize, bytes: u64 },
    ThrottleWaited { duration: Duration },
    BatchStarted { index: u64, rows: usize },
    BatchFinished { index: u64, rows_in: usize, rows_out: usize },
    BatchFailed { index: u64, stage: Stage, message: String },
    ProgressCallbackFailed { batch_index: u64, message: String },
    Cancelled { batches_read: u64 },
    RunFinished {
        elapsed: Duration,
        metrics: PipelineMetricsSnapshot,
    },
}

/// Observer hook for pipeline events.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Forwards pipeline events to `tracing`.
///
/// Per-batch events go to `debug`/`trace`, run boundaries to `info`, failures to `warn`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RunStarted { method, total_bytes } => {
                tracing::info!(method, ?total_bytes, "pipeline run started");
            }
            PipelineEvent::BatchRead { index, rows, bytes } => {
                tracing::trace!(index, rows, bytes, "batch read");
            }
            PipelineEvent::ThrottleWaited { duration } => {
                tracing::debug!(?duration, "reader throttled by backpressure");
            }
            PipelineEvent::BatchStarted { index, rows } => {
                tracing::trace!(index, rows, "batch started");
            }
            PipelineEvent::BatchFinished {
                index,
                rows_in,
                rows_out,
            } => {
                tracing::debug!(index, rows_in, rows_out, "batch finished");
            }
            PipelineEvent::BatchFailed { index, stage, message } => {
                tracing::warn!(index, %stage, %message, "batch failed");
            }
            PipelineEvent::ProgressCallbackFailed { batch_index, message } => {
                tracing::warn!(batch_index, %message, "progress callback failed");
            }
            PipelineEvent::Cancelled { batches_read } => {
                tracing::info!(batches_read, "pipeline cancelled");
            }
            PipelineEvent::RunFinished { elapsed, metrics } => {
                tracing::info!(?elapsed, %metrics, "pipeline run finished");
            }
        }
    }
}

/// Real-time metrics for a pipeline run.
///
/// The pipeline updates these counters while it runs; callers can snapshot them at any time,
/// including from another thread.
pub struct PipelineMetrics {
    run_id: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    elapsed_ns: AtomicU64,

    batches_read: AtomicU64,
    batches_finished: AtomicU64,
    batches_failed: AtomicU64,
    rows_read: AtomicU64,
    rows_emitted: AtomicU64,
    bytes_read: AtomicU64,
    throttle_wait_ns: AtomicU64,

    active_batches: AtomicUsize,
    max_active_batches: AtomicUsize,
    buffered_bytes: AtomicU64,
    peak_buffered_bytes: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            run_id: AtomicU64::new(0),
            started_at: Mutex::new(None),
            elapsed_ns: AtomicU64::new(0),
            batches_read: AtomicU64::new(0),
            batches_finished: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            rows_read: AtomicU64::new(0),
            rows_emitted: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            throttle_wait_ns: AtomicU64::new(0),
            active_batches: AtomicUsize::new(0),
            max_active_batches: AtomicUsize::new(0),
            buffered_bytes: AtomicU64::new(0),
            peak_buffered_bytes: AtomicU64::new(0),
        }
    }

    pub fn begin_run(&self) {
        let _ = self.run_id.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock().expect("metrics mutex poisoned") = Some(Instant::now());

        for counter in [
            &self.elapsed_ns,
            &self.batches_read,
            &self.batches_finished,
            &self.batches_failed,
            &self.rows_read,
            &self.rows_emitted,
            &self.bytes_read,
            &self.throttle_wait_ns,
            &self.buffered_bytes,
            &self.peak_buffered_bytes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.active_batches.store(0, Ordering::SeqCst);
        self.max_active_batches.store(0, Ordering::SeqCst);
    }

    pub fn end_run(&self, elapsed: Duration) {
        self.elapsed_ns.store(duration_ns(elapsed), Ordering::SeqCst);
    }

    /// Time since the current run started.
    pub fn running_for(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .expect("metrics mutex poisoned")
            .map(|t| t.elapsed())
    }

    pub fn on_batch_read(&self, rows: usize, bytes: u64) {
        let _ = self.batches_read.fetch_add(1, Ordering::SeqCst);
        let _ = self.rows_read.fetch_add(rows as u64, Ordering::SeqCst);
        let _ = self.bytes_read.fetch_add(bytes, Ordering::SeqCst);
        let now = self.buffered_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        update_max_u64(&self.peak_buffered_bytes, now);
    }

    pub fn on_batch_start(&self) {
        let now = self.active_batches.fetch_add(1, Ordering::SeqCst) + 1;
        update_max_usize(&self.max_active_batches, now);
    }

    pub fn on_batch_end(&self) {
        let _ = self.active_batches.fetch_sub(1, Ordering::SeqCst);
    }

    /// A batch left the pipeline (emitted, merged, failed or skipped).
    pub fn on_batch_handled(&self, bytes: u64, rows_emitted: usize, failed: bool) {
        let _ = self.buffered_bytes.fetch_sub(bytes, Ordering::SeqCst);
        let _ = self.rows_emitted.fetch_add(rows_emitted as u64, Ordering::SeqCst);
        if failed {
            let _ = self.batches_failed.fetch_add(1, Ordering::SeqCst);
        } else {
            let _ = self.batches_finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A processed batch was discarded after a fail-fast stop.
    pub fn on_batch_dropped(&self, bytes: u64) {
        let _ = self.buffered_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn on_throttle_wait(&self, d: Duration) {
        let _ = self.throttle_wait_ns.fetch_add(duration_ns(d), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        let elapsed_ns = self.elapsed_ns.load(Ordering::SeqCst);
        PipelineMetricsSnapshot {
            run_id: self.run_id.load(Ordering::SeqCst),
            elapsed: (elapsed_ns > 0).then(|| Duration::from_nanos(elapsed_ns)),
            batches_read: self.batches_read.load(Ordering::SeqCst),
            batches_finished: self.batches_finished.load(Ordering::SeqCst),
            batches_failed: self.batches_failed.load(Ordering::SeqCst),
            rows_read: self.rows_read.load(Ordering::SeqCst),
            rows_emitted: self.rows_emitted.load(Ordering::SeqCst),
            bytes_read: self.bytes_read.load(Ordering::SeqCst),
            throttle_wait: Duration::from_nanos(self.throttle_wait_ns.load(Ordering::SeqCst)),
            max_active_batches: self.max_active_batches.load(Ordering::SeqCst),
            peak_buffered_bytes: self.peak_buffered_bytes.load(Ordering::SeqCst),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

fn update_max_usize(dst: &AtomicUsize, now: usize) {
    let _ = dst.fetch_max(now, Ordering::SeqCst);
}

fn update_max_u64(dst: &AtomicU64, now: u64) {
    let _ = dst.fetch_max(now, Ordering::SeqCst);
}

/// Immutable snapshot of [`PipelineMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub run_id: u64,
    pub elapsed: Option<Duration>,
    pub batches_read: u64,
    pub batches_finished: u64,
    pub batches_failed: u64,
    pub rows_read: u64,
    pub rows_emitted: u64,
    pub bytes_read: u64,
    pub throttle_wait: Duration,
    pub max_active_batches: usize,
    pub peak_buffered_bytes: u64,
}

impl fmt::Display for PipelineMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, rows={}/{}, batches={}/{} (failed {}), max_active_batches={}, peak_buffered={}B, throttle_wait={:?}, elapsed={:?}",
            self.run_id,
            self.rows_emitted,
            self.rows_read,
            self.batches_finished,
            self.batches_read,
            self.batches_failed,
            self.max_active_batches,
            self.peak_buffered_bytes,
            self.throttle_wait,
            self.elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PipelineMetrics;

    #[test]
    fn buffered_bytes_track_a_peak() {
        let m = PipelineMetrics::new();
        m.begin_run();
        m.on_batch_read(10, 100);
        m.on_batch_read(10, 50);
        m.on_batch_handled(100, 10, false);
        m.on_batch_read(5, 20);
        m.on_batch_handled(50, 0, true);
        m.on_batch_handled(20, 5, false);
        m.end_run(Duration::from_millis(3));

        let s = m.snapshot();
        assert_eq!(s.run_id, 1);
        assert_eq!(s.batches_read, 3);
        assert_eq!(s.batches_finished, 2);
        assert_eq!(s.batches_failed, 1);
        assert_eq!(s.rows_read, 25);
        assert_eq!(s.rows_emitted, 15);
        assert_eq!(s.bytes_read, 170);
        assert_eq!(s.peak_buffered_bytes, 150);
        assert_eq!(s.elapsed, Some(Duration::from_millis(3)));
    }

    #[test]
    fn begin_run_resets_counters() {
        let m = PipelineMetrics::new();
        m.begin_run();
        m.on_batch_start();
        m.on_batch_start();
        m.on_batch_end();
        m.on_batch_end();
        assert_eq!(m.snapshot().max_active_batches, 2);
        m.begin_run();
        let s = m.snapshot();
        assert_eq!(s.run_id, 2);
        assert_eq!(s.max_active_batches, 0);
        assert_eq!(s.elapsed, None);
        assert!(m.running_for().is_some());
    }
}
