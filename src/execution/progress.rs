//! Progress reporting and cooperative cancellation.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cumulative progress, reported after each completed batch.
///
/// Counts are cumulative over *completed* batches, so they increase monotonically even when
/// batches complete out of index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the batch whose completion triggered this report.
    pub batch_index: u64,
    /// Batches completed so far.
    pub batches_completed: u64,
    /// Data rows processed so far.
    pub rows_processed: u64,
    /// Source bytes processed so far (header included).
    pub bytes_processed: u64,
    /// Total source size, when known.
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Fraction of the source processed, in `[0, 1]`, when the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_processed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Error a progress callback may report. Logged by the pipeline, never fatal.
pub type ProgressError = Box<dyn Error + Send + Sync>;

/// Progress callback, invoked synchronously on the thread driving the pipeline.
pub type ProgressCallback = Box<dyn FnMut(&Progress) -> Result<(), ProgressError>>;

/// Shared flag used to stop a running pipeline.
///
/// Cancelling stops new batches from being read; batches already dispatched still complete.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{CancellationToken, Progress};

    #[test]
    fn fraction_is_bounded() {
        let mut p = Progress {
            batch_index: 0,
            batches_completed: 1,
            rows_processed: 10,
            bytes_processed: 50,
            total_bytes: Some(200),
        };
        assert_eq!(p.fraction(), Some(0.25));
        p.bytes_processed = 300;
        assert_eq!(p.fraction(), Some(1.0));
        p.total_bytes = None;
        assert_eq!(p.fraction(), None);
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
