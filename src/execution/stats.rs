use std::fmt;
use std::time::Duration;

/// Per-run processing statistics, labeled by operation method.
///
/// Purely observational.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingStats {
    /// Operation label (`passthrough`, `filter`, `groupby`).
    pub method: String,
    pub duration: Duration,
    /// Data rows read from the source.
    pub rows_processed: u64,
    /// Rows delivered to the sink (or group rows for aggregations).
    pub rows_emitted: u64,
    pub batches: u64,
    pub throughput_rows_per_sec: f64,
    /// Peak bytes of source text held by batches in flight.
    pub peak_buffered_bytes: u64,
}

impl ProcessingStats {
    pub fn new(
        method: impl Into<String>,
        duration: Duration,
        rows_processed: u64,
        rows_emitted: u64,
        batches: u64,
        peak_buffered_bytes: u64,
    ) -> Self {
        let secs = duration.as_secs_f64();
        let throughput_rows_per_sec = if secs > 0.0 { rows_processed as f64 / secs } else { 0.0 };
        Self {
            method: method.into(),
            duration,
            rows_processed,
            rows_emitted,
            batches,
            throughput_rows_per_sec,
            peak_buffered_bytes,
        }
    }
}

impl fmt::Display for ProcessingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "method={}, rows={}, emitted={}, batches={}, duration={:?}, throughput={:.0} rows/s, peak_buffered={}B",
            self.method,
            self.rows_processed,
            self.rows_emitted,
            self.batches,
            self.duration,
            self.throughput_rows_per_sec,
            self.peak_buffered_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ProcessingStats;

    #[test]
    fn throughput_is_never_negative_or_nan() {
        let s = ProcessingStats::new("filter", Duration::from_secs(2), 1_000, 400, 1, 64);
        assert_eq!(s.throughput_rows_per_sec, 500.0);
        let z = ProcessingStats::new("filter", Duration::ZERO, 1_000, 0, 1, 0);
        assert_eq!(z.throughput_rows_per_sec, 0.0);
        assert!(s.to_string().starts_with("method=filter"));
    }
}
