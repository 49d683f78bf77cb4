//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::execution::sink::ErrorPolicy;

/// Options for a [`crate::execution::StreamingPipeline`] and the backend driver.
///
/// Every field has a documented default; use [`PipelineOptions::validate`] (called by the
/// pipeline constructor) to reject unusable values before any data is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Data rows per line-oriented batch. Default `1000`.
    pub batch_size: usize,
    /// Upper bound on concurrently applied batches. Default `4`.
    pub max_concurrency: usize,
    /// Bytes per chunk for byte-oriented reading. Default 1 MiB.
    pub chunk_bytes: usize,
    /// Capacity of the bounded reader → operator buffer, in batches. Default `8`.
    ///
    /// Together with `max_concurrency` this bounds how many batches are outstanding at once;
    /// a slow consumer stalls the reader instead of growing memory.
    pub buffer_size: usize,
    /// Field delimiter. Must be ASCII. Default `,`.
    pub delimiter: char,
    /// Deliver stateless results to the sink in batch-index order. Default `true`.
    ///
    /// Stateful aggregation always merges in index order regardless of this flag.
    pub preserve_order: bool,
    /// What to do when a batch fails. Default [`ErrorPolicy::FailFast`].
    pub error_policy: ErrorPolicy,
    /// Rows sampled for schema inference when no schema is supplied. Default `100`.
    pub infer_sample_rows: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_concurrency: 4,
            chunk_bytes: 1 << 20,
            buffer_size: 8,
            delimiter: ',',
            preserve_order: true,
            error_policy: ErrorPolicy::FailFast,
            infer_sample_rows: 100,
        }
    }
}

impl PipelineOptions {
    /// Parse options from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> EngineResult<Self> {
        let opts: Self = serde_json::from_str(s).map_err(|e| EngineError::InvalidConfig {
            message: e.to_string(),
        })?;
        opts.validate()?;
        Ok(opts)
    }

    /// Check every size is non-zero and the delimiter is a single ASCII byte.
    pub fn validate(&self) -> EngineResult<()> {
        let checks = [
            ("batch_size", self.batch_size),
            ("max_concurrency", self.max_concurrency),
            ("chunk_bytes", self.chunk_bytes),
            ("buffer_size", self.buffer_size),
            ("infer_sample_rows", self.infer_sample_rows),
        ];
        for (name, v) in checks {
            if v == 0 {
                return Err(EngineError::InvalidConfig {
                    message: format!("{name} must be > 0"),
                });
            }
        }
        if !self.delimiter.is_ascii() || matches!(self.delimiter, '\n' | '\r' | '"') {
            return Err(EngineError::InvalidConfig {
                message: format!("delimiter {:?} must be a single ASCII byte other than quote/newline", self.delimiter),
            });
        }
        Ok(())
    }

    /// Delimiter as the byte the CSV layer expects. Only meaningful after [`Self::validate`].
    pub fn delimiter_byte(&self) -> u8 {
        let mut buf = [0u8; 4];
        self.delimiter.encode_utf8(&mut buf);
        buf[0]
    }

    /// Maximum batches outstanding between read and sink.
    pub fn max_outstanding_batches(&self) -> usize {
        self.buffer_size + self.max_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineOptions;
    use crate::execution::sink::ErrorPolicy;

    #[test]
    fn defaults_match_documented_values() {
        let opts = PipelineOptions::default();
        assert_eq!(opts.batch_size, 1000);
        assert_eq!(opts.max_concurrency, 4);
        assert_eq!(opts.chunk_bytes, 1024 * 1024);
        assert_eq!(opts.delimiter_byte(), b',');
        assert_eq!(opts.error_policy, ErrorPolicy::FailFast);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let opts = PipelineOptions {
            batch_size: 0,
            ..Default::default()
        };
        let msg = opts.validate().unwrap_err().to_string();
        assert!(msg.contains("batch_size must be > 0"));

        let opts = PipelineOptions {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn non_ascii_delimiter_is_rejected() {
        let opts = PipelineOptions {
            delimiter: '§',
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn json_config_fills_defaults() {
        let opts =
            PipelineOptions::from_json_str(r#"{"batch_size": 50, "error_policy": "collect_all", "delimiter": ";"}"#)
                .unwrap();
        assert_eq!(opts.batch_size, 50);
        assert_eq!(opts.max_concurrency, 4);
        assert_eq!(opts.delimiter_byte(), b';');
        assert_eq!(opts.error_policy, ErrorPolicy::CollectAll);

        let err = PipelineOptions::from_json_str(r#"{"buffer_size": 0}"#).unwrap_err();
        assert!(err.to_string().contains("buffer_size"));
    }
}
