//! Numeric threshold filter.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::types::{Row, RowBatch, Schema, Value};

use super::{Operator, OperatorOutput};

/// Keeps rows whose `column` value is `>= threshold` (inclusive).
///
/// The column must be numeric; this is checked once at construction, so applying the filter
/// to a batch of the same schema cannot fail.
#[derive(Debug, Clone)]
pub struct FilterOperator {
    schema: Arc<Schema>,
    column: String,
    column_idx: usize,
    threshold: f64,
}

impl FilterOperator {
    /// Build a filter over `schema`.
    pub fn new(schema: Arc<Schema>, column: &str, threshold: f64) -> EngineResult<Self> {
        let column_idx = schema.index_of(column).ok_or_else(|| EngineError::OperatorConstruction {
            reason: format!("filter column '{column}' not in schema {:?}", schema.field_names().collect::<Vec<_>>()),
        })?;
        if !threshold.is_finite() {
            return Err(EngineError::OperatorConstruction {
                reason: format!("filter threshold {threshold} must be finite"),
            });
        }
        let data_type = schema.fields[column_idx].data_type;
        if !data_type.is_numeric() {
            return Err(EngineError::OperatorConstruction {
                reason: format!("filter column '{column}' is {data_type}, expected a numeric column"),
            });
        }
        Ok(Self {
            schema,
            column: column.to_string(),
            column_idx,
            threshold,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether a single row passes the filter.
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(self.column_idx) {
            Some(Value::Int64(v)) => int_at_least(*v, self.threshold),
            Some(Value::Float64(v)) => *v >= self.threshold,
            _ => false,
        }
    }
}

/// `v >= threshold` without rounding `v` through `f64`.
fn int_at_least(v: i64, threshold: f64) -> bool {
    let bound = threshold.ceil();
    // i64::MIN and i64::MAX + 1 are both exact in f64.
    if bound <= i64::MIN as f64 {
        true
    } else if bound >= i64::MAX as f64 {
        false
    } else {
        v >= bound as i64
    }
}

impl Operator for FilterOperator {
    fn name(&self) -> &str {
        "filter"
    }

    fn output_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn apply(&self, batch: RowBatch) -> EngineResult<OperatorOutput> {
        let rows: Vec<Row> = batch.rows.into_iter().filter(|row| self.matches(row)).collect();
        Ok(OperatorOutput::Rows(rows))
    }
}
