//! Operator engine.
//!
//! An [`Operation`] descriptor is compiled against a [`Schema`] into an [`Operator`]. Compilation
//! is where column names and types are checked, so a bad operation fails before any batch is read.
//! Operators are then applied per batch, possibly on several threads at once.
//!
//! Currently implemented:
//!
//! - [`PassthroughOperator`]: identity
//! - [`FilterOperator`]: numeric `>=` threshold
//! - [`GroupSumOperator`]: grouped sum producing per-batch [`GroupAccumulator`] partials
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rust_stream_processing::processing::{compile, Operation, OperatorOutput};
//! use rust_stream_processing::types::{Row, RowBatch, Schema, Value};
//!
//! let schema = Arc::new(Schema::employees());
//! let op: Operation = "filter:salary:60000".parse().unwrap();
//! let operator = compile(&op, Arc::clone(&schema)).unwrap();
//!
//! let batch = RowBatch::new(
//!     0,
//!     schema,
//!     vec![
//!         Row::new(vec!["Ann".into(), Value::Int64(30), Value::Int64(60_000), "Ops".into()]),
//!         Row::new(vec!["Ben".into(), Value::Int64(31), Value::Int64(59_999), "Ops".into()]),
//!     ],
//! );
//! match operator.apply(batch).unwrap() {
//!     OperatorOutput::Rows(rows) => assert_eq!(rows.len(), 1),
//!     OperatorOutput::Partial(_) => unreachable!(),
//! }
//! ```

pub mod filter;
pub mod group_sum;
pub mod operation;

use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::types::{Row, RowBatch, Schema};

pub use filter::FilterOperator;
pub use group_sum::{GroupAccumulator, GroupSumOperator, GroupTable};
pub use operation::Operation;

/// Result of applying an operator to one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorOutput {
    /// Output rows (possibly empty) in [`Operator::output_schema`].
    Rows(Vec<Row>),
    /// Partial aggregate state to be merged in batch-index order.
    Partial(GroupAccumulator),
}

/// A compiled, schema-checked operation.
///
/// Implementations must be safe to apply to different batches concurrently.
pub trait Operator: Send + Sync + fmt::Debug {
    /// Short name used in logs and stats.
    fn name(&self) -> &str;

    /// Schema of the rows this operator emits.
    fn output_schema(&self) -> Arc<Schema>;

    /// Initial cross-batch state for stateful operators; `None` for stateless ones.
    fn new_state(&self) -> Option<GroupAccumulator> {
        None
    }

    /// Apply to one batch.
    fn apply(&self, batch: RowBatch) -> EngineResult<OperatorOutput>;
}

/// Identity operator.
#[derive(Debug, Clone)]
pub struct PassthroughOperator {
    schema: Arc<Schema>,
}

impl PassthroughOperator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }
}

impl Operator for PassthroughOperator {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn output_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn apply(&self, batch: RowBatch) -> EngineResult<OperatorOutput> {
        Ok(OperatorOutput::Rows(batch.rows))
    }
}

/// Compile `operation` against `schema`.
pub fn compile(operation: &Operation, schema: Arc<Schema>) -> EngineResult<Arc<dyn Operator>> {
    Ok(match operation {
        Operation::Passthrough => Arc::new(PassthroughOperator::new(schema)),
        Operation::Filter { column, threshold } => Arc::new(FilterOperator::new(schema, column, *threshold)?),
        Operation::GroupSum {
            group_column,
            sum_column,
        } => Arc::new(GroupSumOperator::new(&schema, group_column, sum_column)?),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{compile, Operation, OperatorOutput};
    use crate::types::{Row, RowBatch, Schema, Value};

    #[test]
    fn passthrough_returns_the_same_rows() {
        let schema = Arc::new(Schema::employees());
        let op = compile(&Operation::Passthrough, Arc::clone(&schema)).unwrap();
        let rows = vec![Row::new(vec![
            Value::from("Ann"),
            Value::Int64(30),
            Value::Int64(1),
            Value::from("Ops"),
        ])];
        let out = op.apply(RowBatch::new(9, schema, rows.clone())).unwrap();
        assert_eq!(out, OperatorOutput::Rows(rows));
        assert!(op.new_state().is_none());
    }

    #[test]
    fn compile_fails_fast_on_bad_columns() {
        let schema = Arc::new(Schema::employees());
        let op: Operation = "groupby:department:bonus".parse().unwrap();
        let err = compile(&op, Arc::clone(&schema)).unwrap_err();
        assert!(err.to_string().starts_with("configure: invalid operator"));

        let op: Operation = "groupby:department:salary".parse().unwrap();
        let compiled = compile(&op, schema).unwrap();
        assert_eq!(compiled.output_schema().field_names().collect::<Vec<_>>(), vec!["department", "salary"]);
        assert!(compiled.new_state().is_some());
    }
}
