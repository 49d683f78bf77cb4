//! Grouped sum aggregation.
//!
//! [`GroupSumOperator`] is the one stateful operator: each batch folds into a
//! [`GroupAccumulator`], and partial accumulators from different batches are merged in batch
//! index order. The final mapping is materialized as a key-sorted [`GroupTable`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::ingestion::csv::row_to_json;
use crate::types::{DataType, Field, GroupKey, Row, RowBatch, Schema, Value};

use super::{Operator, OperatorOutput};

/// Running `group key → sum` state for one aggregation session.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAccumulator {
    sum_type: DataType,
    sums: BTreeMap<GroupKey, Value>,
}

impl GroupAccumulator {
    /// Empty accumulator summing values of `sum_type` (`Int64` or `Float64`).
    pub fn new(sum_type: DataType) -> Self {
        Self {
            sum_type,
            sums: BTreeMap::new(),
        }
    }

    /// Add `amount` to the running sum for `key`.
    ///
    /// Integer sums fail on overflow rather than wrapping.
    pub fn add(&mut self, key: Value, amount: &Value) -> Result<(), String> {
        match self.sums.get_mut(&GroupKey(key.clone())) {
            Some(sum) => {
                *sum = add_values(sum, amount)?;
            }
            None => {
                let start = match (self.sum_type, amount) {
                    (DataType::Float64, Value::Int64(v)) => Value::Float64(*v as f64),
                    (_, v) => v.clone(),
                };
                self.sums.insert(GroupKey(key), start);
            }
        }
        Ok(())
    }

    /// Fold every entry of `other` into `self`.
    pub fn merge(&mut self, other: GroupAccumulator) -> Result<(), String> {
        for (key, amount) in other.sums {
            self.add(key.0, &amount)?;
        }
        Ok(())
    }

    /// Current sum for `key`. During streaming this is in-progress state.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.sums.get(&GroupKey(key.clone()))
    }

    /// Number of distinct groups.
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    /// Whether no group has been seen.
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Materialize into a key-sorted table with the given column layout.
    pub fn into_table(self, schema: Arc<Schema>) -> GroupTable {
        GroupTable {
            schema,
            entries: self.sums.into_iter().map(|(k, v)| (k.0, v)).collect(),
        }
    }
}

fn add_values(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => x
            .checked_add(*y)
            .map(Value::Int64)
            .ok_or_else(|| format!("integer sum overflow ({x} + {y})")),
        (Value::Float64(x), Value::Float64(y)) => Ok(Value::Float64(x + y)),
        (Value::Float64(x), Value::Int64(y)) => Ok(Value::Float64(x + *y as f64)),
        (Value::Int64(x), Value::Float64(y)) => Ok(Value::Float64(*x as f64 + y)),
        _ => Err(format!("cannot sum non-numeric values {a:?} and {b:?}")),
    }
}

/// Final grouped sums, ordered by group key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTable {
    schema: Arc<Schema>,
    entries: Vec<(Value, Value)>,
}

impl GroupTable {
    /// Two-column layout: group column, then sum column.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// `(key, sum)` pairs in key order.
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Sum for a group key.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        let probe = GroupKey(key.clone());
        self.entries
            .binary_search_by(|(k, _)| GroupKey(k.clone()).cmp(&probe))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no groups.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The table as typed rows of [`Self::schema`].
    pub fn rows(&self) -> Vec<Row> {
        self.entries
            .iter()
            .map(|(k, v)| Row::new(vec![k.clone(), v.clone()]))
            .collect()
    }

    /// JSON array of `{group column: key, sum column: sum}` objects.
    pub fn to_json(&self) -> EngineResult<serde_json::Value> {
        let rows = self
            .rows()
            .iter()
            .map(|row| row_to_json(&self.schema, row))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(serde_json::Value::Array(rows))
    }
}

/// `sum[row[group_column]] += row[sum_column]`.
#[derive(Debug, Clone)]
pub struct GroupSumOperator {
    group_idx: usize,
    sum_idx: usize,
    sum_type: DataType,
    output_schema: Arc<Schema>,
}

impl GroupSumOperator {
    /// Build a grouped sum over `schema`. The sum column must be numeric.
    pub fn new(schema: &Schema, group_column: &str, sum_column: &str) -> EngineResult<Self> {
        let lookup = |column: &str, role: &str| {
            schema.index_of(column).ok_or_else(|| EngineError::OperatorConstruction {
                reason: format!(
                    "{role} column '{column}' not in schema {:?}",
                    schema.field_names().collect::<Vec<_>>()
                ),
            })
        };
        if group_column == sum_column {
            return Err(EngineError::OperatorConstruction {
                reason: format!("group column and sum column are both '{group_column}'"),
            });
        }
        let group_idx = lookup(group_column, "group")?;
        let sum_idx = lookup(sum_column, "sum")?;
        let sum_type = schema.fields[sum_idx].data_type;
        if !sum_type.is_numeric() {
            return Err(EngineError::OperatorConstruction {
                reason: format!("sum column '{sum_column}' is {sum_type}, expected a numeric column"),
            });
        }
        let output_schema = Arc::new(Schema::new(vec![
            schema.fields[group_idx].clone(),
            Field::new(sum_column, sum_type),
        ]));
        Ok(Self {
            group_idx,
            sum_idx,
            sum_type,
            output_schema,
        })
    }

    /// A fresh, empty accumulator for this operator.
    pub fn new_accumulator(&self) -> GroupAccumulator {
        GroupAccumulator::new(self.sum_type)
    }

    /// Fold `rows` into `acc` in place (single-writer use).
    pub fn fold_into(&self, acc: &mut GroupAccumulator, rows: &[Row], batch_index: u64) -> EngineResult<()> {
        for row in rows {
            let (key, amount) = match (row.get(self.group_idx), row.get(self.sum_idx)) {
                (Some(k), Some(v)) => (k, v),
                _ => {
                    return Err(EngineError::OperatorApplication {
                        batch_index,
                        reason: format!("row has {} values, expected the group and sum columns", row.len()),
                    });
                }
            };
            acc.add(key.clone(), amount)
                .map_err(|reason| EngineError::OperatorApplication { batch_index, reason })?;
        }
        Ok(())
    }
}

impl Operator for GroupSumOperator {
    fn name(&self) -> &str {
        "groupby"
    }

    fn output_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.output_schema)
    }

    fn new_state(&self) -> Option<GroupAccumulator> {
        Some(self.new_accumulator())
    }

    fn apply(&self, batch: RowBatch) -> EngineResult<OperatorOutput> {
        let mut acc = self.new_accumulator();
        self.fold_into(&mut acc, &batch.rows, batch.index)?;
        Ok(OperatorOutput::Partial(acc))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{GroupAccumulator, GroupSumOperator};
    use crate::processing::{Operator, OperatorOutput};
    use crate::types::{DataType, Row, RowBatch, Schema, Value};

    fn row(dept: &str, salary: i64) -> Row {
        Row::new(vec![
            Value::from("x"),
            Value::Int64(40),
            Value::Int64(salary),
            Value::from(dept),
        ])
    }

    fn partial(op: &GroupSumOperator, index: u64, rows: Vec<Row>) -> GroupAccumulator {
        match op.apply(RowBatch::new(index, Arc::new(Schema::employees()), rows)).unwrap() {
            OperatorOutput::Partial(acc) => acc,
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn sums_are_independent_of_batch_boundaries() {
        let op = GroupSumOperator::new(&Schema::employees(), "department", "salary").unwrap();
        let all = vec![row("Eng", 50_000), row("Eng", 70_000), row("Sales", 60_000)];

        let mut whole = op.new_accumulator();
        op.fold_into(&mut whole, &all, 0).unwrap();

        let mut split = partial(&op, 0, vec![all[0].clone()]);
        split.merge(partial(&op, 1, vec![all[1].clone(), all[2].clone()])).unwrap();

        assert_eq!(whole, split);
        let table = split.into_table(op.output_schema());
        assert_eq!(table.get(&Value::from("Eng")), Some(&Value::Int64(120_000)));
        assert_eq!(table.get(&Value::from("Sales")), Some(&Value::Int64(60_000)));
        assert_eq!(table.get(&Value::from("Ops")), None);
    }

    #[test]
    fn table_is_sorted_by_key_and_serializes() {
        let op = GroupSumOperator::new(&Schema::employees(), "department", "salary").unwrap();
        let acc = partial(&op, 0, vec![row("Sales", 1), row("Eng", 2), row("Marketing", 3), row("Eng", 4)]);
        let table = acc.into_table(op.output_schema());
        let keys: Vec<_> = table.entries().iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["Eng", "Marketing", "Sales"]);
        assert_eq!(
            table.to_json().unwrap(),
            serde_json::json!([
                {"department": "Eng", "salary": 6},
                {"department": "Marketing", "salary": 3},
                {"department": "Sales", "salary": 1},
            ])
        );
    }

    #[test]
    fn integer_overflow_is_an_application_error() {
        let op = GroupSumOperator::new(&Schema::employees(), "department", "salary").unwrap();
        let mut acc = op.new_accumulator();
        let err = op
            .fold_into(&mut acc, &[row("Eng", i64::MAX), row("Eng", 1)], 5)
            .unwrap_err();
        assert_eq!(err.batch_index(), Some(5));
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn float_sums_accumulate_as_floats() {
        let mut acc = GroupAccumulator::new(DataType::Float64);
        acc.add(Value::from("a"), &Value::Float64(0.5)).unwrap();
        acc.add(Value::from("a"), &Value::Float64(0.25)).unwrap();
        assert_eq!(acc.get(&Value::from("a")), Some(&Value::Float64(0.75)));
    }

    #[test]
    fn construction_checks_columns() {
        let schema = Schema::employees();
        assert!(GroupSumOperator::new(&schema, "department", "name")
            .unwrap_err()
            .to_string()
            .contains("expected a numeric column"));
        assert!(GroupSumOperator::new(&schema, "team", "salary")
            .unwrap_err()
            .to_string()
            .contains("group column 'team'"));
        assert!(GroupSumOperator::new(&schema, "salary", "salary")
            .unwrap_err()
            .to_string()
            .contains("both 'salary'"));
    }
}
