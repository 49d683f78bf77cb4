//! Core data model: schemas, typed values, rows and batches.
//!
//! A [`Schema`] is fixed for the lifetime of one source. Every [`Row`] of a [`RowBatch`] carries
//! one [`Value`] per schema field, in schema order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Logical data type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point number.
    Float64,
    /// UTF-8 string.
    Utf8,
}

impl DataType {
    /// Whether values of this type can be compared against a numeric threshold or summed.
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Int64 => "int",
            DataType::Float64 => "float",
            DataType::Utf8 => "string",
        };
        f.write_str(s)
    }
}

/// A single named, typed field in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Field/column name.
    pub name: String,
    /// Field data type.
    pub data_type: DataType,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of fields describing the shape of every row read from one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered list of fields.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// The `name:string, age:int, salary:int, department:string` employee layout.
    pub fn employees() -> Self {
        Self::new(vec![
            Field::new("name", DataType::Utf8),
            Field::new("age", DataType::Int64),
            Field::new("salary", DataType::Int64),
            Field::new("department", DataType::Utf8),
        ])
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the index of a field by name, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns a field by name, if present.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A single typed scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
}

impl Value {
    /// The value's logical type.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int64(_) => DataType::Int64,
            Value::Float64(_) => DataType::Float64,
            Value::Utf8(_) => DataType::Utf8,
        }
    }

    /// Numeric view of the value; `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::Utf8(_) => None,
        }
    }

    /// String view of the value; `None` for numbers.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

/// A [`Value`] used as a grouping key.
///
/// Keys are totally ordered so grouped results can be materialized in a stable order:
/// integers numerically, floats by IEEE total order, strings lexically.
#[derive(Debug, Clone)]
pub struct GroupKey(pub Value);

impl GroupKey {
    /// Borrow the wrapped value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    fn rank(&self) -> u8 {
        match self.0 {
            Value::Int64(_) => 0,
            Value::Float64(_) => 1,
            Value::Utf8(_) => 2,
        }
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Utf8(a), Value::Utf8(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// One typed record, values in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row from values already in schema order.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Values in schema order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a schema position.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of a named column, resolved through `schema`.
    pub fn get_by_name<'a>(&'a self, schema: &Schema, name: &str) -> Option<&'a Value> {
        schema.index_of(name).and_then(|idx| self.values.get(idx))
    }

    /// Consume the row into its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// An ordered group of typed rows processed as a unit.
///
/// `index` is assigned when the batch is read, so it survives out-of-order completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    /// Zero-based, monotonic batch index assigned at read time.
    pub index: u64,
    /// Schema shared by every row.
    pub schema: Arc<Schema>,
    /// Row-major storage.
    pub rows: Vec<Row>,
}

impl RowBatch {
    /// Create a batch.
    pub fn new(index: u64, schema: Arc<Schema>, rows: Vec<Row>) -> Self {
        Self { index, schema, rows }
    }

    /// Number of rows in the batch.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch holds no rows. Empty batches are valid and still flow downstream.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, GroupKey, Row, Schema, Value};

    #[test]
    fn schema_index_of_works() {
        let schema = Schema::employees();
        assert_eq!(schema.index_of("name"), Some(0));
        assert_eq!(schema.index_of("salary"), Some(2));
        assert_eq!(schema.index_of("missing"), None);
        assert_eq!(schema.field("age").map(|f| f.data_type), Some(DataType::Int64));
    }

    #[test]
    fn row_lookup_by_name_goes_through_schema() {
        let schema = Schema::employees();
        let row = Row::new(vec![
            Value::from("Ada"),
            Value::Int64(36),
            Value::Int64(90_000),
            Value::from("Engineering"),
        ]);
        assert_eq!(row.get_by_name(&schema, "salary"), Some(&Value::Int64(90_000)));
        assert_eq!(row.get_by_name(&schema, "nope"), None);
    }

    #[test]
    fn group_keys_order_by_value() {
        let mut keys = vec![
            GroupKey(Value::from("Sales")),
            GroupKey(Value::from("Engineering")),
            GroupKey(Value::from("Marketing")),
        ];
        keys.sort();
        let names: Vec<_> = keys.iter().filter_map(|k| k.value().as_str()).collect();
        assert_eq!(names, vec!["Engineering", "Marketing", "Sales"]);

        assert!(GroupKey(Value::Int64(-1)) < GroupKey(Value::Int64(2)));
        assert!(GroupKey(Value::Float64(0.5)) < GroupKey(Value::Float64(1.5)));
        assert_eq!(GroupKey(Value::Float64(0.0)), GroupKey(Value::Float64(0.0)));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Int64(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float64(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::from("x").as_f64(), None);
        assert!(DataType::Float64.is_numeric());
        assert!(!DataType::Utf8.is_numeric());
    }
}
