//! Record codec: delimited text ⇄ typed [`Row`]s.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult, RecordError};
use crate::types::{DataType, Field, Row, RowBatch, Schema, Value};

use super::reader::{CsvSource, RawBatch};

/// Converts raw delimited lines into typed rows for one [`Schema`], and back.
///
/// A codec is bound to the source's column layout: schema fields may appear in any order in the
/// header (extra header columns are ignored), and every record must carry exactly as many fields
/// as the header. Missing or uncoercible fields are errors, never silent defaults.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    schema: Arc<Schema>,
    /// Source column position of each schema field.
    positions: Vec<usize>,
    source_width: usize,
    delimiter: u8,
}

impl RecordCodec {
    /// Codec for sources whose columns are exactly the schema's fields, in order.
    pub fn new(schema: Arc<Schema>, delimiter: u8) -> Self {
        let width = schema.len();
        Self {
            schema,
            positions: (0..width).collect(),
            source_width: width,
            delimiter,
        }
    }

    /// Codec for a source with the given header line.
    ///
    /// Fails with [`EngineError::SchemaMismatch`] if a schema field is missing from the header or
    /// the header repeats a column name.
    pub fn bind_header(schema: Arc<Schema>, header: &str, delimiter: u8) -> EngineResult<Self> {
        let names = header_names(header, delimiter)?;
        let mut positions = Vec::with_capacity(schema.len());
        for field in &schema.fields {
            match names.iter().position(|h| h == &field.name) {
                Some(idx) => positions.push(idx),
                None => {
                    return Err(EngineError::SchemaMismatch {
                        message: format!(
                            "missing required column '{}'. headers={:?}",
                            field.name, names
                        ),
                    });
                }
            }
        }
        Ok(Self {
            schema,
            positions,
            source_width: names.len(),
            delimiter,
        })
    }

    /// The schema rows are produced in.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Parse one raw line into a typed row.
    pub fn parse_line(&self, line: &str) -> Result<Row, RecordError> {
        let record = split_record(line, self.delimiter)?;
        if record.len() != self.source_width {
            return Err(RecordError::Arity {
                expected: self.source_width,
                found: record.len(),
            });
        }
        let mut values = Vec::with_capacity(self.schema.len());
        for (field, &pos) in self.schema.fields.iter().zip(&self.positions) {
            let raw = record.get(pos).unwrap_or("");
            values.push(parse_typed_value(field, raw)?);
        }
        Ok(Row::new(values))
    }

    /// Parse every line of a raw batch, keeping its read index.
    ///
    /// The first malformed line fails the whole batch with an error naming the batch, the source
    /// line and (for coercion failures) the column.
    pub fn parse_batch(&self, batch: &RawBatch) -> EngineResult<RowBatch> {
        let mut rows = Vec::with_capacity(batch.len());
        for line in &batch.lines {
            let row = self.parse_line(&line.text).map_err(|source| EngineError::Parse {
                batch_index: Some(batch.index),
                line: line.number,
                source,
            })?;
            rows.push(row);
        }
        Ok(RowBatch::new(batch.index, Arc::clone(&self.schema), rows))
    }

    /// Encode a row as one delimited line in the source's column layout.
    ///
    /// Inverse of [`Self::parse_line`]; header columns the schema does not use are left empty.
    pub fn encode_line(&self, row: &Row) -> EngineResult<String> {
        if row.len() != self.schema.len() {
            return Err(EngineError::serialization(format!(
                "row has {} values, schema has {} fields",
                row.len(),
                self.schema.len()
            )));
        }
        let mut cells = vec![String::new(); self.source_width];
        for (value, &pos) in row.values().iter().zip(&self.positions) {
            cells[pos] = value.to_string();
        }

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        wtr.write_record(&cells).map_err(EngineError::serialization)?;
        let bytes = wtr.into_inner().map_err(EngineError::serialization)?;
        let mut line = String::from_utf8(bytes).map_err(EngineError::serialization)?;
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    /// Serialize a row as a JSON object keyed by column name.
    pub fn to_json(&self, row: &Row) -> EngineResult<serde_json::Value> {
        row_to_json(&self.schema, row)
    }

    /// Rebuild a typed row from a JSON object produced by [`Self::to_json`].
    pub fn from_json(&self, value: &serde_json::Value) -> Result<Row, RecordError> {
        let obj = value.as_object().ok_or_else(|| RecordError::Malformed {
            message: format!("expected JSON object, got {value}"),
        })?;
        let mut values = Vec::with_capacity(self.schema.len());
        for field in &self.schema.fields {
            let v = obj.get(&field.name).ok_or_else(|| RecordError::Field {
                column: field.name.clone(),
                raw: String::new(),
                message: "missing field".to_string(),
            })?;
            values.push(json_to_value(field, v)?);
        }
        Ok(Row::new(values))
    }
}

/// Serialize a row as a JSON object keyed by `schema`'s column names.
pub fn row_to_json(schema: &Schema, row: &Row) -> EngineResult<serde_json::Value> {
    let mut obj = serde_json::Map::with_capacity(schema.len());
    for (field, value) in schema.fields.iter().zip(row.values()) {
        obj.insert(field.name.clone(), value_to_json(value)?);
    }
    Ok(serde_json::Value::Object(obj))
}

/// Serialize a single value. Non-finite floats cannot be represented and fail.
pub fn value_to_json(value: &Value) -> EngineResult<serde_json::Value> {
    match value {
        Value::Int64(v) => Ok(serde_json::Value::from(*v)),
        Value::Float64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .ok_or_else(|| EngineError::serialization(format!("non-finite float {v} has no JSON form"))),
        Value::Utf8(s) => Ok(serde_json::Value::String(s.clone())),
    }
}

fn json_to_value(field: &Field, v: &serde_json::Value) -> Result<Value, RecordError> {
    let err = |message: &str| RecordError::Field {
        column: field.name.clone(),
        raw: v.to_string(),
        message: message.to_string(),
    };
    match field.data_type {
        DataType::Int64 => v.as_i64().map(Value::Int64).ok_or_else(|| err("expected integer")),
        DataType::Float64 => v.as_f64().map(Value::Float64).ok_or_else(|| err("expected number")),
        DataType::Utf8 => v
            .as_str()
            .map(|s| Value::Utf8(s.to_owned()))
            .ok_or_else(|| err("expected string")),
    }
}

/// Split one line into fields, honouring CSV quoting.
pub fn split_record(line: &str, delimiter: u8) -> Result<csv::StringRecord, RecordError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    match rdr.read_record(&mut record) {
        Ok(_) => Ok(record),
        Err(e) => Err(RecordError::Malformed {
            message: e.to_string(),
        }),
    }
}

fn header_names(header: &str, delimiter: u8) -> EngineResult<Vec<String>> {
    let record = split_record(header, delimiter).map_err(|e| EngineError::SchemaMismatch {
        message: format!("unreadable header: {e}"),
    })?;
    let names: Vec<String> = record.iter().map(|h| h.trim().to_string()).collect();
    let mut seen = HashSet::new();
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(EngineError::SchemaMismatch {
                message: format!("duplicate column '{name}' in header"),
            });
        }
    }
    Ok(names)
}

fn parse_typed_value(field: &Field, raw: &str) -> Result<Value, RecordError> {
    let err = |message: String| RecordError::Field {
        column: field.name.clone(),
        raw: raw.to_owned(),
        message,
    };
    match field.data_type {
        DataType::Utf8 => Ok(Value::Utf8(raw.to_owned())),
        DataType::Int64 => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(err("empty value for int column".to_string()));
            }
            trimmed.parse::<i64>().map(Value::Int64).map_err(|e| err(e.to_string()))
        }
        DataType::Float64 => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(err("empty value for float column".to_string()));
            }
            trimmed.parse::<f64>().map(Value::Float64).map_err(|e| err(e.to_string()))
        }
    }
}

/// Infer a schema from a header line and sample data lines.
///
/// Column names come from the header. Each column gets the narrowest of int → float → string
/// that every non-empty sampled value parses as; columns without samples are strings.
pub fn infer_schema_from_lines<'a>(
    header: &str,
    lines: impl IntoIterator<Item = &'a str>,
    delimiter: u8,
) -> EngineResult<Schema> {
    let names = header_names(header, delimiter)?;
    let mut types: Vec<Option<DataType>> = vec![None; names.len()];

    for line in lines {
        let record = split_record(line, delimiter).map_err(|e| EngineError::SchemaMismatch {
            message: format!("cannot infer schema: {e}"),
        })?;
        for (slot, raw) in types.iter_mut().zip(record.iter()) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            *slot = Some(widen(*slot, raw));
        }
    }

    Ok(Schema::new(
        names
            .into_iter()
            .zip(types)
            .map(|(name, ty)| Field::new(name, ty.unwrap_or(DataType::Utf8)))
            .collect(),
    ))
}

fn widen(current: Option<DataType>, raw: &str) -> DataType {
    let fits_int = raw.parse::<i64>().is_ok();
    let fits_float = fits_int || raw.parse::<f64>().is_ok();
    match current {
        Some(DataType::Utf8) => DataType::Utf8,
        Some(DataType::Float64) if fits_float => DataType::Float64,
        None | Some(DataType::Int64) if fits_int => DataType::Int64,
        None | Some(DataType::Int64) if fits_float => DataType::Float64,
        _ => DataType::Utf8,
    }
}

/// Infer a schema by sampling the first `sample_rows` data lines of `source`.
pub fn infer_schema(source: &CsvSource, delimiter: u8, sample_rows: usize) -> EngineResult<Schema> {
    let mut reader = source.line_batches(sample_rows.max(1))?;
    let header = match reader.header() {
        Some(h) => h.to_string(),
        None => {
            return Err(EngineError::SchemaMismatch {
                message: format!("cannot infer schema: {} has no header", source.path().display()),
            });
        }
    };
    let sample = reader.next_batch()?;
    let lines = sample.iter().flat_map(|b| b.texts());
    infer_schema_from_lines(&header, lines, delimiter)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{RecordCodec, infer_schema_from_lines};
    use crate::error::{EngineError, RecordError};
    use crate::ingestion::reader::{RawBatch, SourceLine};
    use crate::types::{DataType, Field, Row, Schema, Value};

    fn codec() -> RecordCodec {
        RecordCodec::new(Arc::new(Schema::employees()), b',')
    }

    fn employee(name: &str, age: i64, salary: i64, dept: &str) -> Row {
        Row::new(vec![
            Value::from(name),
            Value::Int64(age),
            Value::Int64(salary),
            Value::from(dept),
        ])
    }

    #[test]
    fn parses_typed_row() {
        let row = codec().parse_line("Alice,25,50000,Engineering").unwrap();
        assert_eq!(row, employee("Alice", 25, 50_000, "Engineering"));
    }

    #[test]
    fn too_few_fields_is_an_error_not_a_sentinel() {
        let err = codec().parse_line("Alice,25,50000").unwrap_err();
        assert_eq!(err, RecordError::Arity { expected: 4, found: 3 });
        let err = codec().parse_line("Alice,25,50000,Eng,extra").unwrap_err();
        assert_eq!(err, RecordError::Arity { expected: 4, found: 5 });
    }

    #[test]
    fn coercion_failure_names_the_column() {
        let err = codec().parse_line("Alice,twenty,50000,Engineering").unwrap_err();
        assert_eq!(err.column(), Some("age"));
        let err = codec().parse_line("Alice,25,,Engineering").unwrap_err();
        assert_eq!(err.column(), Some("salary"));
    }

    #[test]
    fn numeric_fields_are_trimmed_strings_are_not() {
        let row = codec().parse_line(" Al , 25 ,50000, Ops").unwrap();
        assert_eq!(row, employee(" Al ", 25, 50_000, " Ops"));
    }

    #[test]
    fn line_round_trip_including_quoting() {
        let c = codec();
        let rows = vec![
            employee("Alice", 25, 50_000, "Engineering"),
            employee("Smith, John", -3, i64::MAX, "R&D \"core\""),
            employee("", 0, 0, ""),
        ];
        for row in rows {
            let line = c.encode_line(&row).unwrap();
            assert_eq!(c.parse_line(&line).unwrap(), row, "line={line}");
        }
    }

    #[test]
    fn json_round_trip_with_floats() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("city", DataType::Utf8),
            Field::new("temp", DataType::Float64),
            Field::new("n", DataType::Int64),
        ]));
        let c = RecordCodec::new(schema, b',');
        let row = Row::new(vec![Value::from("Oslo"), Value::Float64(-3.25), Value::Int64(7)]);
        let json = c.to_json(&row).unwrap();
        assert_eq!(json["temp"], serde_json::json!(-3.25));
        assert_eq!(c.from_json(&json).unwrap(), row);

        let nan = Row::new(vec![Value::from("x"), Value::Float64(f64::NAN), Value::Int64(1)]);
        assert!(matches!(c.to_json(&nan), Err(EngineError::Serialization { .. })));
    }

    #[test]
    fn bind_header_allows_reordered_columns() {
        let c = RecordCodec::bind_header(
            Arc::new(Schema::employees()),
            "department,salary,name,age,badge",
            b',',
        )
        .unwrap();
        let row = c.parse_line("Sales,60000,Bob,30,B-17").unwrap();
        assert_eq!(row, employee("Bob", 30, 60_000, "Sales"));
        let line = c.encode_line(&row).unwrap();
        assert_eq!(line, "Sales,60000,Bob,30,");
        assert_eq!(c.parse_line(&line).unwrap(), row);
    }

    #[test]
    fn bind_header_reports_missing_column() {
        let err = RecordCodec::bind_header(Arc::new(Schema::employees()), "name,age,salary", b',')
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("schema mismatch"));
        assert!(msg.contains("missing required column 'department'"));
    }

    #[test]
    fn parse_batch_carries_batch_and_line() {
        let batch = RawBatch {
            index: 3,
            lines: vec![
                SourceLine {
                    number: 10,
                    text: "Alice,25,50000,Engineering".to_string(),
                },
                SourceLine {
                    number: 11,
                    text: "Bob,x,60000,Sales".to_string(),
                },
            ],
            byte_len: 0,
            bytes_consumed: 0,
            rows_consumed: 0,
        };
        let err = codec().parse_batch(&batch).unwrap_err();
        assert_eq!(err.batch_index(), Some(3));
        assert_eq!(err.column(), Some("age"));
        assert!(err.to_string().contains("line 11"));
    }

    #[test]
    fn infers_narrowest_types() {
        let schema = infer_schema_from_lines(
            "name,age,score,code",
            ["Ada,36,9.5,A1", "Bob,41,7,22"],
            b',',
        )
        .unwrap();
        let types: Vec<_> = schema.fields.iter().map(|f| f.data_type).collect();
        assert_eq!(
            types,
            vec![DataType::Utf8, DataType::Int64, DataType::Float64, DataType::Utf8]
        );

        let empty = infer_schema_from_lines("a,b", std::iter::empty(), b',').unwrap();
        assert!(empty.fields.iter().all(|f| f.data_type == DataType::Utf8));
    }
}
