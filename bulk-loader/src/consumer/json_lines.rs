//! JSON-lines record decoding.
//!
//! Each input line is one JSON object. A column is read from the key equal to
//! its name, or failing that from the nested path its dotted name describes,
//! so both `{"autocomplete.input": "x"}` and `{"autocomplete": {"input": "x"}}`
//! fill column `autocomplete.input`.

use bulk_loader_shared::{Column, ColumnType, ColumnValue, Record, RecordBatch, Schema};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::errors::LoaderError;
use crate::processor::lookup_path;

/// Decodes JSON objects into records of a fixed schema.
#[derive(Debug, Clone)]
pub struct JsonLinesDecoder {
    schema: Schema,
}

impl JsonLinesDecoder {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decode one line.
    ///
    /// # Returns
    ///
    /// * `Err(LoaderError::Input)` - If the line is not a JSON object
    pub fn decode_line(&self, line: &str) -> Result<Record, LoaderError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| LoaderError::input(format!("invalid JSON: {}", e)))?;
        match value {
            Value::Object(object) => Ok(self.decode_object(&object)),
            other => Err(LoaderError::input(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode one object. Missing keys become `Null`.
    pub fn decode_object(&self, object: &Map<String, Value>) -> Record {
        let values = self
            .schema
            .columns()
            .iter()
            .map(|column| {
                object
                    .get(&column.name)
                    .or_else(|| lookup_path(object, &column.name))
                    .map(|value| convert(column, value))
                    .unwrap_or(ColumnValue::Null)
            })
            .collect();
        Record::new(values)
    }
}

/// Convert a JSON value for a column.
///
/// A value of the wrong JSON type keeps its natural variant; the document
/// transformer turns the mismatch into `null`.
fn convert(column: &Column, value: &Value) -> ColumnValue {
    match (column.column_type, value) {
        (_, Value::Null) => ColumnValue::Null,
        (ColumnType::Double, Value::Number(n)) => {
            n.as_f64().map(ColumnValue::Double).unwrap_or(ColumnValue::Null)
        }
        (ColumnType::Timestamp, Value::String(s)) => parse_timestamp(s, column.format.as_deref())
            .map(ColumnValue::Timestamp)
            .unwrap_or_else(|| {
                debug!(column = %column.name, value = %s, "Unparseable timestamp");
                ColumnValue::String(s.clone())
            }),
        (ColumnType::Timestamp, Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(ColumnValue::Timestamp)
            .unwrap_or(ColumnValue::Null),
        (_, Value::Bool(b)) => ColumnValue::Boolean(*b),
        (_, Value::Number(n)) => match n.as_i64() {
            Some(i) => ColumnValue::Long(i),
            None => n.as_f64().map(ColumnValue::Double).unwrap_or(ColumnValue::Null),
        },
        (_, Value::String(s)) => ColumnValue::String(s.clone()),
        (_, other) => ColumnValue::String(other.to_string()),
    }
}

fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let format = format?;
    if let Ok(ts) = DateTime::parse_from_str(raw, format) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, format)
        .ok()
        .map(|naive| naive.and_utc())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read every line and deal the records out to `units` units.
///
/// Records are grouped into batches of `batch_records` and batches are
/// assigned round-robin. Blank lines are skipped.
pub async fn read_units<R>(
    reader: R,
    decoder: &JsonLinesDecoder,
    units: usize,
    batch_records: usize,
) -> Result<Vec<Vec<RecordBatch>>, LoaderError>
where
    R: AsyncBufRead + Unpin,
{
    let units = units.max(1);
    let batch_records = batch_records.max(1);
    let mut assigned: Vec<Vec<RecordBatch>> = vec![Vec::new(); units];
    let mut current = Vec::with_capacity(batch_records);
    let mut next_unit = 0;
    let mut line_number = 0u64;
    let mut total = 0u64;

    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| LoaderError::input(format!("failed to read input: {}", e)))?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record = decoder
            .decode_line(&line)
            .map_err(|e| LoaderError::input(format!("line {}: {}", line_number, e)))?;
        current.push(record);
        total += 1;

        if current.len() == batch_records {
            assigned[next_unit].push(RecordBatch::new(std::mem::take(&mut current)));
            next_unit = (next_unit + 1) % units;
        }
    }
    if !current.is_empty() {
        assigned[next_unit].push(RecordBatch::new(current));
    }

    info!(records = total, units = units, "Input read");
    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Long),
            Column::new("flg", ColumnType::Boolean),
            Column::new("score", ColumnType::Double),
            Column::new("comment", ColumnType::String),
            Column::new("time", ColumnType::Timestamp).with_format("%Y-%m-%d %H:%M:%S"),
            Column::new("autocomplete.input", ColumnType::String),
        ])
    }

    #[test]
    fn test_decode_line() {
        let decoder = JsonLinesDecoder::new(schema());
        let record = decoder
            .decode_line(
                r#"{"id": 1, "flg": true, "score": 123, "comment": "embulk",
                    "time": "2015-01-27 19:23:49", "autocomplete": {"input": "x"}}"#,
            )
            .unwrap();

        assert_eq!(
            record.values(),
            &[
                ColumnValue::Long(1),
                ColumnValue::Boolean(true),
                ColumnValue::Double(123.0),
                ColumnValue::String("embulk".to_string()),
                ColumnValue::Timestamp(Utc.with_ymd_and_hms(2015, 1, 27, 19, 23, 49).unwrap()),
                ColumnValue::String("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_dotted_key_and_missing_columns() {
        let decoder = JsonLinesDecoder::new(schema());
        let record = decoder
            .decode_line(r#"{"autocomplete.input": "y", "time": "2015-01-27T19:23:49Z"}"#)
            .unwrap();

        assert!(record.get(0).is_null());
        assert_eq!(record.get(5), &ColumnValue::String("y".to_string()));
        assert!(matches!(record.get(4), ColumnValue::Timestamp(_)));
    }

    #[test]
    fn test_mismatched_types_keep_their_value() {
        let decoder = JsonLinesDecoder::new(schema());
        let record = decoder
            .decode_line(r#"{"id": "one", "flg": 1, "time": "yesterday"}"#)
            .unwrap();

        assert_eq!(record.get(0), &ColumnValue::String("one".to_string()));
        assert_eq!(record.get(1), &ColumnValue::Long(1));
        assert_eq!(record.get(4), &ColumnValue::String("yesterday".to_string()));
    }

    #[test]
    fn test_epoch_timestamp() {
        let decoder = JsonLinesDecoder::new(schema());
        let record = decoder.decode_line(r#"{"time": 1422386629}"#).unwrap();
        assert_eq!(
            record.get(4),
            &ColumnValue::Timestamp(Utc.with_ymd_and_hms(2015, 1, 27, 19, 23, 49).unwrap())
        );
    }

    #[test]
    fn test_rejects_non_objects() {
        let decoder = JsonLinesDecoder::new(schema());
        assert!(matches!(decoder.decode_line("[1, 2]"), Err(LoaderError::Input(_))));
        assert!(matches!(decoder.decode_line("{"), Err(LoaderError::Input(_))));
    }

    #[tokio::test]
    async fn test_read_units_round_robin() {
        let input = (0..7)
            .map(|i| format!(r#"{{"id": {}}}"#, i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let decoder = JsonLinesDecoder::new(schema());

        let units = read_units(input.as_bytes(), &decoder, 2, 3).await.unwrap();

        assert_eq!(units.len(), 2);
        let sizes: Vec<Vec<usize>> = units
            .iter()
            .map(|batches| batches.iter().map(RecordBatch::len).collect())
            .collect();
        assert_eq!(sizes, vec![vec![3, 1], vec![3]]);
    }

    #[tokio::test]
    async fn test_read_units_reports_line() {
        let decoder = JsonLinesDecoder::new(schema());
        let err = read_units("{\"id\": 1}\nnope\n".as_bytes(), &decoder, 1, 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
