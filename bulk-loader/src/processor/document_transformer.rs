//! Record to JSON document projection.
//!
//! Column names are split on `.` and nested, so a column `autocomplete.input`
//! becomes `{"autocomplete": {"input": ...}}`. Columns listed under a
//! `nested_fields` target are placed inside that target object instead, with
//! the target prefix stripped from their name if present.
//!
//! Output paths are computed once from the schema. Overlapping paths are a
//! configuration error, so projection itself never has to resolve conflicts.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use bulk_loader_shared::{ColumnType, ColumnValue, Record, Schema};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::debug;

use crate::errors::ConfigError;

#[derive(Debug, Error)]
enum EncodeError {
    #[error("expected {expected} value, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0} is not representable in JSON")]
    NonFinite(f64),

    #[error("timestamp does not render with format '{0}'")]
    TimestampFormat(String),
}

/// Where and how one column lands in the document.
#[derive(Debug, Clone)]
struct FieldProjection {
    column: usize,
    name: String,
    column_type: ColumnType,
    path: Vec<String>,
    timestamp_format: String,
}

impl FieldProjection {
    fn encode(&self, value: &ColumnValue) -> Result<Value, EncodeError> {
        match (self.column_type, value) {
            (_, ColumnValue::Null) => Ok(Value::Null),
            (ColumnType::Boolean, ColumnValue::Boolean(b)) => Ok(Value::Bool(*b)),
            (ColumnType::Long, ColumnValue::Long(n)) => Ok(Value::from(*n)),
            (ColumnType::Double, ColumnValue::Double(f)) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or(EncodeError::NonFinite(*f)),
            (ColumnType::String, ColumnValue::String(s)) => Ok(Value::String(s.clone())),
            (ColumnType::Timestamp, ColumnValue::Timestamp(ts)) => {
                format_timestamp(ts, &self.timestamp_format)
                    .map(Value::String)
                    .map_err(|_| EncodeError::TimestampFormat(self.timestamp_format.clone()))
            }
            (expected, found) => Err(EncodeError::TypeMismatch {
                expected: expected.name(),
                found: found.kind(),
            }),
        }
    }
}

/// Projects records onto JSON documents.
#[derive(Debug, Clone)]
pub struct DocumentTransformer {
    fields: Vec<FieldProjection>,
}

impl DocumentTransformer {
    /// Build the projection for a schema.
    ///
    /// # Arguments
    ///
    /// * `schema` - Column declarations of the run
    /// * `nested_fields` - Target object path -> columns placed under it
    /// * `timestamp_format` - strftime pattern for timestamp columns without their own
    ///
    /// # Returns
    ///
    /// * `Ok(DocumentTransformer)` - Ready to transform records
    /// * `Err(ConfigError)` - On unknown columns, duplicate nesting, empty path
    ///   segments, invalid timestamp formats or colliding output paths
    pub fn new(
        schema: &Schema,
        nested_fields: &BTreeMap<String, Vec<String>>,
        timestamp_format: &str,
    ) -> Result<Self, ConfigError> {
        let mut targets: HashMap<&str, &str> = HashMap::new();
        for (target, columns) in nested_fields {
            split_path(target, "nested_fields")?;
            for column in columns {
                if schema.lookup(column).is_none() {
                    return Err(ConfigError::unknown_column("nested_fields", column.clone()));
                }
                if let Some(previous) = targets.insert(column.as_str(), target.as_str()) {
                    return Err(ConfigError::invalid(
                        "nested_fields",
                        format!(
                            "column '{}' is listed under both '{}' and '{}'",
                            column, previous, target
                        ),
                    ));
                }
            }
        }

        let mut fields = Vec::with_capacity(schema.len());
        for (index, column) in schema.columns().iter().enumerate() {
            let path = match targets.get(column.name.as_str()) {
                Some(target) => {
                    let prefix = format!("{}.", target);
                    let leaf = column.name.strip_prefix(&prefix).unwrap_or(&column.name);
                    let mut path = split_path(target, "nested_fields")?;
                    path.extend(split_path(leaf, "columns")?);
                    path
                }
                None => split_path(&column.name, "columns")?,
            };

            let timestamp_format = column
                .format
                .clone()
                .unwrap_or_else(|| timestamp_format.to_string());
            if column.column_type == ColumnType::Timestamp
                && !is_valid_timestamp_format(&timestamp_format)
            {
                return Err(ConfigError::invalid(
                    "columns",
                    format!(
                        "column '{}' has invalid timestamp format '{}'",
                        column.name, timestamp_format
                    ),
                ));
            }

            fields.push(FieldProjection {
                column: index,
                name: column.name.clone(),
                column_type: column.column_type,
                path,
                timestamp_format,
            });
        }

        check_collisions(&fields)?;

        Ok(Self { fields })
    }

    /// Convert one record into a document.
    ///
    /// A value that cannot be encoded for its column becomes `null`; the rest
    /// of the document is unaffected.
    pub fn transform(&self, record: &Record) -> Map<String, Value> {
        let mut document = Map::new();
        for field in &self.fields {
            let value = match field.encode(record.get(field.column)) {
                Ok(value) => value,
                Err(e) => {
                    debug!(column = %field.name, error = %e, "Field not encodable, writing null");
                    Value::Null
                }
            };
            insert_path(&mut document, &field.path, value);
        }
        document
    }

    /// Dotted output path per schema column, in schema order.
    pub fn output_paths(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.path.join(".")).collect()
    }
}

/// Read a value back from a document by dotted path.
pub fn lookup_path<'a>(document: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Whether a strftime pattern only contains known specifiers.
pub fn is_valid_timestamp_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// Render a timestamp without panicking on unusual patterns.
pub(crate) fn format_timestamp(
    timestamp: &DateTime<Utc>,
    format: &str,
) -> Result<String, std::fmt::Error> {
    let mut rendered = String::new();
    write!(rendered, "{}", timestamp.format(format))?;
    Ok(rendered)
}

fn split_path(path: &str, option: &'static str) -> Result<Vec<String>, ConfigError> {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(ConfigError::invalid(
            option,
            format!("'{}' contains an empty path segment", path),
        ));
    }
    Ok(segments)
}

fn check_collisions(fields: &[FieldProjection]) -> Result<(), ConfigError> {
    let mut paths: Vec<&[String]> = fields.iter().map(|field| field.path.as_slice()).collect();
    paths.sort();
    // After sorting, any path that prefixes another is adjacent to a path it prefixes.
    for pair in paths.windows(2) {
        let (shorter, longer) = (pair[0], pair[1]);
        if longer.starts_with(shorter) {
            return Err(ConfigError::PathCollision(
                shorter.join("."),
                longer.join("."),
            ));
        }
    }
    Ok(())
}

fn insert_path(document: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };
    let mut node = document;
    for segment in parents {
        let child = node
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        let Value::Object(map) = child else {
            return;
        };
        node = map;
    }
    node.insert(leaf.clone(), value);
}
