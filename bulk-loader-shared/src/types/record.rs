//! Record types handed over by the host runtime.

use chrono::{DateTime, Utc};

/// A single typed cell value.
///
/// The variant does not have to match the declared column type; consumers
/// decide how to treat a mismatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Lowercase variant name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Boolean(_) => "boolean",
            ColumnValue::Long(_) => "long",
            ColumnValue::Double(_) => "double",
            ColumnValue::String(_) => "string",
            ColumnValue::Timestamp(_) => "timestamp",
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Boolean(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Long(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Double(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::String(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::String(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// One row of input, positionally aligned with the run's schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<ColumnValue>,
}

impl Record {
    pub fn new(values: Vec<ColumnValue>) -> Self {
        Self { values }
    }

    /// Value at a schema position. Positions past the end read as null.
    pub fn get(&self, index: usize) -> &ColumnValue {
        const NULL: &ColumnValue = &ColumnValue::Null;
        self.values.get(index).unwrap_or(NULL)
    }

    pub fn values(&self) -> &[ColumnValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A group of records delivered to a processing unit in one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<Record>> for RecordBatch {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}
