//! Document id and routing resolution.

use bulk_loader_shared::{ColumnType, ColumnValue, DocumentIdentity, Record, Schema};
use tracing::{debug, warn};

use super::document_transformer::format_timestamp;
use crate::errors::ConfigError;

/// A schema column read as a string.
#[derive(Debug, Clone)]
struct KeyColumn {
    index: usize,
    timestamp_format: String,
}

impl KeyColumn {
    fn lookup(
        schema: &Schema,
        option: &'static str,
        name: &str,
        timestamp_format: &str,
    ) -> Result<Self, ConfigError> {
        let (index, column) = schema
            .lookup(name)
            .ok_or_else(|| ConfigError::unknown_column(option, name))?;
        let timestamp_format = match column.column_type {
            ColumnType::Timestamp => column
                .format
                .clone()
                .unwrap_or_else(|| timestamp_format.to_string()),
            _ => timestamp_format.to_string(),
        };
        Ok(Self {
            index,
            timestamp_format,
        })
    }

    fn read(&self, record: &Record) -> Option<String> {
        stringify(record.get(self.index), &self.timestamp_format)
    }
}

#[derive(Debug, Clone)]
enum IdSource {
    Column(KeyColumn),
    Composite(Vec<KeyColumn>),
    ServerAssigned,
}

/// Derives the optional id and routing key of each document.
///
/// Precedence: `doc_id_column`, then the concatenation of `index_fields`,
/// then no id at all so the engine assigns one.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    id: IdSource,
    routing: Option<KeyColumn>,
}

impl IdentityResolver {
    /// Resolve key columns against the schema.
    ///
    /// # Arguments
    ///
    /// * `schema` - Column declarations of the run
    /// * `doc_id_column` - Column holding the document id
    /// * `index_fields` - Columns concatenated into an id when no id column is set
    /// * `routing_column` - Column holding the routing key
    /// * `timestamp_format` - Rendering for timestamp key columns without their own format
    ///
    /// # Returns
    ///
    /// * `Err(ConfigError::UnknownColumn)` - If any named column is missing
    pub fn new(
        schema: &Schema,
        doc_id_column: Option<&str>,
        index_fields: &[String],
        routing_column: Option<&str>,
        timestamp_format: &str,
    ) -> Result<Self, ConfigError> {
        let id = match doc_id_column {
            Some(name) => {
                if !index_fields.is_empty() {
                    warn!(
                        doc_id_column = %name,
                        "index_fields ignored because doc_id_column is set"
                    );
                }
                IdSource::Column(KeyColumn::lookup(
                    schema,
                    "doc_id_column",
                    name,
                    timestamp_format,
                )?)
            }
            None if !index_fields.is_empty() => IdSource::Composite(
                index_fields
                    .iter()
                    .map(|name| KeyColumn::lookup(schema, "index_fields", name, timestamp_format))
                    .collect::<Result<_, _>>()?,
            ),
            None => IdSource::ServerAssigned,
        };

        let routing = routing_column
            .map(|name| KeyColumn::lookup(schema, "routing_column", name, timestamp_format))
            .transpose()?;

        Ok(Self { id, routing })
    }

    /// Whether the engine assigns ids for this run.
    pub fn server_assigned(&self) -> bool {
        matches!(self.id, IdSource::ServerAssigned)
    }

    /// Identity of one record, or `None` when neither an id nor a routing
    /// key applies.
    pub fn resolve(&self, record: &Record) -> Option<DocumentIdentity> {
        let id = match &self.id {
            IdSource::Column(column) => Some(column.read(record).unwrap_or_else(|| {
                debug!("Null document id column, using empty id");
                String::new()
            })),
            IdSource::Composite(columns) => Some(
                columns
                    .iter()
                    .map(|column| column.read(record).unwrap_or_default())
                    .collect(),
            ),
            IdSource::ServerAssigned => None,
        };
        let routing = self.routing.as_ref().and_then(|column| column.read(record));

        if id.is_none() && routing.is_none() {
            return None;
        }
        Some(DocumentIdentity { id, routing })
    }
}

/// String form of a value used as id or routing key. `Null` has none.
pub fn stringify(value: &ColumnValue, timestamp_format: &str) -> Option<String> {
    match value {
        ColumnValue::Null => None,
        ColumnValue::Boolean(b) => Some(b.to_string()),
        ColumnValue::Long(n) => Some(n.to_string()),
        ColumnValue::Double(f) => Some(f.to_string()),
        ColumnValue::String(s) => Some(s.clone()),
        ColumnValue::Timestamp(ts) => format_timestamp(ts, timestamp_format).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulk_loader_shared::Column;
    use chrono::{TimeZone, Utc};

    use crate::config::options::DEFAULT_TIMESTAMP_FORMAT;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Long),
            Column::new("account", ColumnType::Long),
            Column::new("comment", ColumnType::String),
            Column::new("time", ColumnType::Timestamp).with_format("%Y%m%d"),
        ])
    }

    fn record() -> Record {
        Record::new(vec![
            7i64.into(),
            32864i64.into(),
            "embulk".into(),
            Utc.with_ymd_and_hms(2015, 1, 27, 19, 23, 49).unwrap().into(),
        ])
    }

    fn resolver(
        doc_id_column: Option<&str>,
        index_fields: &[&str],
        routing_column: Option<&str>,
    ) -> Result<IdentityResolver, ConfigError> {
        let index_fields: Vec<String> = index_fields.iter().map(|s| s.to_string()).collect();
        IdentityResolver::new(
            &schema(),
            doc_id_column,
            &index_fields,
            routing_column,
            DEFAULT_TIMESTAMP_FORMAT,
        )
    }

    #[test]
    fn test_doc_id_column() {
        let resolver = resolver(Some("id"), &[], None).unwrap();
        assert_eq!(resolver.resolve(&record()), Some(DocumentIdentity::with_id("7")));
    }

    #[test]
    fn test_doc_id_column_takes_precedence() {
        let resolver = resolver(Some("comment"), &["account", "id"], None).unwrap();
        assert_eq!(
            resolver.resolve(&record()),
            Some(DocumentIdentity::with_id("embulk"))
        );
    }

    #[test]
    fn test_index_fields_concatenate_without_separator() {
        let resolver = resolver(None, &["account", "comment", "time"], None).unwrap();
        assert_eq!(
            resolver.resolve(&record()),
            Some(DocumentIdentity::with_id("32864embulk20150127"))
        );
    }

    #[test]
    fn test_index_fields_null_contributes_empty_string() {
        let resolver = resolver(None, &["account", "comment"], None).unwrap();
        let record = Record::new(vec![1i64.into(), ColumnValue::Null, "x".into()]);
        assert_eq!(resolver.resolve(&record), Some(DocumentIdentity::with_id("x")));
    }

    #[test]
    fn test_server_assigned() {
        let resolver = resolver(None, &[], None).unwrap();
        assert!(resolver.server_assigned());
        assert_eq!(resolver.resolve(&record()), None);
    }

    #[test]
    fn test_null_id_column_is_empty_id() {
        let resolver = resolver(Some("id"), &[], None).unwrap();
        let record = Record::new(vec![ColumnValue::Null]);
        assert_eq!(resolver.resolve(&record), Some(DocumentIdentity::with_id("")));
    }

    #[test]
    fn test_routing_column() {
        let resolver = resolver(None, &[], Some("account")).unwrap();
        assert_eq!(
            resolver.resolve(&record()),
            Some(DocumentIdentity {
                id: None,
                routing: Some("32864".to_string()),
            })
        );
    }

    #[test]
    fn test_unknown_columns() {
        assert_eq!(
            resolver(Some("missing"), &[], None).unwrap_err(),
            ConfigError::unknown_column("doc_id_column", "missing")
        );
        assert_eq!(
            resolver(None, &["id", "missing"], None).unwrap_err(),
            ConfigError::unknown_column("index_fields", "missing")
        );
        assert_eq!(
            resolver(None, &[], Some("missing")).unwrap_err(),
            ConfigError::unknown_column("routing_column", "missing")
        );
    }

    #[test]
    fn test_stringify() {
        assert_eq!(stringify(&ColumnValue::Null, DEFAULT_TIMESTAMP_FORMAT), None);
        assert_eq!(
            stringify(&ColumnValue::Boolean(true), DEFAULT_TIMESTAMP_FORMAT),
            Some("true".to_string())
        );
        assert_eq!(
            stringify(&ColumnValue::Double(1.5), DEFAULT_TIMESTAMP_FORMAT),
            Some("1.5".to_string())
        );
    }
}
