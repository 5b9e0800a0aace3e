//! Bulk request encoding and response parsing.
//!
//! A bulk body is newline-delimited JSON: one metadata line followed by one
//! source line per action.

use std::collections::HashMap;

use bulk_loader_shared::BulkAction;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::errors::SearchEngineError;
use crate::types::{BulkItemOutcome, BulkResponse, ItemFailure};

/// Build the metadata line of an index action.
///
/// `_type` is only emitted when a document type is configured, since current
/// engines reject it.
pub fn action_metadata(index: &str, doc_type: Option<&str>, action: &BulkAction) -> Value {
    let mut meta = Map::new();
    meta.insert("_index".to_string(), json!(index));
    if let Some(doc_type) = doc_type {
        meta.insert("_type".to_string(), json!(doc_type));
    }
    if let Some(id) = action.id() {
        meta.insert("_id".to_string(), json!(id));
    }
    if let Some(routing) = action.routing() {
        meta.insert("routing".to_string(), json!(routing));
    }
    json!({ "index": meta })
}

/// Metadata and source lines for every action, in order.
pub fn action_lines(index: &str, doc_type: Option<&str>, actions: &[BulkAction]) -> Vec<Value> {
    let mut lines = Vec::with_capacity(actions.len() * 2);
    for action in actions {
        lines.push(action_metadata(index, doc_type, action));
        lines.push(Value::Object(action.source().clone()));
    }
    lines
}

/// Serialized size in bytes of one action, newlines included.
pub fn encoded_len(index: &str, doc_type: Option<&str>, action: &BulkAction) -> usize {
    let meta = serde_json::to_vec(&action_metadata(index, doc_type, action))
        .map(|bytes| bytes.len())
        .unwrap_or_default();
    let source = serde_json::to_vec(action.source())
        .map(|bytes| bytes.len())
        .unwrap_or_default();
    meta + source + 2
}

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    took: Option<u64>,
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkItem>>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    #[serde(rename = "_index")]
    index: Option<String>,
    #[serde(rename = "_type")]
    doc_type: Option<String>,
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<RawItemError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawItemError {
    Detailed {
        #[serde(rename = "type")]
        kind: Option<String>,
        reason: Option<String>,
    },
    Message(String),
}

impl From<RawItemError> for ItemFailure {
    fn from(raw: RawItemError) -> Self {
        match raw {
            RawItemError::Detailed { kind, reason } => ItemFailure {
                kind: kind.unwrap_or_else(|| "unknown".to_string()),
                reason: reason.unwrap_or_default(),
            },
            RawItemError::Message(reason) => ItemFailure {
                kind: "unknown".to_string(),
                reason,
            },
        }
    }
}

/// Parse the JSON acknowledgement of a bulk request.
pub fn parse_response(body: Value) -> Result<BulkResponse, SearchEngineError> {
    let raw: RawBulkResponse = serde_json::from_value(body)
        .map_err(|e| SearchEngineError::parse(format!("Invalid bulk response: {}", e)))?;

    let mut items = Vec::with_capacity(raw.items.len());
    for entry in raw.items {
        // Each item is a single-key object keyed by its operation.
        let (operation, item) = entry.into_iter().next().ok_or_else(|| {
            SearchEngineError::parse("Bulk response item without an operation")
        })?;
        let failure = item.error.map(ItemFailure::from).or_else(|| {
            (!(200..300).contains(&item.status)).then(|| ItemFailure {
                kind: "status".to_string(),
                reason: format!("status {}", item.status),
            })
        });
        items.push(BulkItemOutcome {
            operation,
            index: item.index,
            doc_type: item.doc_type,
            id: item.id,
            status: item.status,
            failure,
        });
    }

    Ok(BulkResponse {
        took_millis: raw.took,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulk_loader_shared::DocumentIdentity;

    fn action(id: Option<&str>, routing: Option<&str>) -> BulkAction {
        let mut source = Map::new();
        source.insert("comment".to_string(), json!("embulk"));
        let identity = DocumentIdentity {
            id: id.map(str::to_string),
            routing: routing.map(str::to_string),
        };
        BulkAction::new(source, Some(identity))
    }

    #[test]
    fn test_metadata_without_id() {
        let action = BulkAction::new(Map::new(), None);
        assert_eq!(
            action_metadata("embulk", None, &action),
            json!({ "index": { "_index": "embulk" } })
        );
    }

    #[test]
    fn test_metadata_with_identity_and_type() {
        assert_eq!(
            action_metadata("embulk", Some("embulk"), &action(Some("1"), Some("r1"))),
            json!({ "index": { "_index": "embulk", "_type": "embulk", "_id": "1", "routing": "r1" } })
        );
    }

    #[test]
    fn test_action_lines_pairs() {
        let actions = vec![action(Some("1"), None), action(Some("2"), None)];
        let lines = action_lines("embulk", None, &actions);

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2]["index"]["_id"], "2");
        assert_eq!(lines[3]["comment"], "embulk");
    }

    #[test]
    fn test_encoded_len_matches_ndjson() {
        let action = action(Some("1"), None);
        let expected = format!(
            "{}\n{}\n",
            serde_json::to_string(&action_metadata("embulk", None, &action)).unwrap(),
            serde_json::to_string(action.source()).unwrap()
        );
        assert_eq!(encoded_len("embulk", None, &action), expected.len());
    }

    #[test]
    fn test_parse_response_mixed() {
        let body = json!({
            "took": 30,
            "errors": true,
            "items": [
                { "index": { "_index": "embulk", "_id": "1", "status": 201, "result": "created" } },
                { "index": {
                    "_index": "embulk",
                    "_id": "2",
                    "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "failed to parse field [account]" }
                } }
            ]
        });

        let response = parse_response(body).unwrap();
        assert_eq!(response.took_millis, Some(30));
        assert_eq!(response.items.len(), 2);
        assert!(response.items[0].is_success());
        assert_eq!(response.failed_count(), 1);

        let failed = response.failures().next().unwrap();
        assert_eq!(failed.operation, "index");
        assert_eq!(failed.id.as_deref(), Some("2"));
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.kind, "mapper_parsing_exception");
        assert!(failure.reason.contains("account"));
    }

    #[test]
    fn test_parse_response_status_without_error_body() {
        let body = json!({
            "took": 1,
            "errors": true,
            "items": [ { "index": { "_index": "embulk", "status": 503 } } ]
        });

        let response = parse_response(body).unwrap();
        assert!(response.has_failures());
        assert_eq!(response.items[0].failure.as_ref().unwrap().kind, "status");
    }

    #[test]
    fn test_parse_response_string_error() {
        let body = json!({
            "items": [ { "index": { "_index": "embulk", "status": 400, "error": "legacy message" } } ]
        });

        let response = parse_response(body).unwrap();
        assert_eq!(
            response.items[0].failure.as_ref().unwrap().reason,
            "legacy message"
        );
    }

    #[test]
    fn test_parse_response_invalid() {
        let result = parse_response(json!({ "items": "nope" }));
        assert!(matches!(result, Err(SearchEngineError::ParseError(_))));
    }
}
