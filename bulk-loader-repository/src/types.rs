//! Request and response types for destination engine operations.

use serde_json::{json, Value};

/// Reason an individual bulk action was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Engine error type, e.g. `mapper_parsing_exception`.
    pub kind: String,
    /// Human readable reason.
    pub reason: String,
}

/// Outcome of a single action within a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemOutcome {
    /// Operation the item was sent as (`index`, `create`, ...).
    pub operation: String,
    /// Index the engine wrote to (or tried to).
    pub index: Option<String>,
    /// Document type, only reported by legacy clusters.
    pub doc_type: Option<String>,
    /// Document id, including engine-assigned ids.
    pub id: Option<String>,
    /// Per-item HTTP status.
    pub status: u16,
    /// Set when the item failed.
    pub failure: Option<ItemFailure>,
}

impl BulkItemOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && (200..300).contains(&self.status)
    }
}

/// Parsed acknowledgement of a bulk request.
///
/// Items are in the same order as the actions of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub took_millis: Option<u64>,
    pub items: Vec<BulkItemOutcome>,
}

impl BulkResponse {
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|item| !item.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|item| !item.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemOutcome> {
        self.items.iter().filter(|item| !item.is_success())
    }
}

/// One step of an alias update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

impl AliasAction {
    pub fn add(index: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Add {
            index: index.into(),
            alias: alias.into(),
        }
    }

    pub fn remove(index: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Remove {
            index: index.into(),
            alias: alias.into(),
        }
    }

    /// Entry for the `actions` array of an `_aliases` request.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Add { index, alias } => json!({ "add": { "index": index, "alias": alias } }),
            Self::Remove { index, alias } => {
                json!({ "remove": { "index": index, "alias": alias } })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_action_json() {
        assert_eq!(
            AliasAction::add("embulk_v2", "embulk_alias").to_json(),
            json!({ "add": { "index": "embulk_v2", "alias": "embulk_alias" } })
        );
        assert_eq!(
            AliasAction::remove("embulk_v1", "embulk_alias").to_json(),
            json!({ "remove": { "index": "embulk_v1", "alias": "embulk_alias" } })
        );
    }
}
