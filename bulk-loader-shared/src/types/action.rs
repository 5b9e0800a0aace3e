//! Write-side values produced from records.

use serde_json::{Map, Value};

/// Optional id and routing key attached to a document.
///
/// When `id` is `None` the destination engine assigns one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentIdentity {
    pub id: Option<String>,
    pub routing: Option<String>,
}

impl DocumentIdentity {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            routing: None,
        }
    }
}

/// One index action: a JSON document plus its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    source: Map<String, Value>,
    identity: Option<DocumentIdentity>,
}

impl BulkAction {
    pub fn new(source: Map<String, Value>, identity: Option<DocumentIdentity>) -> Self {
        Self { source, identity }
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn identity(&self) -> Option<&DocumentIdentity> {
        self.identity.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|identity| identity.id.as_deref())
    }

    pub fn routing(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .and_then(|identity| identity.routing.as_deref())
    }
}
