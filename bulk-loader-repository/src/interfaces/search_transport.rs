//! Search transport trait definition.

use async_trait::async_trait;
use bulk_loader_shared::BulkAction;
use serde_json::Value;

use crate::errors::SearchEngineError;
use crate::types::{AliasAction, BulkResponse};

/// Request/response channel to the destination engine.
///
/// Implementations must tolerate concurrent use: one transport instance is
/// shared by every processing unit of a run.
///
/// All methods return `Result<T, SearchEngineError>`; callers use
/// [`SearchEngineError::is_retryable`] to decide whether to try again.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Name the engine reports for its cluster.
    async fn cluster_name(&self) -> Result<String, SearchEngineError>;

    /// Create an index, optionally with a settings/mappings body.
    ///
    /// Returns `SearchEngineError::IndexAlreadyExists` when the name is taken.
    async fn create_index(
        &self,
        name: &str,
        settings: Option<&Value>,
    ) -> Result<(), SearchEngineError>;

    /// Whether a concrete index or an alias resolves under `name`.
    async fn index_exists(&self, name: &str) -> Result<bool, SearchEngineError>;

    /// Whether `name` is an alias.
    async fn alias_exists(&self, name: &str) -> Result<bool, SearchEngineError>;

    /// The indices the alias currently points at, sorted. Empty if the alias
    /// does not exist.
    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchEngineError>;

    /// Send one bulk request of index actions against `index`.
    ///
    /// `Ok` means the engine accepted the request; individual actions may still
    /// have failed and are reported per item in the response.
    async fn bulk(
        &self,
        index: &str,
        doc_type: Option<&str>,
        actions: &[BulkAction],
    ) -> Result<BulkResponse, SearchEngineError>;

    /// Apply all alias actions in a single atomic request.
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchEngineError>;

    /// Delete an index. Deleting a missing index returns `NotFound`.
    async fn delete_index(&self, name: &str) -> Result<(), SearchEngineError>;
}
