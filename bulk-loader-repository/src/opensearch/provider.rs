//! OpenSearch transport implementation.
//!
//! This module provides the concrete implementation of `SearchTransport`
//! using the OpenSearch Rust crate.

use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bulk_loader_shared::BulkAction;
use opensearch::{
    auth::Credentials,
    http::{
        request::JsonBody,
        response::Response,
        transport::{BuildError, SingleNodeConnectionPool, TransportBuilder},
    },
    indices::{
        IndicesCreateParts, IndicesDeleteParts, IndicesExistsAliasParts, IndicesExistsParts,
        IndicesGetAliasParts,
    },
    BulkParts, OpenSearch,
};
use serde_json::{json, Value};
use tracing::{debug, error, info};
use url::Url;

use crate::bulk;
use crate::errors::SearchEngineError;
use crate::interfaces::SearchTransport;
use crate::opensearch::transport_config::TransportConfig;
use crate::types::{AliasAction, BulkResponse};

/// OpenSearch transport.
///
/// Holds one client per configured node and rotates requests across them,
/// so a retried request lands on the next node. Clients are plain HTTP
/// clients; dropping the transport releases every connection.
///
/// # Example
///
/// ```ignore
/// use bulk_loader_repository::{OpenSearchTransport, TransportConfig};
///
/// let url = TransportConfig::node_url("localhost", 9200, false)?;
/// let transport = OpenSearchTransport::new(TransportConfig::new(vec![url]))?;
/// let exists = transport.index_exists("embulk").await?;
/// ```
pub struct OpenSearchTransport {
    clients: Vec<OpenSearch>,
    next: AtomicUsize,
}

impl OpenSearchTransport {
    /// Create a transport for the configured nodes.
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchTransport)` - A new transport instance
    /// * `Err(SearchEngineError)` - If no node is configured or client setup fails
    pub fn new(config: TransportConfig) -> Result<Self, SearchEngineError> {
        if config.nodes.is_empty() {
            return Err(SearchEngineError::validation(
                "At least one node must be configured",
            ));
        }

        let mut clients = Vec::with_capacity(config.nodes.len());
        for url in &config.nodes {
            let conn_pool = SingleNodeConnectionPool::new(url.clone());
            let mut builder = TransportBuilder::new(conn_pool).disable_proxy();
            if let Some(ref credentials) = config.credentials {
                builder = builder.auth(Credentials::Basic(
                    credentials.username.clone(),
                    credentials.password.clone(),
                ));
            }
            if let Some(timeout) = config.request_timeout {
                builder = builder.timeout(timeout);
            }
            let transport = builder
                .build()
                .map_err(|e| SearchEngineError::validation(e.to_string()))?;
            clients.push(OpenSearch::new(transport));
        }

        info!(
            nodes = ?config.nodes.iter().map(Url::as_str).collect::<Vec<_>>(),
            authenticated = config.credentials.is_some(),
            "Created OpenSearch transport"
        );

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the next client in round-robin order.
    fn client(&self) -> &OpenSearch {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[slot]
    }

    /// Turn a non-success response into a classified error.
    async fn error_from_response(response: Response) -> SearchEngineError {
        let status = response.status_code().as_u16();
        let body = response.text().await.unwrap_or_default();
        SearchEngineError::from_status(status, body)
    }

    async fn read_json(response: Response) -> Result<Value, SearchEngineError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| SearchEngineError::parse(e.to_string()))
    }
}

/// Classify an error raised while sending a request.
///
/// Only failures on the wire are retryable. A request that could not be
/// built or serialized fails the same way on every attempt.
fn send_error(e: opensearch::Error) -> SearchEngineError {
    if e.is_timeout() {
        return SearchEngineError::timeout(e.to_string());
    }
    if let Some(status) = e.status_code() {
        return SearchEngineError::from_status(status.as_u16(), e.to_string());
    }
    if e.is_json() {
        return SearchEngineError::serialization(e.to_string());
    }
    match e.source() {
        Some(source) if source.is::<BuildError>() => SearchEngineError::validation(e.to_string()),
        Some(_) => SearchEngineError::connection(e.to_string()),
        None => SearchEngineError::validation(e.to_string()),
    }
}

#[async_trait]
impl SearchTransport for OpenSearchTransport {
    async fn cluster_name(&self) -> Result<String, SearchEngineError> {
        let response = self
            .client()
            .info()
            .send()
            .await
            .map_err(send_error)?;

        if !response.status_code().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body = Self::read_json(response).await?;
        body["cluster_name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SearchEngineError::parse("Info response without cluster_name"))
    }

    async fn create_index(
        &self,
        name: &str,
        settings: Option<&Value>,
    ) -> Result<(), SearchEngineError> {
        let indices = self.client().indices();
        let request = indices.create(IndicesCreateParts::Index(name));
        let response = match settings {
            Some(body) => request.body(body.clone()).send().await,
            None => request.send().await,
        }
        .map_err(send_error)?;

        let status = response.status_code();
        if status.is_success() {
            info!(index = %name, "Index created");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 && body.contains("resource_already_exists_exception") {
            return Err(SearchEngineError::IndexAlreadyExists(name.to_string()));
        }

        error!(index = %name, status = %status, body = %body, "Create index request failed");
        Err(SearchEngineError::from_status(status.as_u16(), body))
    }

    async fn index_exists(&self, name: &str) -> Result<bool, SearchEngineError> {
        let response = self
            .client()
            .indices()
            .exists(IndicesExistsParts::Index(&[name]))
            .send()
            .await
            .map_err(send_error)?;

        match response.status_code().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::error_from_response(response).await),
        }
    }

    async fn alias_exists(&self, name: &str) -> Result<bool, SearchEngineError> {
        let response = self
            .client()
            .indices()
            .exists_alias(IndicesExistsAliasParts::Name(&[name]))
            .send()
            .await
            .map_err(send_error)?;

        match response.status_code().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::error_from_response(response).await),
        }
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchEngineError> {
        let response = self
            .client()
            .indices()
            .get_alias(IndicesGetAliasParts::Name(&[alias]))
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status_code();
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        // Response shape: { "<index>": { "aliases": { "<alias>": {} } }, ... }
        let body = Self::read_json(response).await?;
        let mut targets: Vec<String> = body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn bulk(
        &self,
        index: &str,
        doc_type: Option<&str>,
        actions: &[BulkAction],
    ) -> Result<BulkResponse, SearchEngineError> {
        let body: Vec<JsonBody<Value>> = bulk::action_lines(index, doc_type, actions)
            .into_iter()
            .map(JsonBody::new)
            .collect();

        let response = self
            .client()
            .bulk(BulkParts::Index(index))
            .body(body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status_code();
        if !status.is_success() {
            let err = Self::error_from_response(response).await;
            error!(index = %index, error = %err, "Bulk request failed");
            return Err(err);
        }

        let parsed = bulk::parse_response(Self::read_json(response).await?)?;
        debug!(
            index = %index,
            items = parsed.items.len(),
            took_millis = ?parsed.took_millis,
            "Bulk request acknowledged"
        );
        Ok(parsed)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchEngineError> {
        if actions.is_empty() {
            return Ok(());
        }

        let body = json!({
            "actions": actions.iter().map(AliasAction::to_json).collect::<Vec<_>>()
        });

        let response = self
            .client()
            .indices()
            .update_aliases()
            .body(body)
            .send()
            .await
            .map_err(send_error)?;

        if !response.status_code().is_success() {
            let err = Self::error_from_response(response).await;
            error!(error = %err, "Update aliases request failed");
            return Err(err);
        }

        debug!(actions = ?actions, "Aliases updated");
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), SearchEngineError> {
        let response = self
            .client()
            .indices()
            .delete(IndicesDeleteParts::Index(&[name]))
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status_code();
        if status.as_u16() == 404 {
            return Err(SearchEngineError::not_found(name));
        }
        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        info!(index = %name, "Index deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nodes: &[&str]) -> TransportConfig {
        TransportConfig::new(nodes.iter().map(|n| Url::parse(n).unwrap()).collect())
    }

    #[test]
    fn test_new_requires_nodes() {
        let result = OpenSearchTransport::new(config(&[]));
        assert!(matches!(result, Err(SearchEngineError::ValidationError(_))));
    }

    #[test]
    fn test_io_failure_is_retryable() {
        let e = opensearch::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        let err = send_error(e);
        assert!(matches!(err, SearchEngineError::ConnectionError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serialization_failure_is_not_retried() {
        let json_error = serde_json::from_str::<Value>("{").unwrap_err();
        let err = send_error(opensearch::Error::from(json_error));
        assert!(matches!(err, SearchEngineError::SerializationError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_building_failure_is_not_retried() {
        let url_error = Url::parse("not a url").unwrap_err();
        let err = send_error(opensearch::Error::from(url_error));
        assert!(matches!(err, SearchEngineError::ValidationError(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_round_robin_over_nodes() {
        let transport =
            OpenSearchTransport::new(config(&["http://node-a:9200", "http://node-b:9200"]))
                .unwrap();

        let first = transport.client() as *const OpenSearch;
        let second = transport.client() as *const OpenSearch;
        let third = transport.client() as *const OpenSearch;

        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
