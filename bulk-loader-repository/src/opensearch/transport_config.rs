//! Connection settings for the OpenSearch transport.

use std::time::Duration;

use url::Url;

use crate::errors::SearchEngineError;

/// Username and password for HTTP basic authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Configuration for the OpenSearch transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Node endpoints; requests rotate across them.
    pub nodes: Vec<Url>,
    /// Basic auth credentials, if the cluster requires them.
    pub credentials: Option<BasicCredentials>,
    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Option<Duration>,
}

impl TransportConfig {
    /// Create a configuration for the given node endpoints.
    pub fn new(nodes: Vec<Url>) -> Self {
        Self {
            nodes,
            credentials: None,
            request_timeout: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(BasicCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build a node URL from host and port.
    ///
    /// # Example
    ///
    /// ```
    /// use bulk_loader_repository::TransportConfig;
    ///
    /// let url = TransportConfig::node_url("localhost", 9200, false).unwrap();
    /// assert_eq!(url.as_str(), "http://localhost:9200/");
    /// ```
    pub fn node_url(host: &str, port: u16, use_ssl: bool) -> Result<Url, SearchEngineError> {
        let scheme = if use_ssl { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}", scheme, host, port)).map_err(|e| {
            SearchEngineError::validation(format!("Invalid node address {}:{}: {}", host, port, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_url_ssl() {
        let url = TransportConfig::node_url("search.internal", 443, true).unwrap();
        assert_eq!(url.as_str(), "https://search.internal/");
    }

    #[test]
    fn test_node_url_invalid_host() {
        let result = TransportConfig::node_url("bad host", 9200, false);
        assert!(matches!(result, Err(SearchEngineError::ValidationError(_))));
    }

    #[test]
    fn test_builders() {
        let config = TransportConfig::new(vec![])
            .with_credentials("elastic", "secret")
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.credentials.unwrap().username, "elastic");
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
    }
}
