//! Transport construction from loader options.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use bulk_loader_repository::{OpenSearchTransport, TransportConfig};
use bulk_loader_shared::Schema;
use serde::Deserialize;
use tracing::info;

use crate::config::options::{AuthMethod, LoaderConfig};
use crate::errors::{ConfigError, LoaderError};

/// Translate loader options into transport settings.
pub fn transport_config(config: &LoaderConfig) -> Result<TransportConfig, ConfigError> {
    let mut nodes = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let url = TransportConfig::node_url(&node.host, node.port, config.use_ssl)
            .map_err(|e| ConfigError::invalid("nodes", e.to_string()))?;
        nodes.push(url);
    }

    let mut transport = TransportConfig::new(nodes)
        .with_request_timeout(Duration::from_millis(config.request_timeout_millis));

    if config.auth_method == AuthMethod::Basic {
        let user = config.user.clone().ok_or(ConfigError::Missing("user"))?;
        let password = config.password.clone().ok_or(ConfigError::Missing("password"))?;
        transport = transport.with_credentials(user, password);
    }

    Ok(transport)
}

/// Create the OpenSearch transport shared by every unit of a run.
pub fn connect_transport(config: &LoaderConfig) -> Result<Arc<OpenSearchTransport>, LoaderError> {
    config.validate()?;
    let transport = OpenSearchTransport::new(transport_config(config)?)?;

    info!(
        cluster = %config.cluster,
        nodes = config.nodes.len(),
        auth_method = ?config.auth_method,
        "Transport ready"
    );

    Ok(Arc::new(transport))
}

/// A job file: loader options plus the record schema.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    #[serde(flatten)]
    pub loader: LoaderConfig,
    pub columns: Schema,
}

impl JobConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::invalid("LOADER_CONFIG", e.to_string()))
    }

    /// Read the job file named by `LOADER_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env::var("LOADER_CONFIG").map_err(|_| ConfigError::Missing("LOADER_CONFIG"))?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::invalid("LOADER_CONFIG", format!("{}: {}", path, e)))?;
        Self::from_json(&raw)
    }
}

/// Number of processing units, from `LOADER_UNITS` or the available cores.
pub fn units_from_env() -> Result<usize, ConfigError> {
    match env::var("LOADER_UNITS") {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(units) if units > 0 => Ok(units),
            _ => Err(ConfigError::invalid(
                "LOADER_UNITS",
                format!("'{}' is not a positive integer", raw),
            )),
        },
        Err(_) => Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::options::NodeConfig;

    #[test]
    fn test_transport_config_nodes_and_ssl() {
        let mut config = LoaderConfig::new(
            "embulk",
            vec![NodeConfig::new("es1", 9200), NodeConfig::new("es2", 9300)],
        );
        config.use_ssl = true;

        let transport = transport_config(&config).unwrap();
        let urls: Vec<&str> = transport.nodes.iter().map(|u| u.as_str()).collect();
        assert_eq!(urls, vec!["https://es1:9200/", "https://es2:9300/"]);
        assert!(transport.credentials.is_none());
        assert_eq!(transport.request_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_transport_config_basic_auth() {
        let mut config = LoaderConfig::new("embulk", vec![NodeConfig::new("es1", 9200)]);
        config.auth_method = AuthMethod::Basic;
        config.user = Some("elastic".to_string());
        config.password = Some("secret".to_string());

        let credentials = transport_config(&config).unwrap().credentials.unwrap();
        assert_eq!(credentials.username, "elastic");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn test_transport_config_invalid_host() {
        let config = LoaderConfig::new("embulk", vec![NodeConfig::new("bad host", 9200)]);
        assert!(matches!(
            transport_config(&config),
            Err(ConfigError::Invalid { option: "nodes", .. })
        ));
    }

    #[test]
    fn test_job_config_from_json() {
        let job = JobConfig::from_json(
            r#"{
                "nodes": [{"host": "localhost"}],
                "index": "embulk",
                "mode": "REPLACE",
                "columns": [
                    {"name": "id", "type": "long"},
                    {"name": "time", "type": "timestamp", "format": "%Y-%m-%d"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(job.loader.index, "embulk");
        assert_eq!(job.loader.nodes[0].port, 9200);
        assert_eq!(job.loader.alias_name(), Some("embulk"));
        assert_eq!(job.columns.len(), 2);
        assert_eq!(job.columns.columns()[1].format.as_deref(), Some("%Y-%m-%d"));
    }

    #[test]
    fn test_job_config_requires_columns() {
        let result = JobConfig::from_json(r#"{"nodes": [{"host": "localhost"}], "index": "embulk"}"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { option: "LOADER_CONFIG", .. })
        ));
    }
}
