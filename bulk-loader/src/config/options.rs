//! Loader options.
//!
//! `LoaderConfig` is deserialized once from the host's configuration, checked
//! with [`LoaderConfig::validate`] at transaction start and shared read-only by
//! every processing unit afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ConfigError;
use crate::loader::{BatchLimits, RetryPolicy};
use crate::processor::is_valid_timestamp_format;

/// Default OpenSearch HTTP port.
const DEFAULT_PORT: u16 = 9200;

/// Default maximum serialized bytes per bulk request (5 MiB).
const DEFAULT_BULK_SIZE: usize = 5 * 1024 * 1024;

/// Default timestamp pattern, e.g. `2015-01-27T19:23:49.000+0000`.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// How the run writes into the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Write straight into the named index.
    #[default]
    #[serde(alias = "insert")]
    Insert,
    /// Load a fresh index generation and swap the alias onto it.
    #[serde(alias = "replace")]
    Replace,
}

/// Authentication against the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMethod {
    #[default]
    #[serde(alias = "none")]
    None,
    #[serde(alias = "basic")]
    Basic,
}

/// How new index generations are named in REPLACE mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GenerationSuffix {
    /// `{index}_%Y%m%d-%H%M%S`
    #[default]
    #[serde(alias = "timestamp")]
    Timestamp,
    /// `{index}_v{N}`, one past the highest generation the alias points at.
    #[serde(alias = "counter")]
    Counter,
}

/// A cluster node endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Options for one load run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Expected cluster name; a mismatch is logged.
    #[serde(default = "default_cluster")]
    pub cluster: String,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Target index in INSERT mode, generation base name in REPLACE mode.
    pub index: String,
    /// Legacy document type, sent as `_type` when set.
    #[serde(default)]
    pub index_type: Option<String>,
    /// Alias published in REPLACE mode. Defaults to `index`.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub doc_id_column: Option<String>,
    #[serde(default)]
    pub index_fields: Vec<String>,
    #[serde(default)]
    pub routing_column: Option<String>,
    /// Target object path -> source columns placed under it.
    #[serde(default)]
    pub nested_fields: BTreeMap<String, Vec<String>>,
    /// Max actions per bulk request, 0 for no count limit.
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: usize,
    /// Max serialized bytes per bulk request, 0 for no size limit.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// Max in-flight bulk requests per run, 0 for synchronous dispatch.
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(default = "default_maximum_retries")]
    pub maximum_retries: usize,
    #[serde(default = "default_initial_backoff_millis")]
    pub initial_backoff_millis: u64,
    #[serde(default = "default_max_backoff_millis")]
    pub max_backoff_millis: u64,
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,
    /// Abort the run once more item-level failures than this were seen.
    /// Unset means item failures never abort the run.
    #[serde(default)]
    pub max_failed_actions: Option<u64>,
    #[serde(default)]
    pub generation_suffix: GenerationSuffix,
    /// Settings/mappings body used when creating an index.
    #[serde(default)]
    pub index_settings: Option<Value>,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

fn default_cluster() -> String {
    "opensearch".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bulk_actions() -> usize {
    1000
}

fn default_bulk_size() -> usize {
    DEFAULT_BULK_SIZE
}

fn default_concurrent_requests() -> usize {
    5
}

fn default_maximum_retries() -> usize {
    7
}

fn default_initial_backoff_millis() -> u64 {
    1000
}

fn default_max_backoff_millis() -> u64 {
    120_000
}

fn default_request_timeout_millis() -> u64 {
    60_000
}

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

impl LoaderConfig {
    /// Create a config with default options for the given index and nodes.
    pub fn new(index: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            cluster: default_cluster(),
            nodes,
            use_ssl: false,
            auth_method: AuthMethod::None,
            user: None,
            password: None,
            index: index.into(),
            index_type: None,
            alias: None,
            mode: Mode::Insert,
            doc_id_column: None,
            index_fields: Vec::new(),
            routing_column: None,
            nested_fields: BTreeMap::new(),
            bulk_actions: default_bulk_actions(),
            bulk_size: default_bulk_size(),
            concurrent_requests: default_concurrent_requests(),
            maximum_retries: default_maximum_retries(),
            initial_backoff_millis: default_initial_backoff_millis(),
            max_backoff_millis: default_max_backoff_millis(),
            request_timeout_millis: default_request_timeout_millis(),
            max_failed_actions: None,
            generation_suffix: GenerationSuffix::Timestamp,
            index_settings: None,
            timestamp_format: default_timestamp_format(),
        }
    }

    /// Check the options that do not depend on the schema.
    ///
    /// Column references are checked when the transformer and identity
    /// resolver are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Missing("nodes"));
        }
        if self.nodes.iter().any(|node| node.host.trim().is_empty()) {
            return Err(ConfigError::invalid("nodes", "node host cannot be empty"));
        }
        if self.index.trim().is_empty() {
            return Err(ConfigError::Missing("index"));
        }
        if matches!(self.alias.as_deref(), Some(alias) if alias.trim().is_empty()) {
            return Err(ConfigError::invalid("alias", "alias cannot be empty"));
        }
        if self.auth_method == AuthMethod::Basic {
            if self.user.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("user"));
            }
            if self.password.is_none() {
                return Err(ConfigError::Missing("password"));
            }
        }
        if self.request_timeout_millis == 0 {
            return Err(ConfigError::invalid(
                "request_timeout_millis",
                "must be greater than zero",
            ));
        }
        if self.initial_backoff_millis > self.max_backoff_millis {
            return Err(ConfigError::invalid(
                "initial_backoff_millis",
                format!(
                    "{} exceeds max_backoff_millis {}",
                    self.initial_backoff_millis, self.max_backoff_millis
                ),
            ));
        }
        if !is_valid_timestamp_format(&self.timestamp_format) {
            return Err(ConfigError::invalid(
                "timestamp_format",
                format!("'{}' is not a valid strftime pattern", self.timestamp_format),
            ));
        }
        if let Some(settings) = &self.index_settings {
            if !settings.is_object() {
                return Err(ConfigError::invalid("index_settings", "must be a JSON object"));
            }
        }
        self.batch_limits()?;
        Ok(())
    }

    /// The alias published by the run, only set in REPLACE mode.
    pub fn alias_name(&self) -> Option<&str> {
        match self.mode {
            Mode::Insert => None,
            Mode::Replace => Some(self.alias.as_deref().unwrap_or(&self.index)),
        }
    }

    pub fn batch_limits(&self) -> Result<BatchLimits, ConfigError> {
        BatchLimits::new(self.bulk_actions, self.bulk_size)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.maximum_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_millis),
            max_backoff: Duration::from_millis(self.max_backoff_millis),
            request_timeout: Duration::from_millis(self.request_timeout_millis),
        }
    }

    /// Number of bulk requests allowed in flight at once across the run.
    pub fn dispatch_budget(&self) -> usize {
        self.concurrent_requests.max(1)
    }

    /// Whether each batch is awaited before the producer continues.
    pub fn synchronous_dispatch(&self) -> bool {
        self.concurrent_requests == 0
    }
}
