//! # Bulk Loader
//!
//! Loads batches of typed tabular records into an OpenSearch cluster using
//! batched, concurrent bulk writes, optionally publishing the result through
//! an alias swap.
//!
//! ## Architecture
//!
//! Each processing unit runs the same pipeline:
//!
//! 1. **Processor**: Projects a record onto a JSON document and resolves its id
//! 2. **Loader**: Accumulates documents into bulk batches and dispatches them
//!    with bounded concurrency and retries
//! 3. **Orchestrator**: Prepares the index generation, runs the units and
//!    swaps the alias on commit
//!
//! ## Modules
//!
//! - [`config`]: Options, validation and transport construction
//! - [`consumer`]: JSON-lines input for the binary
//! - [`processor`]: Document transformer and identity resolver
//! - [`loader`]: Batch accumulator and bulk dispatcher
//! - [`orchestrator`]: Transaction, unit writers and index lifecycle
//! - [`errors`]: Error types for the loader

pub mod config;
pub mod consumer;
pub mod errors;
pub mod loader;
pub mod orchestrator;
pub mod processor;

pub use config::{LoaderConfig, Mode};
pub use errors::{ConfigError, LoaderError};
pub use orchestrator::{BulkLoader, CommitState, LifecycleState, RunReport, UnitWriter};

use thiserror::Error;

/// Errors that can occur while starting or running the loader binary.
#[derive(Error, Debug)]
pub enum LoadingError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Load error.
    #[error("Load error: {0}")]
    LoaderError(#[from] LoaderError),
}

impl LoadingError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

impl From<ConfigError> for LoadingError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}
