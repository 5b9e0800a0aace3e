//! # Bulk Loader Repository
//!
//! This crate provides the transport boundary between the bulk loader and the
//! destination search engine. It includes the unified error type, the
//! `SearchTransport` trait, bulk request encoding and response parsing, and a
//! concrete implementation for OpenSearch.

pub mod bulk;
pub mod errors;
pub mod interfaces;
pub mod opensearch;
#[cfg(feature = "test-util")]
pub mod testing;
pub mod types;

pub use errors::SearchEngineError;
pub use interfaces::SearchTransport;
pub use opensearch::{OpenSearchTransport, TransportConfig};
pub use types::{AliasAction, BulkItemOutcome, BulkResponse, ItemFailure};
