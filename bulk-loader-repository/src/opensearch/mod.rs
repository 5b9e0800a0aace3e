//! OpenSearch implementation of the search transport.
//!
//! This module provides a concrete implementation of `SearchTransport`
//! using OpenSearch as the destination engine.

mod provider;
mod transport_config;

pub use provider::OpenSearchTransport;
pub use transport_config::{BasicCredentials, TransportConfig};
