//! Interface definitions for the destination engine.
//!
//! This module defines the abstract `SearchTransport` trait so the loader can
//! be driven against OpenSearch in production and an in-memory engine in tests.

mod search_transport;

pub use search_transport::SearchTransport;
