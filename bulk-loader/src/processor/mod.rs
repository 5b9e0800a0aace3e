//! Record processing.
//!
//! Turns one tabular record into the JSON document and identity sent to the
//! engine. Both steps are pure functions of the record and the configuration.

pub mod document_transformer;
pub mod identity_resolver;

pub use document_transformer::{is_valid_timestamp_format, lookup_path, DocumentTransformer};
pub use identity_resolver::IdentityResolver;
