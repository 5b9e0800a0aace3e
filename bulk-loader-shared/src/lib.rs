//! # Bulk Loader Shared
//!
//! This crate defines the data structures shared across the bulk loader crates:
//! the tabular model handed over by the host runtime (schemas, records, record
//! batches) and the write-side values produced from it (document identities and
//! bulk actions).

pub mod types;

pub use types::action::{BulkAction, DocumentIdentity};
pub use types::record::{ColumnValue, Record, RecordBatch};
pub use types::schema::{Column, ColumnType, Schema};
