//! Loader module for the bulk loader.
//!
//! Groups documents into bounded bulk batches and sends them to the engine
//! with bounded concurrency and retries.

pub mod accumulator;
pub mod dispatcher;
pub mod retry;

pub use accumulator::{BatchAccumulator, BatchLimits, BatchSequence, BulkBatch};
pub use dispatcher::{send_batch, BulkDispatcher, BulkOutcome, DispatchStats};
pub use retry::RetryPolicy;
