//! Error types for the bulk loader repository.
//!
//! This module provides a unified error type for all destination engine calls.

mod search_engine_error;

pub use search_engine_error::SearchEngineError;
