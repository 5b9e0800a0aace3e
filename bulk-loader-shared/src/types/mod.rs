//! This module defines the core data structures used across the bulk loader.

pub mod action;
pub mod record;
pub mod schema;
