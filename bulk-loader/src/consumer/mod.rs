//! Consumer module for the bulk loader.
//!
//! Reads JSON-lines input and converts it into record batches for the units.

mod json_lines;

pub use json_lines::{read_units, JsonLinesDecoder};
