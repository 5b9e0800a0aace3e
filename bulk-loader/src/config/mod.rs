//! Configuration and dependency initialization.

pub mod dependencies;
pub mod options;

pub use dependencies::{connect_transport, units_from_env, JobConfig};
pub use options::{AuthMethod, GenerationSuffix, LoaderConfig, Mode, NodeConfig};
