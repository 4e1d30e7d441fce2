//! Configuration types and loading for tapflow.
//!
//! [`shared`] holds the deserializable configuration consumed by the engine and the runner,
//! [`load`] reads it from layered files and environment variables.

pub mod environment;
pub mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
