//! Checkpoints and their persistence.

pub mod checkpoint;
pub mod store;

pub use checkpoint::Checkpoint;
