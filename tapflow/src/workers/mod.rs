//! Worker implementations executing pipeline runs.

pub mod base;
pub mod policy;
pub mod run;

pub use run::{PipelineRunWorker, RunHandle, RunResources};
