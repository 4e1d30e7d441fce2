//! Execution and checkpointing engine for extractor → transformer → loader pipelines.
//!
//! A [`controller::ConcurrencyController`] runs pipelines as isolated tasks. Each run may bulk
//! load tables first ([`fastsync`]), then starts the connector processes ([`process`]) and
//! routes their line delimited messages ([`protocol`], [`router`]), committing a checkpoint
//! ([`state`]) every time the loader acknowledges a state.

pub mod catalog;
pub mod concurrency;
pub mod connector;
pub mod controller;
pub mod error;
pub mod failpoints;
pub mod fastsync;
mod macros;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod router;
pub mod run;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;

pub use controller::{ConcurrencyController, ControllerSettings, RunOptions};
pub use run::{RunOutcome, RunPhase, RunResult};
