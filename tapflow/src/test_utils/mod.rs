//! Utilities for tests that drive real connector processes.
//!
//! [`connectors`] writes `/bin/sh` connectors into a temporary directory, [`pipeline`] builds
//! definitions, catalogs and controllers around them, [`notifying_store`] lets a test await
//! commits and [`notify`] keeps those waits from hanging forever.

pub mod connectors;
pub mod failpoints;
pub mod notify;
pub mod notifying_store;
pub mod pipeline;
