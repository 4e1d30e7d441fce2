//! Logging and metrics setup shared by the tapflow binaries and tests.

pub mod metrics;
pub mod tracing;
