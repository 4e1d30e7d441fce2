//! Synchronization primitives shared by runs: keyed mutual exclusion, target locks and
//! cancellation signals.

pub mod keyed_lock;
pub mod shutdown;
pub mod target_lock;
