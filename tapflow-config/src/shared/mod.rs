mod base;
mod connection;
mod connector;
mod orchestrator;
mod pipeline;
mod retry;
mod state_store;
mod transform;

pub use base::*;
pub use connection::*;
pub use connector::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use retry::*;
pub use state_store::*;
pub use transform::*;
