//! Routing of the message stream between the stages of a run.

mod stream;
pub mod tracker;
pub mod transform;

pub use stream::{RouteOutcome, RouterConfig, route};
pub use tracker::{RouteStats, StreamStats};
pub use transform::ColumnTransformer;
