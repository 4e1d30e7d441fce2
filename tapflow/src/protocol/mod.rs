//! Line delimited message protocol spoken by extractors, transformers and loaders.

mod codec;
mod message;

pub use codec::{decode, encode};
pub use message::*;
