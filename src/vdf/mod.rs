//! Verifiable delay function and timelord

mod engine;
mod timelord;

pub use engine::*;
pub use timelord::*;
