//! Consensus module - blocks, challenges, difficulty, validation, fork choice

mod block;
mod challenge;
mod difficulty;
mod reorg;
mod validation;

pub use block::*;
pub use challenge::*;
pub use difficulty::*;
pub use reorg::*;
pub use validation::*;

#[cfg(test)]
pub(crate) use block::tests::sample_block;
