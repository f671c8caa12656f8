//! Proof of space: plot files, quality, scanning

mod plot;
mod proof;
mod scanner;

pub use plot::*;
pub use proof::*;
pub use scanner::*;
