//! Accounts, transactions and the execution engine

mod executor;
mod state;
mod tx;
mod txv1;

pub use executor::*;
pub use state::*;
pub use tx::*;
pub use txv1::*;
