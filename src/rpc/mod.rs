//! HTTP API
//!
//! REST endpoints for farmers, timelords, wallets and peers doing IBD, plus
//! a JSON-RPC shim for Ethereum tooling.

mod eth;
mod handlers;
mod server;
pub mod types;

pub use eth::{dispatch, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use handlers::{estimate_fee_for, PendingTx};
pub use server::*;
