//! Cryptography module - SHA-256 hashing, addresses, secp256k1 keys

mod address;
mod ecdsa;
mod hash;

pub use address::*;
pub use ecdsa::*;
pub use hash::*;
