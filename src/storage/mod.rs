//! Storage module - persisted blocks, accounts, metadata and peers

mod db;

pub use db::*;
