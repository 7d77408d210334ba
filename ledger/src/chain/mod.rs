//! # Chain Vocabulary
//!
//! The block/transaction/output types the storage engine persists.
//!
//! These are deliberately dumb data: no consensus rules, no signature
//! checks, no proof-of-work. The consensus layer hands us blocks it has
//! already validated; our job is to store them, index them, and execute
//! the marketplace commands their script inputs carry.

pub mod block;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use transaction::{OutputTarget, OutputType, Transaction, TxInput, TxOutput};
