//! # Storage Layer
//!
//! The persistent heart of the ledger, in three files:
//!
//! ```text
//! schema.rs  — table definitions, on-disk record types, codec helpers
//! engine.rs  — transaction safety: single writer, snapshot readers,
//!              the maintenance barrier
//! db.rs      — AgoraDB: the block-level facade consensus talks to
//! ```
//!
//! Everything below `db.rs` is mechanism; `AgoraDB` is the policy. A
//! block either lands in full — records, indexes, staking sums, command
//! effects — or not at all: every `add_block` runs inside one write
//! transaction, and any failure aborts the whole thing.

pub mod db;
pub mod engine;
pub mod schema;

pub use db::AgoraDB;
pub use schema::{AdvancedOutput, AmountOutput, BlockInfo, OutputLocation, OutputRef};
