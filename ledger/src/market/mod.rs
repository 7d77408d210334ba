//! # Marketplace Layer
//!
//! Everything the script inputs talk about: accounts, offers, purchases,
//! feedback, price pegs, and the commands that create and mutate them.
//!
//! ```text
//! records.rs  — persisted entity records + output-id histories
//! command.rs  — the command wire codec and tagged-union Command type
//! execute.rs  — validate / execute / rollback against table state
//! ```
//!
//! Command processing is a three-state machine per command instance:
//! `Parsed → Validated → {Executed | Rejected}`. Rejection is data
//! ([`crate::error::ExecutionStatus`]), not an exception — callers
//! pre-check with [`execute::validate`] before paying for execution.

pub mod command;
pub mod execute;
pub mod records;

pub use command::{Command, CommandType, ExecutionResult};
pub use records::{
    AccountRecord, FeedbackEntry, FeedbackRecord, OfferRecord, PricePegRecord,
};
