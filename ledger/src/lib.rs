// Copyright (c) 2026 Agora Core Developers. MIT License.
// See LICENSE for details.

//! # Agora Ledger — Storage Engine
//!
//! The persistent heart of an Agora node: blocks, transactions, outputs,
//! and the marketplace state the chain's script commands drive. Consensus
//! validates blocks; we make them durable, indexed, and — crucially —
//! reversible.
//!
//! Two value domains flow through every table: **cash** (AGC, what buyers
//! spend) and **tokens** (AGT, what stakers lock). Tokens staked into the
//! network earn a share of the 5% purchase fee, accounted in fixed
//! interval buckets so interest math never touches floating point.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! ledger store:
//!
//! - **config** — Chain parameters and protocol constants.
//! - **chain** — Block / transaction / output vocabulary. Dumb data.
//! - **market** — Accounts, offers, feedback, price pegs, and the typed
//!   commands that mutate them.
//! - **staking** — Interval-bucketed stake and fee accounting.
//! - **storage** — redb tables, transaction safety, and [`AgoraDB`],
//!   the facade everything else talks to.
//! - **error** — Three failure channels, kept deliberately apart.
//!
//! ## Design Philosophy
//!
//! 1. A block lands whole or not at all. One write transaction per add.
//! 2. `pop_block` is an exact inverse — byte-identical tables, always.
//! 3. Command rejection is data, not an exception. Mempools pre-check.
//! 4. If it touches balances, it has tests. Plural.

pub mod chain;
pub mod config;
pub mod error;
pub mod market;
pub mod staking;
pub mod storage;

pub use chain::{Block, BlockHeader, OutputTarget, OutputType, Transaction, TxInput, TxOutput};
pub use config::{ChainParams, NetworkType, COIN, TOKEN_UNIT};
pub use error::{CommandError, CommandParseError, ExecutionStatus, StoreError, StoreResult};
pub use market::{Command, CommandType, ExecutionResult};
pub use storage::AgoraDB;
