//! # Error Taxonomy
//!
//! Three channels, deliberately kept apart:
//!
//! 1. [`StoreError`] — engine-fatal and consistency faults. These abort
//!    the surrounding write transaction (and usually the whole block
//!    operation). Nothing here is recoverable by retrying the same call.
//! 2. [`ExecutionStatus`] — the closed enumeration of marketplace command
//!    rejections. These are *expected* outcomes: a caller pre-validates a
//!    command, gets a status back as data, and rejects the transaction
//!    without spending effort on execution.
//! 3. [`CommandParseError`] — malformed command bytes. A parse failure is
//!    never a crash; truncated payloads surface here.
//!
//! [`CommandError`] bridges the channels for `validate`/`execute`, whose
//! table reads can hit hard storage faults mid-check.

use thiserror::Error;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Engine-fatal and consistency errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be created or opened — bad path,
    /// somebody else already holds it, or the file is corrupt.
    #[error("failed to open ledger database: {0}")]
    Open(#[from] redb::DatabaseError),

    /// A transaction could not be started or torn down.
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// A named table could not be opened inside a transaction.
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    /// A low-level read/write against the backing store failed.
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    /// A write transaction failed to commit.
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Store maintenance (compaction) failed.
    #[error("compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),

    /// A persisted record failed to encode or decode. Indicates either a
    /// bug or on-disk corruption; never expected in normal operation.
    #[error("serialization error: {0}")]
    Codec(String),

    /// The transaction being added already exists in the chain.
    #[error("transaction {0} already exists")]
    TxExists(String),

    /// The block being added does not extend the current top block.
    #[error("block parent mismatch: expected {expected}, got {got}")]
    BlockParentMissing {
        /// Hash of the current top block, hex-encoded.
        expected: String,
        /// Parent hash the rejected block carried, hex-encoded.
        got: String,
    },

    /// Stored bookkeeping disagrees with the operation being applied —
    /// a sum would underflow, an index is missing its counterpart. Always
    /// a bug or corruption, never a user error.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A record assumed to exist was not found. A consistency fault, not
    /// a user error — lookups with a legitimate "absent" outcome return
    /// `Option` instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store was written by a newer build than this one.
    #[error("unsupported schema version {found}, this build supports up to {supported}")]
    SchemaVersion {
        /// Version found in the `properties` table.
        found: u64,
        /// Highest version this build understands.
        supported: u64,
    },

    /// An operation that requires an open write transaction was called
    /// without one (e.g. `batch_commit` before `batch_start`).
    #[error("no write transaction is active")]
    NoWriteTransaction,

    /// Batch transactions were requested but not enabled.
    #[error("batch transactions are not enabled")]
    BatchNotEnabled,

    /// `pop_block` on a chain with no blocks.
    #[error("cannot pop: the chain is empty")]
    EmptyChain,

    /// A script input carried a command this store rejected.
    #[error("command rejected: {0}")]
    Command(#[from] CommandError),
}

/// Shorthand for storage-layer results.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Helper for bincode failures — used wherever records cross the
    /// byte boundary.
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        StoreError::Codec(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// The closed enumeration of command rejection reasons.
///
/// Returned as *data* from validation so callers can pre-check a command
/// before spending effort on execution. Every variant maps to exactly one
/// rule in the validation tables; none of them indicate storage trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutionStatus {
    /// Create-account for a username that is already taken.
    #[error("account already exists")]
    AccountAlreadyExists,
    /// The referenced account does not exist.
    #[error("account does not exist")]
    AccountNonExistent,
    /// Username empty, too long, or containing characters outside
    /// `[a-z0-9_-]`.
    #[error("invalid account name")]
    InvalidAccountName,
    /// Account data blob exceeds the size limit.
    #[error("account data too big")]
    AccountDataTooBig,
    /// Creating an account requires locking tokens; the input locked none
    /// (or too few).
    #[error("account token lock not enough")]
    AccountTokenLockNotEnough,

    /// Offer price below the allowed minimum.
    #[error("offer price too small")]
    OfferPriceTooSmall,
    /// Offer price above the allowed maximum.
    #[error("offer price too big")]
    OfferPriceTooBig,
    /// An un-pegged offer must carry `price == min_price`.
    #[error("offer price mismatch")]
    OfferPriceMismatch,
    /// Offer title or description exceeds the size limits.
    #[error("offer data too big")]
    OfferDataTooBig,
    /// The price peg the offer references does not exist.
    #[error("offer price peg does not exist")]
    OfferPricePegNotExistent,
    /// The referenced offer does not exist.
    #[error("offer does not exist")]
    OfferNonExistent,
    /// Create-offer for an offer id that is already taken.
    #[error("offer already exists")]
    OfferAlreadyExists,

    /// Stake amount is not a whole-token multiple.
    #[error("staked amount is not a whole token amount")]
    StakeTokenNotWholeAmount,
    /// The input's token amount does not equal the command's declared
    /// amount.
    #[error("staked token amount does not match input")]
    StakeTokenAmountNotMatching,
    /// Unstaking before the minimum lock period has elapsed.
    #[error("minimum stake period has not elapsed")]
    UnstakeTokenMinimumPeriod,
    /// An unstake must reference exactly one staked output.
    #[error("unstake must reference exactly one output")]
    UnstakeTokenOffsetNotOne,
    /// Claimed interest exceeds what the network fee pool yields for the
    /// stake's intervals.
    #[error("claimed interest exceeds the collected network fee")]
    UnstakeTokenNetworkFeeNotMatching,
    /// The referenced staked output does not exist.
    #[error("staked output not found")]
    UnstakeTokenOutputNotFound,

    /// Donation of zero to the network fee pool.
    #[error("network fee donation is zero")]
    NetworkFeeDonationZero,

    /// Purchase against an offer whose seller closed it.
    #[error("offer is not active")]
    PurchaseOfferNotActive,
    /// Purchase quantity exceeds the offer's remaining stock.
    #[error("offer is out of stock")]
    PurchaseOutOfStock,
    /// Purchase of zero units.
    #[error("purchase quantity is zero")]
    PurchaseQuantityZero,
    /// Paid amount below `price * quantity`.
    #[error("not enough funds for purchase")]
    PurchaseNotEnoughFunds,

    /// Feedback rating above the maximum.
    #[error("invalid feedback rating")]
    FeedbackInvalidRating,
    /// Feedback comment exceeds the size limit.
    #[error("feedback data too big")]
    FeedbackDataTooBig,

    /// Create-price-peg for a peg id that is already taken.
    #[error("price peg already exists")]
    PricePegAlreadyExists,
    /// The referenced price peg does not exist.
    #[error("price peg does not exist")]
    PricePegNonExistent,
    /// Price peg fields exceed the size limits, or the rate is zero.
    #[error("invalid price peg data")]
    PricePegDataInvalid,

    /// The transaction carries a command but no advanced output of the
    /// matching type to anchor its effect to.
    #[error("transaction is missing the command's script output")]
    MissingScriptOutput,
}

// ---------------------------------------------------------------------------
// CommandParseError
// ---------------------------------------------------------------------------

/// Malformed command bytes in a script input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    /// The command header declares a protocol version this build does not
    /// speak.
    #[error("unsupported command protocol version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version from the wire header.
        found: u32,
        /// The version this build implements.
        expected: u32,
    },

    /// The command-type tag is not one we know.
    #[error("unknown command type tag {0}")]
    UnknownCommandType(u8),

    /// The blob is shorter than the fixed header.
    #[error("command blob truncated: {got} bytes, need at least {need}")]
    Truncated {
        /// Bytes present.
        got: usize,
        /// Bytes the header requires.
        need: usize,
    },

    /// The type-specific payload failed to decode.
    #[error("malformed command payload: {0}")]
    Payload(String),
}

// ---------------------------------------------------------------------------
// CommandError
// ---------------------------------------------------------------------------

/// Failure channel for `validate` and `execute`.
///
/// `Rejected` carries the specific [`ExecutionStatus`] as data — the
/// recoverable path. `Parse` and `Store` are the non-recoverable channels
/// (bad bytes, storage fault).
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command failed a validation rule.
    #[error("{0}")]
    Rejected(#[from] ExecutionStatus),

    /// The command bytes could not be parsed.
    #[error("{0}")]
    Parse(#[from] CommandParseError),

    /// Storage failed underneath the check.
    #[error("storage failure during command processing: {0}")]
    Storage(String),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        CommandError::Storage(err.to_string())
    }
}

impl CommandError {
    /// The rejection status, if this failure is a rejection.
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            CommandError::Rejected(status) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_status_is_data() {
        let err = CommandError::Rejected(ExecutionStatus::PurchaseOutOfStock);
        assert_eq!(err.status(), Some(ExecutionStatus::PurchaseOutOfStock));

        let err = CommandError::Parse(CommandParseError::UnknownCommandType(0xFF));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn store_error_messages_name_the_fault() {
        let err = StoreError::SchemaVersion {
            found: 9,
            supported: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn parse_error_display() {
        let err = CommandParseError::Truncated { got: 3, need: 5 };
        assert!(err.to_string().contains("truncated"));
    }
}
