//! # Chain Parameters & Protocol Constants
//!
//! Every magic number in the ledger lives here. If you're hardcoding a
//! constant somewhere else, you're doing it wrong and you owe the team
//! coffee.
//!
//! Most values are plain constants; the handful that differ per network
//! (staking windows, mostly) live in [`ChainParams`] so that regtest can
//! run the full staking lifecycle in a test without mining half a million
//! blocks.

// ---------------------------------------------------------------------------
// Denominations
// ---------------------------------------------------------------------------

/// Atomic cash units per AGC. 8 decimals, same as Bitcoin. We're not
/// reinventing this wheel.
pub const COIN: u64 = 100_000_000;

/// Atomic token units per AGT. Tokens are divisible on the wire for
/// round-trip arithmetic, but staking only ever accepts whole-AGT
/// multiples — interest math is defined over whole tokens.
pub const TOKEN_UNIT: u64 = 100_000_000;

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Wire version of the command format embedded in script inputs.
/// A command with any other version is rejected at parse time.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version of the on-disk table schema, persisted in the `properties`
/// table. Opening a store written by a *newer* build fails hard — we
/// don't guess at table layouts we've never seen.
pub const DB_SCHEMA_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// Marketplace limits
// ---------------------------------------------------------------------------

/// Maximum account username length in bytes.
pub const MAX_ACCOUNT_USERNAME_LEN: usize = 32;

/// Maximum size of the opaque account data blob.
pub const MAX_ACCOUNT_DATA_SIZE: usize = 2048;

/// Tokens that must be locked to create an account. Spam protection:
/// usernames are a global namespace, and namespaces attract squatters.
pub const ACCOUNT_TOKEN_LOCK: u64 = 100 * TOKEN_UNIT;

/// Maximum offer title length in bytes.
pub const MAX_OFFER_TITLE_LEN: usize = 80;

/// Maximum offer description size in bytes.
pub const MAX_OFFER_DESCRIPTION_SIZE: usize = 2048;

/// Smallest price an offer may carry, in atomic cash units.
pub const OFFER_MIN_PRICE: u64 = 1;

/// Largest price an offer may carry. 10 million AGC buys a small country;
/// anything above this is a typo.
pub const OFFER_MAX_PRICE: u64 = 10_000_000 * COIN;

/// Maximum feedback comment size in bytes.
pub const MAX_FEEDBACK_COMMENT_SIZE: usize = 2048;

/// Ratings run 0..=3 (poor, fair, good, excellent).
pub const MAX_FEEDBACK_STARS: u8 = 3;

/// Maximum price peg data blob size in bytes.
pub const MAX_PRICE_PEG_DATA_SIZE: usize = 1024;

/// Maximum price peg currency ticker length ("USD", "EUR", ...).
pub const MAX_PRICE_PEG_CURRENCY_LEN: usize = 8;

/// Network fee taken from every purchase, in basis points. 500 bps = 5%.
/// This is the pool that staked tokens earn interest from.
pub const NETWORK_FEE_BPS: u64 = 500;

/// Divisor for basis-point math.
pub const BPS_DENOMINATOR: u64 = 10_000;

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// Which chain a store belongs to. Each network gets its own backing
/// store directory — mixing them corrupts nothing but confuses everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    /// The real deal. Mistakes here cost real money.
    Mainnet,
    /// Where we break things on purpose and call it "testing."
    Testnet,
    /// Local single-node chains with tiny staking windows.
    Regtest,
}

impl NetworkType {
    /// Subdirectory name for this network's backing store.
    pub fn subdir(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subdir())
    }
}

// ---------------------------------------------------------------------------
// ChainParams
// ---------------------------------------------------------------------------

/// Per-network staking parameters.
///
/// The staking subsystem buckets time into fixed windows of
/// `interval_length` blocks. A stake becomes interest-eligible at the
/// start of the interval after the one it was made in, may be unstaked
/// once `min_stake_period` blocks have elapsed, and appears in the
/// lock-expiry index at `stake_height + token_lock_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    /// Blocks per staking interval.
    pub interval_length: u64,
    /// Blocks a stake must remain locked before it can be unstaked.
    pub min_stake_period: u64,
    /// Blocks after which a stake shows up in the lock-expiry index.
    pub token_lock_period: u64,
}

impl ChainParams {
    /// Parameters for the given network.
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self {
                interval_length: 1000,
                min_stake_period: 500_000,
                token_lock_period: 500_000,
            },
            NetworkType::Testnet => Self {
                interval_length: 100,
                min_stake_period: 1000,
                token_lock_period: 1000,
            },
            NetworkType::Regtest => Self {
                interval_length: 10,
                min_stake_period: 30,
                token_lock_period: 60,
            },
        }
    }

    /// The staking interval containing `height`.
    pub fn interval_for(&self, height: u64) -> u64 {
        height / self.interval_length
    }
}
