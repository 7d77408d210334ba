//! # Table Schema
//!
//! Every table the engine owns, as typed redb [`TableDefinition`]s, plus
//! the record structs stored in them and the bincode codec helpers.
//!
//! Key ordering is redb's native ordering for the key type, so integer
//! and tuple keys iterate numerically — the amount-bucketed output tables
//! rely on this: the key `(amount, local_index)` groups a denomination's
//! outputs contiguously and in insertion order.
//!
//! ## Table map
//!
//! | table                    | key                     | value                |
//! |--------------------------|-------------------------|----------------------|
//! | `blocks`                 | height                  | bincode `Block`      |
//! | `block_heights`          | block hash              | height               |
//! | `block_info`             | height                  | bincode `BlockInfo`  |
//! | `txs`                    | tx hash                 | bincode `Transaction`|
//! | `tx_indices`             | tx hash                 | dense tx id          |
//! | `tx_outputs`             | dense tx id             | bincode `Vec<OutputRef>` |
//! | `output_amounts`         | (amount, local index)   | bincode `AmountOutput` |
//! | `output_token_amounts`   | (amount, local index)   | bincode `AmountOutput` |
//! | `output_txs`             | advanced id             | bincode `OutputLocation` |
//! | `output_advanced`        | advanced id             | bincode `AdvancedOutput` |
//! | `output_advanced_type`   | advanced id             | `OutputType` tag     |
//! | `spent_keys`             | key image               | ()                   |
//! | `token_locked_sum`       | interval                | atomic token units   |
//! | `token_locked_sum_total` | () singleton            | atomic token units   |
//! | `network_fee_sum`        | interval                | atomic cash units    |
//! | `token_lock_expiry`      | expiry height (multimap)| advanced id          |
//! | `market_accounts`        | username                | bincode `AccountRecord` |
//! | `market_offers`          | offer id                | bincode `OfferRecord` |
//! | `market_feedback`        | offer id                | bincode `FeedbackRecord` |
//! | `market_price_pegs`      | peg id                  | bincode `PricePegRecord` |
//! | `hf_versions`            | height                  | hard-fork version    |
//! | `properties`             | name                    | u64                  |

use redb::{
    MultimapTableDefinition, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

pub const BLOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("blocks");
pub const BLOCK_HEIGHTS: TableDefinition<&[u8], u64> = TableDefinition::new("block_heights");
pub const BLOCK_INFO: TableDefinition<u64, &[u8]> = TableDefinition::new("block_info");
pub const TXS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("txs");
pub const TX_INDICES: TableDefinition<&[u8], u64> = TableDefinition::new("tx_indices");
pub const TX_OUTPUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("tx_outputs");
pub const OUTPUT_AMOUNTS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("output_amounts");
pub const OUTPUT_TOKEN_AMOUNTS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("output_token_amounts");
pub const OUTPUT_TXS: TableDefinition<u64, &[u8]> = TableDefinition::new("output_txs");
pub const OUTPUT_ADVANCED: TableDefinition<u64, &[u8]> = TableDefinition::new("output_advanced");
pub const OUTPUT_ADVANCED_TYPE: TableDefinition<u64, u8> =
    TableDefinition::new("output_advanced_type");
pub const SPENT_KEYS: TableDefinition<&[u8], ()> = TableDefinition::new("spent_keys");
pub const TOKEN_LOCKED_SUM: TableDefinition<u64, u64> = TableDefinition::new("token_locked_sum");
pub const TOKEN_LOCKED_SUM_TOTAL: TableDefinition<(), u64> =
    TableDefinition::new("token_locked_sum_total");
pub const NETWORK_FEE_SUM: TableDefinition<u64, u64> = TableDefinition::new("network_fee_sum");
pub const TOKEN_LOCK_EXPIRY: MultimapTableDefinition<u64, u64> =
    MultimapTableDefinition::new("token_lock_expiry");
pub const MARKET_ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("market_accounts");
pub const MARKET_OFFERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("market_offers");
pub const MARKET_FEEDBACK: TableDefinition<&[u8], &[u8]> = TableDefinition::new("market_feedback");
pub const MARKET_PRICE_PEGS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("market_price_pegs");
pub const HF_VERSIONS: TableDefinition<u64, u8> = TableDefinition::new("hf_versions");
pub const PROPERTIES: TableDefinition<&str, u64> = TableDefinition::new("properties");

// Property names in the `properties` table.
pub const PROP_SCHEMA_VERSION: &str = "schema_version";
pub const PROP_NEXT_ADVANCED_ID: &str = "next_advanced_id";
pub const PROP_TX_COUNT: &str = "tx_count";

// ---------------------------------------------------------------------------
// Stored record types
// ---------------------------------------------------------------------------

/// Consensus-derived per-block metadata, stored separately so the block
/// record itself stays identical to what the network carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Copied from the header for height-keyed lookup.
    pub timestamp: u64,
    /// Serialized block size in bytes.
    pub size: u64,
    /// Cumulative chain difficulty up to and including this block.
    pub cumulative_difficulty: u64,
    /// Cumulative cash emitted up to and including this block.
    pub coins_generated: u64,
    /// Cumulative tokens migrated in up to and including this block.
    pub tokens_migrated: u64,
    /// The block's own hash, denormalized for height-keyed lookup.
    pub hash: [u8; 32],
}

/// One entry in a transaction's output index list, recorded at insert
/// time so `pop_block` can remove exactly what `add_block` created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputRef {
    /// Amount-bucketed cash output at `(amount, local_index)`.
    Cash { amount: u64, local_index: u64 },
    /// Amount-bucketed token output at `(amount, local_index)`.
    Token { amount: u64, local_index: u64 },
    /// Advanced output under its global id.
    Advanced { id: u64 },
}

/// An amount-bucketed output's payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountOutput {
    /// One-time destination key.
    pub pubkey: [u8; 32],
    /// Hash of the transaction that created this output.
    pub tx_hash: [u8; 32],
    /// Index of this output within that transaction.
    pub vout: u32,
}

/// Where an advanced output came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLocation {
    /// Hash of the creating transaction.
    pub tx_hash: [u8; 32],
    /// Index of the output within it.
    pub vout: u32,
}

/// An advanced output's payload. `height` and `token_amount` are
/// denormalized so unstake can price a stake without walking back to the
/// creating transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedOutput {
    /// One-time destination key.
    pub pubkey: [u8; 32],
    /// Token amount carried (0 for non-token outputs).
    pub token_amount: u64,
    /// Height of the block that created this output.
    pub height: u64,
    /// Type-specific payload, usually the producing command's wire bytes.
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Bincode-encode a record for storage.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(StoreError::codec)
}

/// Decode a stored record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(StoreError::codec)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Every write-table handle for one write transaction, opened eagerly.
///
/// redb write tables borrow the transaction, so handles cannot be opened
/// lazily behind `&mut self` accessors without fighting the borrow
/// checker every time two tables are touched together. Opening the whole
/// set up front costs a handful of B-tree root lookups per transaction
/// and makes every table a plain struct field.
pub struct Tables<'txn> {
    pub blocks: redb::Table<'txn, u64, &'static [u8]>,
    pub block_heights: redb::Table<'txn, &'static [u8], u64>,
    pub block_info: redb::Table<'txn, u64, &'static [u8]>,
    pub txs: redb::Table<'txn, &'static [u8], &'static [u8]>,
    pub tx_indices: redb::Table<'txn, &'static [u8], u64>,
    pub tx_outputs: redb::Table<'txn, u64, &'static [u8]>,
    pub output_amounts: redb::Table<'txn, (u64, u64), &'static [u8]>,
    pub output_token_amounts: redb::Table<'txn, (u64, u64), &'static [u8]>,
    pub output_txs: redb::Table<'txn, u64, &'static [u8]>,
    pub output_advanced: redb::Table<'txn, u64, &'static [u8]>,
    pub output_advanced_type: redb::Table<'txn, u64, u8>,
    pub spent_keys: redb::Table<'txn, &'static [u8], ()>,
    pub token_locked_sum: redb::Table<'txn, u64, u64>,
    pub token_locked_sum_total: redb::Table<'txn, (), u64>,
    pub network_fee_sum: redb::Table<'txn, u64, u64>,
    pub token_lock_expiry: redb::MultimapTable<'txn, u64, u64>,
    pub market_accounts: redb::Table<'txn, &'static str, &'static [u8]>,
    pub market_offers: redb::Table<'txn, &'static [u8], &'static [u8]>,
    pub market_feedback: redb::Table<'txn, &'static [u8], &'static [u8]>,
    pub market_price_pegs: redb::Table<'txn, &'static [u8], &'static [u8]>,
    pub hf_versions: redb::Table<'txn, u64, u8>,
    pub properties: redb::Table<'txn, &'static str, u64>,
}

impl<'txn> Tables<'txn> {
    /// Open every table in the given write transaction, creating any
    /// that do not exist yet.
    pub fn open(txn: &'txn WriteTransaction) -> StoreResult<Self> {
        Ok(Tables {
            blocks: txn.open_table(BLOCKS)?,
            block_heights: txn.open_table(BLOCK_HEIGHTS)?,
            block_info: txn.open_table(BLOCK_INFO)?,
            txs: txn.open_table(TXS)?,
            tx_indices: txn.open_table(TX_INDICES)?,
            tx_outputs: txn.open_table(TX_OUTPUTS)?,
            output_amounts: txn.open_table(OUTPUT_AMOUNTS)?,
            output_token_amounts: txn.open_table(OUTPUT_TOKEN_AMOUNTS)?,
            output_txs: txn.open_table(OUTPUT_TXS)?,
            output_advanced: txn.open_table(OUTPUT_ADVANCED)?,
            output_advanced_type: txn.open_table(OUTPUT_ADVANCED_TYPE)?,
            spent_keys: txn.open_table(SPENT_KEYS)?,
            token_locked_sum: txn.open_table(TOKEN_LOCKED_SUM)?,
            token_locked_sum_total: txn.open_table(TOKEN_LOCKED_SUM_TOTAL)?,
            network_fee_sum: txn.open_table(NETWORK_FEE_SUM)?,
            token_lock_expiry: txn.open_multimap_table(TOKEN_LOCK_EXPIRY)?,
            market_accounts: txn.open_table(MARKET_ACCOUNTS)?,
            market_offers: txn.open_table(MARKET_OFFERS)?,
            market_feedback: txn.open_table(MARKET_FEEDBACK)?,
            market_price_pegs: txn.open_table(MARKET_PRICE_PEGS)?,
            hf_versions: txn.open_table(HF_VERSIONS)?,
            properties: txn.open_table(PROPERTIES)?,
        })
    }

    /// Read a property, `None` when unset.
    pub fn property(&self, name: &str) -> StoreResult<Option<u64>> {
        Ok(self.properties.get(name)?.map(|v| v.value()))
    }

    /// Set a property.
    pub fn set_property(&mut self, name: &str, value: u64) -> StoreResult<()> {
        self.properties.insert(name, value)?;
        Ok(())
    }

    /// Allocate the next dense advanced output id.
    pub fn next_advanced_id(&mut self) -> StoreResult<u64> {
        let next = self.property(PROP_NEXT_ADVANCED_ID)?.unwrap_or(0);
        self.set_property(PROP_NEXT_ADVANCED_ID, next + 1)?;
        Ok(next)
    }

    /// Give back the most recently allocated advanced id (pop path).
    /// Ids are dense, so the popped block's outputs are always the tail.
    pub fn release_advanced_id(&mut self) -> StoreResult<()> {
        let next = self.property(PROP_NEXT_ADVANCED_ID)?.unwrap_or(0);
        if next == 0 {
            return Err(StoreError::NotFound("no advanced output ids to release".into()));
        }
        self.set_property(PROP_NEXT_ADVANCED_ID, next - 1)
    }

    /// The next free local index within an amount bucket: one past the
    /// highest existing index, found by a reverse scan of the bucket's
    /// key range.
    pub fn next_local_index(
        table: &redb::Table<'txn, (u64, u64), &'static [u8]>,
        amount: u64,
    ) -> StoreResult<u64> {
        let mut range = table.range((amount, 0)..=(amount, u64::MAX))?;
        Ok(match range.next_back() {
            Some(entry) => entry?.0.value().1 + 1,
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Block;
    use redb::{Database, ReadableTable};

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("schema_test.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn open_creates_all_tables() {
        let (_dir, db) = temp_db();
        let txn = db.begin_write().unwrap();
        {
            let tables = Tables::open(&txn).unwrap();
            drop(tables);
        }
        txn.commit().unwrap();

        // A fresh read transaction can open a created table.
        let rtxn = db.begin_read().unwrap();
        let blocks = rtxn.open_table(BLOCKS).unwrap();
        assert!(blocks.get(&0).unwrap().is_none());
    }

    #[test]
    fn properties_roundtrip() {
        let (_dir, db) = temp_db();
        let txn = db.begin_write().unwrap();
        {
            let mut tables = Tables::open(&txn).unwrap();
            assert_eq!(tables.property(PROP_SCHEMA_VERSION).unwrap(), None);
            tables.set_property(PROP_SCHEMA_VERSION, 1).unwrap();
            assert_eq!(tables.property(PROP_SCHEMA_VERSION).unwrap(), Some(1));
        }
        txn.commit().unwrap();
    }

    #[test]
    fn advanced_ids_are_dense() {
        let (_dir, db) = temp_db();
        let txn = db.begin_write().unwrap();
        {
            let mut tables = Tables::open(&txn).unwrap();
            assert_eq!(tables.next_advanced_id().unwrap(), 0);
            assert_eq!(tables.next_advanced_id().unwrap(), 1);
            tables.release_advanced_id().unwrap();
            assert_eq!(tables.next_advanced_id().unwrap(), 1);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn local_indices_count_per_bucket() {
        let (_dir, db) = temp_db();
        let txn = db.begin_write().unwrap();
        {
            let mut tables = Tables::open(&txn).unwrap();
            let payload = encode(&AmountOutput {
                pubkey: [0u8; 32],
                tx_hash: [0u8; 32],
                vout: 0,
            })
            .unwrap();
            assert_eq!(
                Tables::next_local_index(&tables.output_amounts, 100).unwrap(),
                0
            );
            tables
                .output_amounts
                .insert((100u64, 0u64), payload.as_slice())
                .unwrap();
            tables
                .output_amounts
                .insert((100u64, 1u64), payload.as_slice())
                .unwrap();
            tables
                .output_amounts
                .insert((200u64, 0u64), payload.as_slice())
                .unwrap();
            assert_eq!(
                Tables::next_local_index(&tables.output_amounts, 100).unwrap(),
                2
            );
            assert_eq!(
                Tables::next_local_index(&tables.output_amounts, 200).unwrap(),
                1
            );
            assert_eq!(
                Tables::next_local_index(&tables.output_amounts, 300).unwrap(),
                0
            );
        }
        txn.commit().unwrap();
    }

    #[test]
    fn record_codec_roundtrip() {
        let block = Block::genesis();
        let bytes = encode(&block).unwrap();
        assert_eq!(decode::<Block>(&bytes).unwrap(), block);

        let garbage = [0xffu8; 2];
        assert!(decode::<BlockInfo>(&garbage).is_err());
    }
}
