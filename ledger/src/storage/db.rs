//! # AgoraDB
//!
//! The block-level facade the consensus layer talks to. One call, one
//! block, one write transaction — unless batch mode is on, in which case
//! one write transaction spans a whole sync run and `batch_commit`
//! decides when it lands.
//!
//! `add_block` and `pop_block` are exact inverses: popping the top block
//! restores every table — block records, output indexes, staking sums,
//! marketplace entities, interval buckets — to the byte-identical state
//! before the add. The integration suite holds us to that.

use parking_lot::Mutex;
use redb::{ReadableMultimapTable, ReadableTable};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::chain::{Block, BlockHeader, OutputTarget, Transaction, TxInput};
use crate::config::{ChainParams, NetworkType, DB_SCHEMA_VERSION};
use crate::error::{CommandError, CommandParseError, ExecutionStatus, StoreError, StoreResult};
use crate::market::command::Command;
use crate::market::execute::{
    anchor_output_type, effective_offer_price, execute, rollback, validate, LedgerRead,
    ScriptInput,
};
use crate::market::{AccountRecord, FeedbackRecord, OfferRecord, PricePegRecord};
use crate::staking;

use super::engine::{OpGuard, StoreEnv};
use super::schema::{
    self, decode, encode, AdvancedOutput, AmountOutput, BlockInfo, OutputLocation, OutputRef,
    Tables,
};

/// Backing store filename inside the per-network directory.
const STORE_FILENAME: &str = "ledger.redb";

struct WriteSlot {
    txn: redb::WriteTransaction,
    guard: OpGuard,
}

// ---------------------------------------------------------------------------
// AgoraDB
// ---------------------------------------------------------------------------

/// The ledger store. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct AgoraDB {
    env: StoreEnv,
    params: ChainParams,
    network: NetworkType,
    writer: Mutex<Option<WriteSlot>>,
    batch_enabled: AtomicBool,
}

impl AgoraDB {
    /// Open (or create) the store for `network` under `dir`. Refuses a
    /// store written by a newer build.
    pub fn open(dir: &Path, network: NetworkType) -> StoreResult<Self> {
        let subdir = dir.join(network.subdir());
        fs::create_dir_all(&subdir)
            .map_err(|e| StoreError::Consistency(format!("cannot create {}: {e}", subdir.display())))?;
        let env = StoreEnv::open(&subdir.join(STORE_FILENAME))?;

        match env.schema_version()? {
            Some(found) if found > DB_SCHEMA_VERSION => {
                return Err(StoreError::SchemaVersion {
                    found,
                    supported: DB_SCHEMA_VERSION,
                });
            }
            Some(_) => {}
            None => {
                let (txn, guard) = env.begin_write()?;
                {
                    let mut tables = Tables::open(&txn)?;
                    tables.set_property(schema::PROP_SCHEMA_VERSION, DB_SCHEMA_VERSION)?;
                }
                txn.commit()?;
                drop(guard);
                env.bump_generation();
            }
        }

        info!(%network, dir = %subdir.display(), "ledger opened");
        Ok(AgoraDB {
            env,
            params: ChainParams::for_network(network),
            network,
            writer: Mutex::new(None),
            batch_enabled: AtomicBool::new(false),
        })
    }

    /// The network this store belongs to.
    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// The staking parameters in force.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Abort any open write transaction and release the store. Dropping
    /// the value does the same; this just makes teardown explicit.
    pub fn close(self) -> StoreResult<()> {
        let slot = self.writer.lock().take();
        if let Some(slot) = slot {
            warn!("closing with an open write transaction, aborting it");
            slot.txn.abort()?;
            drop(slot.guard);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Block mutation
    // -----------------------------------------------------------------------

    /// Append a validated block. Returns the new chain height (the
    /// number of blocks). Everything — records, indexes, staking sums,
    /// command effects — lands in one write transaction; any failure
    /// aborts it (including an active batch transaction).
    #[allow(clippy::too_many_arguments)]
    pub fn add_block(
        &self,
        block: &Block,
        txs: &[Transaction],
        size: u64,
        cumulative_difficulty: u64,
        coins_generated: u64,
        tokens_migrated: u64,
    ) -> StoreResult<u64> {
        let mut writer = self.writer.lock();
        let owns_txn = writer.is_none();
        if writer.is_none() {
            let (txn, guard) = self.env.begin_write()?;
            *writer = Some(WriteSlot { txn, guard });
        }
        let slot = writer.as_mut().ok_or(StoreError::NoWriteTransaction)?;

        let result = self.add_block_inner(
            &slot.txn,
            block,
            txs,
            size,
            cumulative_difficulty,
            coins_generated,
            tokens_migrated,
        );

        match result {
            Ok(new_height) => {
                if owns_txn {
                    let slot = writer.take().ok_or(StoreError::NoWriteTransaction)?;
                    slot.txn.commit()?;
                    drop(slot.guard);
                    self.env.bump_generation();
                }
                self.env.record_block_bytes(size);
                debug!(height = new_height - 1, hash = %block.hash_hex(), "block added");

                if owns_txn && self.env.maintenance_due(0) {
                    self.env.maintain()?;
                }
                Ok(new_height)
            }
            Err(e) => {
                // A failed block poisons the whole transaction, batch
                // included: abort it all rather than commit half a block.
                if let Some(slot) = writer.take() {
                    slot.txn.abort()?;
                    drop(slot.guard);
                }
                warn!(hash = %block.hash_hex(), error = %e, "block rejected, transaction aborted");
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_block_inner(
        &self,
        txn: &redb::WriteTransaction,
        block: &Block,
        txs: &[Transaction],
        size: u64,
        cumulative_difficulty: u64,
        coins_generated: u64,
        tokens_migrated: u64,
    ) -> StoreResult<u64> {
        let mut tables = Tables::open(txn)?;
        let height = chain_height(&tables)?;

        // Parent check. Genesis carries an all-zero parent.
        let expected_parent = if height == 0 {
            [0u8; 32]
        } else {
            let bytes = tables
                .blocks
                .get(&(height - 1))?
                .ok_or_else(|| StoreError::NotFound(format!("block {}", height - 1)))?
                .value()
                .to_vec();
            decode::<Block>(&bytes)?.hash()
        };
        if block.header.prev_hash != expected_parent {
            return Err(StoreError::BlockParentMissing {
                expected: hex::encode(expected_parent),
                got: hex::encode(block.header.prev_hash),
            });
        }

        let hash = block.hash();
        let block_bytes = encode(block)?;
        tables.blocks.insert(height, block_bytes.as_slice())?;
        tables.block_heights.insert(hash.as_slice(), height)?;
        let info = encode(&BlockInfo {
            timestamp: block.header.timestamp,
            size,
            cumulative_difficulty,
            coins_generated,
            tokens_migrated,
            hash,
        })?;
        tables.block_info.insert(height, info.as_slice())?;
        tables.hf_versions.insert(height, block.header.version)?;

        for tx in txs {
            self.add_transaction(&mut tables, height, tx)?;
        }

        Ok(height + 1)
    }

    fn add_transaction(
        &self,
        tables: &mut Tables<'_>,
        height: u64,
        tx: &Transaction,
    ) -> StoreResult<()> {
        let hash = tx.hash();
        if tables.tx_indices.get(hash.as_slice())?.is_some() {
            return Err(StoreError::TxExists(hex::encode(hash)));
        }

        let tx_id = tables.property(schema::PROP_TX_COUNT)?.unwrap_or(0);
        tables.set_property(schema::PROP_TX_COUNT, tx_id + 1)?;
        let tx_bytes = encode(tx)?;
        tables.txs.insert(hash.as_slice(), tx_bytes.as_slice())?;
        tables.tx_indices.insert(hash.as_slice(), tx_id)?;

        // Outputs first: commands anchor to them.
        let mut refs: Vec<OutputRef> = Vec::with_capacity(tx.outputs.len());
        for (vout, out) in tx.outputs.iter().enumerate() {
            let vout = vout as u32;
            match &out.target {
                OutputTarget::Key { key } => {
                    let local_index = Tables::next_local_index(&tables.output_amounts, out.amount)?;
                    let payload = encode(&AmountOutput {
                        pubkey: *key,
                        tx_hash: hash,
                        vout,
                    })?;
                    tables
                        .output_amounts
                        .insert((out.amount, local_index), payload.as_slice())?;
                    refs.push(OutputRef::Cash {
                        amount: out.amount,
                        local_index,
                    });
                }
                OutputTarget::TokenKey { key } => {
                    let local_index =
                        Tables::next_local_index(&tables.output_token_amounts, out.token_amount)?;
                    let payload = encode(&AmountOutput {
                        pubkey: *key,
                        tx_hash: hash,
                        vout,
                    })?;
                    tables
                        .output_token_amounts
                        .insert((out.token_amount, local_index), payload.as_slice())?;
                    refs.push(OutputRef::Token {
                        amount: out.token_amount,
                        local_index,
                    });
                }
                OutputTarget::Script {
                    key,
                    output_type,
                    data,
                } => {
                    let id = tables.next_advanced_id()?;
                    let payload = encode(&AdvancedOutput {
                        pubkey: *key,
                        token_amount: out.token_amount,
                        height,
                        data: data.clone(),
                    })?;
                    tables.output_advanced.insert(id, payload.as_slice())?;
                    tables.output_advanced_type.insert(id, output_type.tag())?;
                    let location = encode(&OutputLocation {
                        tx_hash: hash,
                        vout,
                    })?;
                    tables.output_txs.insert(id, location.as_slice())?;
                    refs.push(OutputRef::Advanced { id });
                }
            }
        }
        let refs_bytes = encode(&refs)?;
        tables.tx_outputs.insert(tx_id, refs_bytes.as_slice())?;

        for input in &tx.inputs {
            tables.spent_keys.insert(input.key_image().as_slice(), ())?;
        }

        for (cmd, sinput, anchor_id) in command_plan(tx, &refs)? {
            execute(&cmd, &sinput, tables, &self.params, height, anchor_id)?;
        }
        Ok(())
    }

    /// Remove the top block, restoring the exact pre-add state, and hand
    /// the block and its transactions back to the caller (for return to
    /// the mempool).
    pub fn pop_block(&self) -> StoreResult<(Block, Vec<Transaction>)> {
        let mut writer = self.writer.lock();
        let owns_txn = writer.is_none();
        if writer.is_none() {
            let (txn, guard) = self.env.begin_write()?;
            *writer = Some(WriteSlot { txn, guard });
        }
        let slot = writer.as_mut().ok_or(StoreError::NoWriteTransaction)?;

        let result = self.pop_block_inner(&slot.txn);
        match result {
            Ok(popped) => {
                if owns_txn {
                    let slot = writer.take().ok_or(StoreError::NoWriteTransaction)?;
                    slot.txn.commit()?;
                    drop(slot.guard);
                    self.env.bump_generation();
                }
                debug!(hash = %popped.0.hash_hex(), "block popped");
                Ok(popped)
            }
            Err(e) => {
                if let Some(slot) = writer.take() {
                    slot.txn.abort()?;
                    drop(slot.guard);
                }
                Err(e)
            }
        }
    }

    fn pop_block_inner(
        &self,
        txn: &redb::WriteTransaction,
    ) -> StoreResult<(Block, Vec<Transaction>)> {
        let mut tables = Tables::open(txn)?;
        let height = chain_height(&tables)?;
        if height == 0 {
            return Err(StoreError::EmptyChain);
        }
        let top = height - 1;

        let block_bytes = tables
            .blocks
            .get(&top)?
            .ok_or_else(|| StoreError::NotFound(format!("block {top}")))?
            .value()
            .to_vec();
        let block: Block = decode(&block_bytes)?;

        let mut txs: Vec<Transaction> = Vec::with_capacity(block.tx_hashes.len());
        for tx_hash in &block.tx_hashes {
            let bytes = tables
                .txs
                .get(tx_hash.as_slice())?
                .ok_or_else(|| StoreError::NotFound(format!("tx {}", hex::encode(tx_hash))))?
                .value()
                .to_vec();
            txs.push(decode(&bytes)?);
        }

        // Reverse transaction order; inside a transaction, commands roll
        // back in reverse input order, then its outputs come out.
        for tx in txs.iter().rev() {
            self.remove_transaction(&mut tables, top, tx)?;
        }

        let block_hash = block.hash();
        tables.blocks.remove(&top)?;
        tables.block_heights.remove(block_hash.as_slice())?;
        tables.block_info.remove(&top)?;
        tables.hf_versions.remove(&top)?;

        Ok((block, txs))
    }

    fn remove_transaction(
        &self,
        tables: &mut Tables<'_>,
        height: u64,
        tx: &Transaction,
    ) -> StoreResult<()> {
        let hash = tx.hash();
        let tx_id = tables
            .tx_indices
            .get(hash.as_slice())?
            .ok_or_else(|| StoreError::NotFound(format!("tx index {}", hex::encode(hash))))?
            .value();
        let refs: Vec<OutputRef> = {
            let bytes = tables
                .tx_outputs
                .get(&tx_id)?
                .ok_or_else(|| StoreError::NotFound(format!("tx outputs {tx_id}")))?
                .value()
                .to_vec();
            decode(&bytes)?
        };

        for (cmd, sinput, anchor_id) in command_plan(tx, &refs)?.into_iter().rev() {
            rollback(&cmd, &sinput, tables, &self.params, height, anchor_id)?;
        }

        for output_ref in refs.iter().rev() {
            match output_ref {
                OutputRef::Cash {
                    amount,
                    local_index,
                } => {
                    tables.output_amounts.remove(&(*amount, *local_index))?;
                }
                OutputRef::Token {
                    amount,
                    local_index,
                } => {
                    tables
                        .output_token_amounts
                        .remove(&(*amount, *local_index))?;
                }
                OutputRef::Advanced { id } => {
                    tables.output_advanced.remove(id)?;
                    tables.output_advanced_type.remove(id)?;
                    tables.output_txs.remove(id)?;
                    tables.release_advanced_id()?;
                }
            }
        }

        for input in &tx.inputs {
            tables.spent_keys.remove(input.key_image().as_slice())?;
        }

        tables.txs.remove(hash.as_slice())?;
        tables.tx_indices.remove(hash.as_slice())?;
        tables.tx_outputs.remove(&tx_id)?;
        let count = tables
            .property(schema::PROP_TX_COUNT)?
            .ok_or_else(|| StoreError::Consistency("tx counter missing".into()))?;
        tables.set_property(
            schema::PROP_TX_COUNT,
            count
                .checked_sub(1)
                .ok_or_else(|| StoreError::Consistency("tx counter underflow".into()))?,
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batch control
    // -----------------------------------------------------------------------

    /// Allow one write transaction to span many `add_block` calls.
    pub fn set_batch_transactions(&self, enabled: bool) {
        self.batch_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Open the batch transaction. `Ok(false)` when one is already
    /// active. Runs a maintenance pass first when the growth estimate
    /// for `num_blocks` (or the caller's `bytes` hint) says one is due.
    pub fn batch_start(&self, num_blocks: u64, bytes: u64) -> StoreResult<bool> {
        if !self.batch_enabled.load(Ordering::SeqCst) {
            return Err(StoreError::BatchNotEnabled);
        }
        {
            let writer = self.writer.lock();
            if writer.is_some() {
                return Ok(false);
            }
        }
        let hint = if bytes > 0 {
            bytes
        } else {
            self.env.estimated_batch_bytes(num_blocks)
        };
        if self.env.maintenance_due(hint) {
            self.env.maintain()?;
        }
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Ok(false);
        }
        let (txn, guard) = self.env.begin_write()?;
        *writer = Some(WriteSlot { txn, guard });
        debug!(num_blocks, hint, "batch transaction started");
        Ok(true)
    }

    /// Commit the batch transaction and immediately open a fresh one.
    pub fn batch_commit(&self) -> StoreResult<()> {
        if !self.batch_enabled.load(Ordering::SeqCst) {
            return Err(StoreError::BatchNotEnabled);
        }
        let mut writer = self.writer.lock();
        let slot = writer.take().ok_or(StoreError::NoWriteTransaction)?;
        slot.txn.commit()?;
        drop(slot.guard);
        self.env.bump_generation();
        let (txn, guard) = self.env.begin_write()?;
        *writer = Some(WriteSlot { txn, guard });
        Ok(())
    }

    /// Commit the batch transaction and end the batch.
    pub fn batch_stop(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        let slot = writer.take().ok_or(StoreError::NoWriteTransaction)?;
        slot.txn.commit()?;
        drop(slot.guard);
        self.env.bump_generation();
        debug!("batch transaction committed");
        Ok(())
    }

    /// Throw the batch transaction away, discarding every uncommitted
    /// block.
    pub fn batch_abort(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        let slot = writer.take().ok_or(StoreError::NoWriteTransaction)?;
        slot.txn.abort()?;
        drop(slot.guard);
        debug!("batch transaction aborted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Command pre-check
    // -----------------------------------------------------------------------

    /// Validate a script input's command against the current snapshot
    /// without executing it. Rejection comes back as
    /// [`ExecutionStatus`] data inside [`CommandError::Rejected`].
    pub fn validate_command(&self, input: &TxInput) -> Result<(), CommandError> {
        let height = self.height()?;
        let params = self.params;
        self.env
            .with_reader(|r| {
                let (sinput, script) = match ScriptInput::from_tx_input(input) {
                    Some(v) => v,
                    None => {
                        return Ok(Err(CommandError::Parse(CommandParseError::Payload(
                            "input carries no script".into(),
                        ))))
                    }
                };
                let cmd = match Command::parse(script) {
                    Ok(cmd) => cmd,
                    Err(e) => return Ok(Err(CommandError::Parse(e))),
                };
                Ok(validate(&cmd, &sinput, r, &params, height))
            })
            .map_err(CommandError::from)?
    }

    // -----------------------------------------------------------------------
    // Chain queries
    // -----------------------------------------------------------------------

    /// Number of blocks in the chain.
    pub fn height(&self) -> StoreResult<u64> {
        self.env.with_reader(|r| {
            Ok(match r.blocks()?.last()? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            })
        })
    }

    /// Whether a block with this hash is stored.
    pub fn block_exists(&self, hash: &[u8; 32]) -> StoreResult<bool> {
        self.env
            .with_reader(|r| Ok(r.block_heights()?.get(hash.as_slice())?.is_some()))
    }

    /// The height of the block with this hash.
    pub fn block_height(&self, hash: &[u8; 32]) -> StoreResult<Option<u64>> {
        self.env
            .with_reader(|r| Ok(r.block_heights()?.get(hash.as_slice())?.map(|v| v.value())))
    }

    /// The block at `height`.
    pub fn block_by_height(&self, height: u64) -> StoreResult<Option<Block>> {
        self.env.with_reader(|r| match r.blocks()?.get(&height)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        })
    }

    /// The block with this hash.
    pub fn block_by_hash(&self, hash: &[u8; 32]) -> StoreResult<Option<Block>> {
        match self.block_height(hash)? {
            Some(height) => self.block_by_height(height),
            None => Ok(None),
        }
    }

    /// The hash of the block at `height`.
    pub fn block_hash(&self, height: u64) -> StoreResult<Option<[u8; 32]>> {
        Ok(self.block_info(height)?.map(|info| info.hash))
    }

    /// The header of the block at `height`.
    pub fn block_header(&self, height: u64) -> StoreResult<Option<BlockHeader>> {
        Ok(self.block_by_height(height)?.map(|b| b.header))
    }

    /// Consensus metadata of the block at `height`.
    pub fn block_info(&self, height: u64) -> StoreResult<Option<BlockInfo>> {
        self.env
            .with_reader(|r| match r.block_info()?.get(&height)? {
                Some(v) => Ok(Some(decode(v.value())?)),
                None => Ok(None),
            })
    }

    /// The hard-fork version the block at `height` was produced under.
    pub fn hard_fork_version(&self, height: u64) -> StoreResult<Option<u8>> {
        self.env
            .with_reader(|r| Ok(r.hf_versions()?.get(&height)?.map(|v| v.value())))
    }

    // -----------------------------------------------------------------------
    // Transaction and output queries
    // -----------------------------------------------------------------------

    /// The transaction with this hash.
    pub fn tx(&self, hash: &[u8; 32]) -> StoreResult<Option<Transaction>> {
        self.env
            .with_reader(|r| match r.txs()?.get(hash.as_slice())? {
                Some(v) => Ok(Some(decode(v.value())?)),
                None => Ok(None),
            })
    }

    /// Whether a transaction with this hash is stored.
    pub fn tx_exists(&self, hash: &[u8; 32]) -> StoreResult<bool> {
        self.env
            .with_reader(|r| Ok(r.tx_indices()?.get(hash.as_slice())?.is_some()))
    }

    /// Total number of stored transactions.
    pub fn tx_count(&self) -> StoreResult<u64> {
        self.env.with_reader(|r| {
            Ok(r.properties()?
                .get(schema::PROP_TX_COUNT)?
                .map(|v| v.value())
                .unwrap_or(0))
        })
    }

    /// The cash output at `(amount, local index)`.
    pub fn output_key(&self, amount: u64, index: u64) -> StoreResult<Option<AmountOutput>> {
        self.env
            .with_reader(|r| match r.output_amounts()?.get(&(amount, index))? {
                Some(v) => Ok(Some(decode(v.value())?)),
                None => Ok(None),
            })
    }

    /// The token output at `(amount, local index)`.
    pub fn token_output_key(&self, amount: u64, index: u64) -> StoreResult<Option<AmountOutput>> {
        self.env
            .with_reader(|r| match r.output_token_amounts()?.get(&(amount, index))? {
                Some(v) => Ok(Some(decode(v.value())?)),
                None => Ok(None),
            })
    }

    /// Which transaction created advanced output `id`, and at which vout.
    pub fn output_tx_and_index(&self, id: u64) -> StoreResult<Option<OutputLocation>> {
        self.env
            .with_reader(|r| match r.output_txs()?.get(&id)? {
                Some(v) => Ok(Some(decode(v.value())?)),
                None => Ok(None),
            })
    }

    /// The advanced output under `id`.
    pub fn advanced_output(&self, id: u64) -> StoreResult<Option<AdvancedOutput>> {
        self.env.with_reader(|r| r.advanced_output(id))
    }

    /// How many advanced outputs exist (ids are dense, so this is also
    /// the next id).
    pub fn num_advanced_outputs(&self) -> StoreResult<u64> {
        self.env.with_reader(|r| {
            Ok(r.properties()?
                .get(schema::PROP_NEXT_ADVANCED_ID)?
                .map(|v| v.value())
                .unwrap_or(0))
        })
    }

    /// Whether a key image has been spent.
    pub fn key_image_spent(&self, key_image: &[u8; 32]) -> StoreResult<bool> {
        self.env
            .with_reader(|r| Ok(r.spent_keys()?.get(key_image.as_slice())?.is_some()))
    }

    // -----------------------------------------------------------------------
    // Staking queries
    // -----------------------------------------------------------------------

    /// Currently staked tokens, atomic units.
    pub fn current_staked_token_sum(&self) -> StoreResult<u64> {
        self.env.with_reader(|r| r.staked_sum_total())
    }

    /// Tokens staked during `interval`, atomic units.
    pub fn staked_token_sum_for_interval(&self, interval: u64) -> StoreResult<u64> {
        self.env
            .with_reader(|r| staking::staked_sum_for_interval(r.token_locked_sum()?, interval))
    }

    /// Fees collected during `interval`, atomic cash units.
    pub fn network_fee_sum_for_interval(&self, interval: u64) -> StoreResult<u64> {
        self.env
            .with_reader(|r| staking::fee_sum_for_interval(r.network_fee_sum()?, interval))
    }

    /// Advanced output ids of stakes whose lock expires at `height`.
    pub fn token_stake_expiry_outputs(&self, height: u64) -> StoreResult<Vec<u64>> {
        self.env.with_reader(|r| {
            let mut ids = Vec::new();
            for value in r.token_lock_expiry()?.get(&height)? {
                ids.push(value?.value());
            }
            Ok(ids)
        })
    }

    // -----------------------------------------------------------------------
    // Marketplace queries
    // -----------------------------------------------------------------------

    /// The full account record for `username`.
    pub fn account(&self, username: &str) -> StoreResult<Option<AccountRecord>> {
        self.env.with_reader(|r| r.account(username))
    }

    /// The account's public key.
    pub fn account_key(&self, username: &str) -> StoreResult<Option<[u8; 32]>> {
        Ok(self.account(username)?.map(|a| a.pubkey))
    }

    /// The account's data blob.
    pub fn account_data(&self, username: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.account(username)?.map(|a| a.data))
    }

    /// The full offer record.
    pub fn offer(&self, offer_id: &[u8; 32]) -> StoreResult<Option<OfferRecord>> {
        self.env.with_reader(|r| r.offer(offer_id))
    }

    /// Units left in stock.
    pub fn offer_quantity(&self, offer_id: &[u8; 32]) -> StoreResult<Option<u64>> {
        Ok(self.offer(offer_id)?.map(|o| o.quantity))
    }

    /// Whether the offer accepts purchases.
    pub fn offer_active(&self, offer_id: &[u8; 32]) -> StoreResult<Option<bool>> {
        Ok(self.offer(offer_id)?.map(|o| o.active))
    }

    /// The offer's seller username.
    pub fn offer_seller(&self, offer_id: &[u8; 32]) -> StoreResult<Option<String>> {
        Ok(self.offer(offer_id)?.map(|o| o.seller))
    }

    /// Peg-aware effective per-unit price, atomic cash units.
    pub fn offer_price(&self, offer_id: &[u8; 32]) -> StoreResult<Option<u64>> {
        self.env.with_reader(|r| {
            let offer = match r.offer(offer_id)? {
                Some(offer) => offer,
                None => return Ok(None),
            };
            effective_offer_price(&offer, r)
                .map(Some)
                .map_err(StoreError::Command)
        })
    }

    /// All feedback left on an offer.
    pub fn feedback(&self, offer_id: &[u8; 32]) -> StoreResult<Option<FeedbackRecord>> {
        self.env.with_reader(|r| r.feedback(offer_id))
    }

    /// The full price peg record.
    pub fn price_peg(&self, peg_id: &[u8; 32]) -> StoreResult<Option<PricePegRecord>> {
        self.env.with_reader(|r| r.price_peg(peg_id))
    }

    /// The peg's current rate.
    pub fn price_peg_rate(&self, peg_id: &[u8; 32]) -> StoreResult<Option<u64>> {
        Ok(self.price_peg(peg_id)?.map(|p| p.rate))
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn chain_height(tables: &Tables<'_>) -> StoreResult<u64> {
    Ok(match tables.blocks.last()? {
        Some((k, _)) => k.value() + 1,
        None => 0,
    })
}

/// Pair every script-input command of `tx` with the advanced output id
/// anchoring its effect, in input order. Commands of the same type
/// consume matching-type outputs first-to-first; a command with no
/// output left to anchor to is a rejection.
fn command_plan<'a>(
    tx: &'a Transaction,
    refs: &[OutputRef],
) -> StoreResult<Vec<(Command, ScriptInput<'a>, u64)>> {
    let mut queues: HashMap<u8, VecDeque<u64>> = HashMap::new();
    for (vout, out) in tx.outputs.iter().enumerate() {
        if let OutputTarget::Script { output_type, .. } = &out.target {
            if let Some(OutputRef::Advanced { id }) = refs.get(vout) {
                queues.entry(output_type.tag()).or_default().push_back(*id);
            }
        }
    }

    let mut plan = Vec::new();
    for input in &tx.inputs {
        let (sinput, script) = match ScriptInput::from_tx_input(input) {
            Some(v) => v,
            None => continue,
        };
        let cmd = Command::parse(script)
            .map_err(|e| StoreError::Command(CommandError::Parse(e)))?;
        let anchor_id = match anchor_output_type(cmd.command_type()) {
            Some(ty) => queues
                .get_mut(&ty.tag())
                .and_then(|q| q.pop_front())
                .ok_or(StoreError::Command(CommandError::Rejected(
                    ExecutionStatus::MissingScriptOutput,
                )))?,
            None => 0,
        };
        plan.push((cmd, sinput, anchor_id));
    }
    Ok(plan)
}
