//! # Transaction Safety
//!
//! redb already gives us MVCC: one writer, any number of snapshot
//! readers. This module adds the three things it does not give us:
//!
//! 1. **Cached per-thread readers.** Opening a read transaction and its
//!    table handles per query is measurable on hot paths, so each worker
//!    thread keeps one [`ReaderSlot`] (snapshot + lazily opened table
//!    handles) in a process-wide map, renewed whenever the engine
//!    generation advances.
//! 2. **The maintenance barrier.** Compaction requires zero live
//!    transactions. [`StoreEnv::maintain`] raises a barrier, drains the
//!    in-flight operation counter, drops every cached reader, compacts
//!    under an exclusive database lock, bumps the generation, and lowers
//!    the barrier. New operations park on the barrier's condvar while it
//!    is up.
//! 3. **Growth tracking.** An exponential moving average of serialized
//!    bytes per block decides when a maintenance pass is due, fed both
//!    by individual `add_block` calls and by `batch_start` hints.

use parking_lot::{Condvar, Mutex, RwLock};
use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info};

use super::schema;
use crate::error::{StoreError, StoreResult};

/// Bytes of new block data between maintenance passes.
const MAINTENANCE_INTERVAL_BYTES: u64 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// EnvState
// ---------------------------------------------------------------------------

/// Shared coordination state, held by the environment and by every
/// in-flight [`OpGuard`].
pub(crate) struct EnvState {
    /// Operations currently inside the engine.
    active_ops: AtomicUsize,
    /// Bumped on every commit and every maintenance pass; readers renew
    /// their snapshot when their cached generation falls behind.
    generation: AtomicU64,
    /// True while maintenance owns the store.
    barrier: Mutex<bool>,
    barrier_cv: Condvar,
    /// One cached reader per worker thread.
    readers: Mutex<HashMap<ThreadId, ReaderSlot>>,
    /// EMA of serialized bytes per block, x8 fixed point.
    block_bytes_ema: AtomicU64,
    /// Bytes written since the last maintenance pass.
    bytes_since_maintenance: AtomicU64,
}

impl EnvState {
    fn new() -> Self {
        EnvState {
            active_ops: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            barrier: Mutex::new(false),
            barrier_cv: Condvar::new(),
            readers: Mutex::new(HashMap::new()),
            block_bytes_ema: AtomicU64::new(0),
            bytes_since_maintenance: AtomicU64::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// OpGuard
// ---------------------------------------------------------------------------

/// RAII pass through the maintenance barrier.
///
/// Constructing one blocks while the barrier is up, then counts the
/// holder as in-flight; dropping it wakes maintenance waiting to drain.
pub struct OpGuard {
    state: Arc<EnvState>,
}

impl OpGuard {
    fn acquire(state: &Arc<EnvState>) -> Self {
        let mut up = state.barrier.lock();
        while *up {
            state.barrier_cv.wait(&mut up);
        }
        state.active_ops.fetch_add(1, Ordering::SeqCst);
        drop(up);
        OpGuard {
            state: Arc::clone(state),
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.state.active_ops.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Lock the barrier so the notify cannot slip between a
            // drainer's counter check and its wait.
            let _up = self.state.barrier.lock();
            self.state.barrier_cv.notify_all();
        }
    }
}

// ---------------------------------------------------------------------------
// ReaderSlot
// ---------------------------------------------------------------------------

/// One thread's cached snapshot plus lazily opened read-only tables.
/// redb read-only tables own their snapshot reference, so the handles
/// can live beside the transaction in a plain struct.
pub struct ReaderSlot {
    generation: u64,
    rtxn: ReadTransaction,
    blocks: Option<redb::ReadOnlyTable<u64, &'static [u8]>>,
    block_heights: Option<redb::ReadOnlyTable<&'static [u8], u64>>,
    block_info: Option<redb::ReadOnlyTable<u64, &'static [u8]>>,
    txs: Option<redb::ReadOnlyTable<&'static [u8], &'static [u8]>>,
    tx_indices: Option<redb::ReadOnlyTable<&'static [u8], u64>>,
    output_amounts: Option<redb::ReadOnlyTable<(u64, u64), &'static [u8]>>,
    output_token_amounts: Option<redb::ReadOnlyTable<(u64, u64), &'static [u8]>>,
    output_txs: Option<redb::ReadOnlyTable<u64, &'static [u8]>>,
    output_advanced: Option<redb::ReadOnlyTable<u64, &'static [u8]>>,
    output_advanced_type: Option<redb::ReadOnlyTable<u64, u8>>,
    spent_keys: Option<redb::ReadOnlyTable<&'static [u8], ()>>,
    token_locked_sum: Option<redb::ReadOnlyTable<u64, u64>>,
    token_locked_sum_total: Option<redb::ReadOnlyTable<(), u64>>,
    network_fee_sum: Option<redb::ReadOnlyTable<u64, u64>>,
    token_lock_expiry: Option<redb::ReadOnlyMultimapTable<u64, u64>>,
    market_accounts: Option<redb::ReadOnlyTable<&'static str, &'static [u8]>>,
    market_offers: Option<redb::ReadOnlyTable<&'static [u8], &'static [u8]>>,
    market_feedback: Option<redb::ReadOnlyTable<&'static [u8], &'static [u8]>>,
    market_price_pegs: Option<redb::ReadOnlyTable<&'static [u8], &'static [u8]>>,
    hf_versions: Option<redb::ReadOnlyTable<u64, u8>>,
    properties: Option<redb::ReadOnlyTable<&'static str, u64>>,
}

macro_rules! lazy_table {
    ($fn:ident, $field:ident, $def:ident, $k:ty, $v:ty) => {
        pub fn $fn(&mut self) -> StoreResult<&redb::ReadOnlyTable<$k, $v>> {
            if self.$field.is_none() {
                self.$field = Some(self.rtxn.open_table(schema::$def)?);
            }
            self.$field
                .as_ref()
                .ok_or_else(|| StoreError::NotFound("reader table handle".into()))
        }
    };
}

impl ReaderSlot {
    fn new(db: &Database, generation: u64) -> StoreResult<Self> {
        Ok(ReaderSlot {
            generation,
            rtxn: db.begin_read()?,
            blocks: None,
            block_heights: None,
            block_info: None,
            txs: None,
            tx_indices: None,
            output_amounts: None,
            output_token_amounts: None,
            output_txs: None,
            output_advanced: None,
            output_advanced_type: None,
            spent_keys: None,
            token_locked_sum: None,
            token_locked_sum_total: None,
            network_fee_sum: None,
            token_lock_expiry: None,
            market_accounts: None,
            market_offers: None,
            market_feedback: None,
            market_price_pegs: None,
            hf_versions: None,
            properties: None,
        })
    }

    lazy_table!(blocks, blocks, BLOCKS, u64, &'static [u8]);
    lazy_table!(block_heights, block_heights, BLOCK_HEIGHTS, &'static [u8], u64);
    lazy_table!(block_info, block_info, BLOCK_INFO, u64, &'static [u8]);
    lazy_table!(txs, txs, TXS, &'static [u8], &'static [u8]);
    lazy_table!(tx_indices, tx_indices, TX_INDICES, &'static [u8], u64);
    lazy_table!(output_amounts, output_amounts, OUTPUT_AMOUNTS, (u64, u64), &'static [u8]);
    lazy_table!(
        output_token_amounts,
        output_token_amounts,
        OUTPUT_TOKEN_AMOUNTS,
        (u64, u64),
        &'static [u8]
    );
    lazy_table!(output_txs, output_txs, OUTPUT_TXS, u64, &'static [u8]);
    lazy_table!(output_advanced, output_advanced, OUTPUT_ADVANCED, u64, &'static [u8]);
    lazy_table!(
        output_advanced_type,
        output_advanced_type,
        OUTPUT_ADVANCED_TYPE,
        u64,
        u8
    );
    lazy_table!(spent_keys, spent_keys, SPENT_KEYS, &'static [u8], ());
    lazy_table!(token_locked_sum, token_locked_sum, TOKEN_LOCKED_SUM, u64, u64);
    lazy_table!(
        token_locked_sum_total,
        token_locked_sum_total,
        TOKEN_LOCKED_SUM_TOTAL,
        (),
        u64
    );
    lazy_table!(network_fee_sum, network_fee_sum, NETWORK_FEE_SUM, u64, u64);
    lazy_table!(market_accounts, market_accounts, MARKET_ACCOUNTS, &'static str, &'static [u8]);
    lazy_table!(market_offers, market_offers, MARKET_OFFERS, &'static [u8], &'static [u8]);
    lazy_table!(market_feedback, market_feedback, MARKET_FEEDBACK, &'static [u8], &'static [u8]);
    lazy_table!(
        market_price_pegs,
        market_price_pegs,
        MARKET_PRICE_PEGS,
        &'static [u8],
        &'static [u8]
    );
    lazy_table!(hf_versions, hf_versions, HF_VERSIONS, u64, u8);
    lazy_table!(properties, properties, PROPERTIES, &'static str, u64);

    /// The expiry multimap needs its own accessor shape.
    pub fn token_lock_expiry(&mut self) -> StoreResult<&redb::ReadOnlyMultimapTable<u64, u64>> {
        if self.token_lock_expiry.is_none() {
            self.token_lock_expiry = Some(self.rtxn.open_multimap_table(schema::TOKEN_LOCK_EXPIRY)?);
        }
        self.token_lock_expiry
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("reader table handle".into()))
    }
}

fn decode_guard<T: serde::de::DeserializeOwned>(
    value: Option<redb::AccessGuard<'_, &'static [u8]>>,
) -> StoreResult<Option<T>> {
    match value {
        Some(guard) => Ok(Some(schema::decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Snapshot-backed implementation of the validation read surface. The
/// write-side twin lives on [`schema::Tables`].
impl crate::market::execute::LedgerRead for ReaderSlot {
    fn account(&mut self, username: &str) -> StoreResult<Option<crate::market::AccountRecord>> {
        let value = self.market_accounts()?.get(username)?;
        decode_guard(value)
    }

    fn offer(&mut self, offer_id: &[u8; 32]) -> StoreResult<Option<crate::market::OfferRecord>> {
        let value = self.market_offers()?.get(offer_id.as_slice())?;
        decode_guard(value)
    }

    fn feedback(
        &mut self,
        offer_id: &[u8; 32],
    ) -> StoreResult<Option<crate::market::FeedbackRecord>> {
        let value = self.market_feedback()?.get(offer_id.as_slice())?;
        decode_guard(value)
    }

    fn price_peg(
        &mut self,
        peg_id: &[u8; 32],
    ) -> StoreResult<Option<crate::market::PricePegRecord>> {
        let value = self.market_price_pegs()?.get(peg_id.as_slice())?;
        decode_guard(value)
    }

    fn advanced_output(&mut self, id: u64) -> StoreResult<Option<schema::AdvancedOutput>> {
        let value = self.output_advanced()?.get(&id)?;
        decode_guard(value)
    }

    fn advanced_output_type(
        &mut self,
        id: u64,
    ) -> StoreResult<Option<crate::chain::OutputType>> {
        Ok(self
            .output_advanced_type()?
            .get(&id)?
            .and_then(|v| crate::chain::OutputType::from_tag(v.value())))
    }

    fn staked_sum_total(&mut self) -> StoreResult<u64> {
        crate::staking::staked_sum_total(self.token_locked_sum_total()?)
    }

    fn interest_for(
        &mut self,
        params: &crate::config::ChainParams,
        stake_height: u64,
        unstake_height: u64,
        token_amount: u64,
    ) -> StoreResult<u64> {
        // Force both handles open, then borrow the fields together.
        self.token_locked_sum()?;
        self.network_fee_sum()?;
        let locked = self
            .token_locked_sum
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("reader table handle".into()))?;
        let fees = self
            .network_fee_sum
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("reader table handle".into()))?;
        crate::staking::interest_earned(
            locked,
            fees,
            params,
            stake_height,
            unstake_height,
            token_amount,
        )
    }
}

// ---------------------------------------------------------------------------
// StoreEnv
// ---------------------------------------------------------------------------

/// The database plus every piece of coordination state around it.
pub struct StoreEnv {
    db: RwLock<Database>,
    state: Arc<EnvState>,
}

impl StoreEnv {
    /// Create or open the backing file and make sure every table exists,
    /// so read snapshots never see a missing table.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path)?;
        let env = StoreEnv {
            db: RwLock::new(db),
            state: Arc::new(EnvState::new()),
        };
        {
            let db = env.db.read();
            let txn = db.begin_write()?;
            {
                let tables = schema::Tables::open(&txn)?;
                drop(tables);
            }
            txn.commit()?;
        }
        info!(path = %path.display(), "store environment opened");
        Ok(env)
    }

    /// Pass the barrier and count as in-flight for the guard's lifetime.
    pub fn op_guard(&self) -> OpGuard {
        OpGuard::acquire(&self.state)
    }

    /// Begin the (single) write transaction. The caller holds the
    /// returned guard for as long as the transaction lives.
    pub fn begin_write(&self) -> StoreResult<(WriteTransaction, OpGuard)> {
        let guard = self.op_guard();
        let txn = self.db.read().begin_write()?;
        Ok((txn, guard))
    }

    /// Mark a commit: readers renew on their next access.
    pub fn bump_generation(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Run `f` against this thread's cached snapshot, renewing the
    /// snapshot first if the engine generation has advanced.
    ///
    /// The slot is checked out of the map for the duration of `f`, so
    /// the map lock is never held across user code.
    pub fn with_reader<T>(
        &self,
        f: impl FnOnce(&mut ReaderSlot) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.op_guard();
        let generation = self.state.generation.load(Ordering::SeqCst);
        let thread_id = thread::current().id();

        let slot = self.state.readers.lock().remove(&thread_id);
        let mut slot = match slot {
            Some(slot) if slot.generation == generation => slot,
            _ => ReaderSlot::new(&self.db.read(), generation)?,
        };

        let result = f(&mut slot);
        self.state.readers.lock().insert(thread_id, slot);
        result
    }

    /// Feed the growth estimator with one block's serialized size.
    pub fn record_block_bytes(&self, bytes: u64) {
        // ema <- ema * 7/8 + bytes / 8, in x8 fixed point
        let _ = self
            .state
            .block_bytes_ema
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ema| {
                Some(ema - ema / 8 + bytes)
            });
        self.state
            .bytes_since_maintenance
            .fetch_add(bytes, Ordering::SeqCst);
    }

    /// Expected on-disk growth of `num_blocks` further blocks, from the
    /// EMA. Zero until the estimator has seen data.
    pub fn estimated_batch_bytes(&self, num_blocks: u64) -> u64 {
        let ema = self.state.block_bytes_ema.load(Ordering::SeqCst) / 8;
        ema.saturating_mul(num_blocks)
    }

    /// Whether enough has been written since the last pass to warrant
    /// maintenance before taking on `upcoming_bytes` more.
    pub fn maintenance_due(&self, upcoming_bytes: u64) -> bool {
        let written = self.state.bytes_since_maintenance.load(Ordering::SeqCst);
        written.saturating_add(upcoming_bytes) >= MAINTENANCE_INTERVAL_BYTES
    }

    /// Exclusive maintenance pass: drain every in-flight operation,
    /// drop all cached readers, compact, and advance the generation.
    ///
    /// Must not be called while this thread holds an [`OpGuard`] or an
    /// open transaction; that would deadlock the drain.
    pub fn maintain(&self) -> StoreResult<()> {
        {
            let mut up = self.state.barrier.lock();
            while *up {
                self.state.barrier_cv.wait(&mut up);
            }
            *up = true;
            while self.state.active_ops.load(Ordering::SeqCst) > 0 {
                self.state.barrier_cv.wait(&mut up);
            }
        }

        // Cached read transactions are the last live transactions.
        self.state.readers.lock().clear();

        let result = {
            let mut db = self.db.write();
            db.compact().map_err(StoreError::from).map(|reclaimed| {
                debug!(reclaimed, "maintenance compaction finished");
            })
        };

        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state
            .bytes_since_maintenance
            .store(0, Ordering::SeqCst);

        let mut up = self.state.barrier.lock();
        *up = false;
        self.state.barrier_cv.notify_all();
        drop(up);

        result
    }

    /// Persisted schema version, `None` on a store that predates the
    /// property (treated as version 0 by the caller).
    pub fn schema_version(&self) -> StoreResult<Option<u64>> {
        self.with_reader(|r| Ok(r.properties()?.get(schema::PROP_SCHEMA_VERSION)?.map(|v| v.value())))
    }
}
