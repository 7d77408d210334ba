//! # Command Validation and Execution
//!
//! Three entry points, one per lifecycle stage:
//!
//! - [`validate`] — read-only rule check against a [`LedgerRead`] view.
//!   Rejection comes back as [`ExecutionStatus`] data, so mempools can
//!   pre-screen commands without a write transaction.
//! - [`execute`] — re-validates, then applies the command inside the
//!   surrounding block's write transaction.
//! - [`rollback`] — exact inverse, applied by `pop_block` in reverse
//!   transaction order.
//!
//! ## Rollback by replay
//!
//! Entity records carry only their advanced-output id history, not
//! snapshots of prior states. Rolling back an edit therefore pops the
//! last id and *replays* the surviving outputs' stored command payloads
//! in order — create establishes the record, edits overwrite, purchases
//! decrement. Replay is cheap (histories are short) and keeps the
//! records impossible to desynchronize from the chain.

use redb::ReadableTable;
use tracing::debug;

use crate::chain::{OutputType, TxInput};
use crate::config::{
    ChainParams, ACCOUNT_TOKEN_LOCK, BPS_DENOMINATOR, MAX_ACCOUNT_DATA_SIZE,
    MAX_ACCOUNT_USERNAME_LEN, MAX_FEEDBACK_COMMENT_SIZE, MAX_FEEDBACK_STARS,
    MAX_OFFER_DESCRIPTION_SIZE, MAX_OFFER_TITLE_LEN, MAX_PRICE_PEG_CURRENCY_LEN,
    MAX_PRICE_PEG_DATA_SIZE, NETWORK_FEE_BPS, OFFER_MAX_PRICE, OFFER_MIN_PRICE, TOKEN_UNIT,
};
use crate::error::{CommandError, ExecutionStatus, StoreError, StoreResult};
use crate::staking;
use crate::storage::schema::{decode, encode, AdvancedOutput, Tables};

use super::command::{Command, CommandType, ExecutionResult};
use super::records::{
    AccountRecord, FeedbackEntry, FeedbackRecord, OfferRecord, PricePegRecord,
};

// ---------------------------------------------------------------------------
// ScriptInput
// ---------------------------------------------------------------------------

/// The fields of a script input a command is checked against.
#[derive(Clone, Copy, Debug)]
pub struct ScriptInput<'a> {
    /// Cash amount the input claims (interest, donation, payment).
    pub amount: u64,
    /// Token amount the input locks or releases.
    pub token_amount: u64,
    /// Advanced output ids the command references.
    pub key_offsets: &'a [u64],
}

impl<'a> ScriptInput<'a> {
    /// Extract the command-relevant fields, `None` for non-script inputs.
    pub fn from_tx_input(input: &'a TxInput) -> Option<(Self, &'a [u8])> {
        match input {
            TxInput::Script {
                amount,
                token_amount,
                key_offsets,
                script,
                ..
            } => Some((
                ScriptInput {
                    amount: *amount,
                    token_amount: *token_amount,
                    key_offsets,
                },
                script.as_slice(),
            )),
            _ => None,
        }
    }
}

/// The advanced output type a command's effect anchors to within its own
/// transaction, `None` when the command needs no anchor output.
pub fn anchor_output_type(ty: CommandType) -> Option<OutputType> {
    match ty {
        CommandType::CreateAccount | CommandType::EditAccount => Some(OutputType::Account),
        CommandType::StakeToken => Some(OutputType::TokenStake),
        CommandType::UnstakeToken => None,
        CommandType::DonateNetworkFee => Some(OutputType::NetworkFee),
        CommandType::CreateOffer | CommandType::EditOffer => Some(OutputType::Offer),
        CommandType::Purchase => Some(OutputType::Purchase),
        CommandType::Feedback => Some(OutputType::Feedback),
        CommandType::CreatePricePeg | CommandType::UpdatePricePeg => Some(OutputType::PricePeg),
    }
}

// ---------------------------------------------------------------------------
// LedgerRead
// ---------------------------------------------------------------------------

/// The read surface validation needs, implemented both by the write-side
/// [`Tables`] bundle (validation inside `add_block`) and by the engine's
/// cached reader slots (public pre-checks on a snapshot).
///
/// `&mut self` because the snapshot implementation opens its table
/// handles lazily.
pub trait LedgerRead {
    fn account(&mut self, username: &str) -> StoreResult<Option<AccountRecord>>;
    fn offer(&mut self, offer_id: &[u8; 32]) -> StoreResult<Option<OfferRecord>>;
    fn feedback(&mut self, offer_id: &[u8; 32]) -> StoreResult<Option<FeedbackRecord>>;
    fn price_peg(&mut self, peg_id: &[u8; 32]) -> StoreResult<Option<PricePegRecord>>;
    fn advanced_output(&mut self, id: u64) -> StoreResult<Option<AdvancedOutput>>;
    fn advanced_output_type(&mut self, id: u64) -> StoreResult<Option<OutputType>>;
    fn staked_sum_total(&mut self) -> StoreResult<u64>;
    fn interest_for(
        &mut self,
        params: &ChainParams,
        stake_height: u64,
        unstake_height: u64,
        token_amount: u64,
    ) -> StoreResult<u64>;
}

fn decode_opt<T: serde::de::DeserializeOwned>(
    value: Option<redb::AccessGuard<'_, &'static [u8]>>,
) -> StoreResult<Option<T>> {
    match value {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

impl LedgerRead for Tables<'_> {
    fn account(&mut self, username: &str) -> StoreResult<Option<AccountRecord>> {
        decode_opt(self.market_accounts.get(username)?)
    }

    fn offer(&mut self, offer_id: &[u8; 32]) -> StoreResult<Option<OfferRecord>> {
        decode_opt(self.market_offers.get(offer_id.as_slice())?)
    }

    fn feedback(&mut self, offer_id: &[u8; 32]) -> StoreResult<Option<FeedbackRecord>> {
        decode_opt(self.market_feedback.get(offer_id.as_slice())?)
    }

    fn price_peg(&mut self, peg_id: &[u8; 32]) -> StoreResult<Option<PricePegRecord>> {
        decode_opt(self.market_price_pegs.get(peg_id.as_slice())?)
    }

    fn advanced_output(&mut self, id: u64) -> StoreResult<Option<AdvancedOutput>> {
        decode_opt(self.output_advanced.get(&id)?)
    }

    fn advanced_output_type(&mut self, id: u64) -> StoreResult<Option<OutputType>> {
        Ok(self
            .output_advanced_type
            .get(&id)?
            .and_then(|v| OutputType::from_tag(v.value())))
    }

    fn staked_sum_total(&mut self) -> StoreResult<u64> {
        staking::staked_sum_total(&self.token_locked_sum_total)
    }

    fn interest_for(
        &mut self,
        params: &ChainParams,
        stake_height: u64,
        unstake_height: u64,
        token_amount: u64,
    ) -> StoreResult<u64> {
        staking::interest_earned(
            &self.token_locked_sum,
            &self.network_fee_sum,
            params,
            stake_height,
            unstake_height,
            token_amount,
        )
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn reject(status: ExecutionStatus) -> CommandError {
    CommandError::Rejected(status)
}

fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ACCOUNT_USERNAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

fn check_offer_pricing(
    price: u64,
    min_price: u64,
    price_peg_id: Option<&[u8; 32]>,
    price_peg_used: bool,
    view: &mut dyn LedgerRead,
) -> Result<(), CommandError> {
    if price < OFFER_MIN_PRICE {
        return Err(reject(ExecutionStatus::OfferPriceTooSmall));
    }
    if price > OFFER_MAX_PRICE {
        return Err(reject(ExecutionStatus::OfferPriceTooBig));
    }
    if price_peg_used {
        let peg_id = price_peg_id.ok_or(reject(ExecutionStatus::OfferPricePegNotExistent))?;
        if view.price_peg(peg_id)?.is_none() {
            return Err(reject(ExecutionStatus::OfferPricePegNotExistent));
        }
        if min_price > OFFER_MAX_PRICE {
            return Err(reject(ExecutionStatus::OfferPriceTooBig));
        }
    } else if price != min_price {
        // Without a peg there is nothing to float against.
        return Err(reject(ExecutionStatus::OfferPriceMismatch));
    }
    Ok(())
}

fn check_offer_sizes(title: &str, description: &[u8]) -> Result<(), CommandError> {
    if title.len() > MAX_OFFER_TITLE_LEN || description.len() > MAX_OFFER_DESCRIPTION_SIZE {
        return Err(reject(ExecutionStatus::OfferDataTooBig));
    }
    Ok(())
}

/// Check every rule a command must satisfy at `height`, without touching
/// anything. `Ok(())` means `execute` with the same arguments will not
/// be rejected.
pub fn validate(
    cmd: &Command,
    input: &ScriptInput<'_>,
    view: &mut dyn LedgerRead,
    params: &ChainParams,
    height: u64,
) -> Result<(), CommandError> {
    match cmd {
        Command::CreateAccount(c) => {
            if !valid_username(&c.username) {
                return Err(reject(ExecutionStatus::InvalidAccountName));
            }
            if c.data.len() > MAX_ACCOUNT_DATA_SIZE {
                return Err(reject(ExecutionStatus::AccountDataTooBig));
            }
            if view.account(&c.username)?.is_some() {
                return Err(reject(ExecutionStatus::AccountAlreadyExists));
            }
            if input.token_amount < ACCOUNT_TOKEN_LOCK {
                return Err(reject(ExecutionStatus::AccountTokenLockNotEnough));
            }
        }
        Command::EditAccount(c) => {
            if !valid_username(&c.username) {
                return Err(reject(ExecutionStatus::InvalidAccountName));
            }
            if c.data.len() > MAX_ACCOUNT_DATA_SIZE {
                return Err(reject(ExecutionStatus::AccountDataTooBig));
            }
            if view.account(&c.username)?.is_none() {
                return Err(reject(ExecutionStatus::AccountNonExistent));
            }
        }
        Command::StakeToken(c) => {
            if c.token_amount == 0 || c.token_amount % TOKEN_UNIT != 0 {
                return Err(reject(ExecutionStatus::StakeTokenNotWholeAmount));
            }
            if input.token_amount != c.token_amount {
                return Err(reject(ExecutionStatus::StakeTokenAmountNotMatching));
            }
        }
        Command::UnstakeToken(c) => {
            if input.key_offsets.len() != 1 {
                return Err(reject(ExecutionStatus::UnstakeTokenOffsetNotOne));
            }
            let stake_id = input.key_offsets[0];
            if view.advanced_output_type(stake_id)? != Some(OutputType::TokenStake) {
                return Err(reject(ExecutionStatus::UnstakeTokenOutputNotFound));
            }
            let stake = view
                .advanced_output(stake_id)?
                .ok_or(reject(ExecutionStatus::UnstakeTokenOutputNotFound))?;
            if stake.token_amount != c.token_amount || input.token_amount != c.token_amount {
                return Err(reject(ExecutionStatus::StakeTokenAmountNotMatching));
            }
            if height < stake.height + params.min_stake_period {
                return Err(reject(ExecutionStatus::UnstakeTokenMinimumPeriod));
            }
            // The input's cash amount is the interest being claimed; it
            // may not exceed what the fee pool actually yields.
            let earned = view.interest_for(params, stake.height, height, c.token_amount)?;
            if input.amount > earned {
                return Err(reject(ExecutionStatus::UnstakeTokenNetworkFeeNotMatching));
            }
        }
        Command::DonateNetworkFee(c) => {
            if c.amount == 0 || input.amount != c.amount {
                return Err(reject(ExecutionStatus::NetworkFeeDonationZero));
            }
        }
        Command::CreateOffer(c) => {
            if view.account(&c.seller)?.is_none() {
                return Err(reject(ExecutionStatus::AccountNonExistent));
            }
            if view.offer(&c.offer_id)?.is_some() {
                return Err(reject(ExecutionStatus::OfferAlreadyExists));
            }
            check_offer_sizes(&c.title, &c.description)?;
            check_offer_pricing(
                c.price,
                c.min_price,
                c.price_peg_id.as_ref(),
                c.price_peg_used,
                view,
            )?;
        }
        Command::EditOffer(c) => {
            let offer = view
                .offer(&c.offer_id)?
                .ok_or(reject(ExecutionStatus::OfferNonExistent))?;
            if offer.seller != c.seller {
                return Err(reject(ExecutionStatus::OfferNonExistent));
            }
            check_offer_sizes(&c.title, &c.description)?;
            check_offer_pricing(
                c.price,
                c.min_price,
                c.price_peg_id.as_ref(),
                c.price_peg_used,
                view,
            )?;
        }
        Command::Purchase(c) => {
            let offer = view
                .offer(&c.offer_id)?
                .ok_or(reject(ExecutionStatus::OfferNonExistent))?;
            if !offer.active {
                return Err(reject(ExecutionStatus::PurchaseOfferNotActive));
            }
            if c.quantity == 0 {
                return Err(reject(ExecutionStatus::PurchaseQuantityZero));
            }
            if c.quantity > offer.quantity {
                return Err(reject(ExecutionStatus::PurchaseOutOfStock));
            }
            let unit_price = effective_offer_price(&offer, view)?;
            let due = unit_price as u128 * c.quantity as u128;
            if (c.price_paid as u128) < due || input.amount < c.price_paid {
                return Err(reject(ExecutionStatus::PurchaseNotEnoughFunds));
            }
        }
        Command::Feedback(c) => {
            if view.offer(&c.offer_id)?.is_none() {
                return Err(reject(ExecutionStatus::OfferNonExistent));
            }
            if c.stars_given > MAX_FEEDBACK_STARS {
                return Err(reject(ExecutionStatus::FeedbackInvalidRating));
            }
            if c.comment.len() > MAX_FEEDBACK_COMMENT_SIZE {
                return Err(reject(ExecutionStatus::FeedbackDataTooBig));
            }
        }
        Command::CreatePricePeg(c) => {
            if view.account(&c.creator)?.is_none() {
                return Err(reject(ExecutionStatus::AccountNonExistent));
            }
            if view.price_peg(&c.price_peg_id)?.is_some() {
                return Err(reject(ExecutionStatus::PricePegAlreadyExists));
            }
            if c.rate == 0
                || c.title.len() > MAX_OFFER_TITLE_LEN
                || c.currency.len() > MAX_PRICE_PEG_CURRENCY_LEN
                || c.data.len() > MAX_PRICE_PEG_DATA_SIZE
            {
                return Err(reject(ExecutionStatus::PricePegDataInvalid));
            }
        }
        Command::UpdatePricePeg(c) => {
            if view.price_peg(&c.price_peg_id)?.is_none() {
                return Err(reject(ExecutionStatus::PricePegNonExistent));
            }
            if c.rate == 0 {
                return Err(reject(ExecutionStatus::PricePegDataInvalid));
            }
        }
    }
    Ok(())
}

/// Peg-aware per-unit price of an offer.
pub fn effective_offer_price(
    offer: &OfferRecord,
    view: &mut dyn LedgerRead,
) -> Result<u64, CommandError> {
    if !offer.price_peg_used {
        return Ok(offer.price);
    }
    let peg_id = offer
        .price_peg_id
        .as_ref()
        .ok_or(reject(ExecutionStatus::OfferPricePegNotExistent))?;
    let peg = view
        .price_peg(peg_id)?
        .ok_or(reject(ExecutionStatus::OfferPricePegNotExistent))?;
    Ok(offer.effective_price(Some(peg.rate)))
}

/// The fee pool's cut of one purchase.
pub fn purchase_network_fee(price_paid: u64) -> u64 {
    (price_paid as u128 * NETWORK_FEE_BPS as u128 / BPS_DENOMINATOR as u128) as u64
}

// ---------------------------------------------------------------------------
// Record IO on write tables
// ---------------------------------------------------------------------------

fn store_account(tables: &mut Tables<'_>, record: &AccountRecord) -> StoreResult<()> {
    let bytes = encode(record)?;
    tables
        .market_accounts
        .insert(record.username.as_str(), bytes.as_slice())?;
    Ok(())
}

fn store_offer(tables: &mut Tables<'_>, record: &OfferRecord) -> StoreResult<()> {
    let bytes = encode(record)?;
    tables
        .market_offers
        .insert(record.offer_id.as_slice(), bytes.as_slice())?;
    Ok(())
}

fn store_feedback(
    tables: &mut Tables<'_>,
    offer_id: &[u8; 32],
    record: &FeedbackRecord,
) -> StoreResult<()> {
    let bytes = encode(record)?;
    tables
        .market_feedback
        .insert(offer_id.as_slice(), bytes.as_slice())?;
    Ok(())
}

fn store_price_peg(tables: &mut Tables<'_>, record: &PricePegRecord) -> StoreResult<()> {
    let bytes = encode(record)?;
    tables
        .market_price_pegs
        .insert(record.peg_id.as_slice(), bytes.as_slice())?;
    Ok(())
}

fn require_account(tables: &mut Tables<'_>, username: &str) -> StoreResult<AccountRecord> {
    tables
        .account(username)?
        .ok_or_else(|| StoreError::NotFound(format!("account {username}")))
}

fn require_offer(tables: &mut Tables<'_>, offer_id: &[u8; 32]) -> StoreResult<OfferRecord> {
    tables
        .offer(offer_id)?
        .ok_or_else(|| StoreError::NotFound(format!("offer {}", hex::encode(offer_id))))
}

fn require_peg(tables: &mut Tables<'_>, peg_id: &[u8; 32]) -> StoreResult<PricePegRecord> {
    tables
        .price_peg(peg_id)?
        .ok_or_else(|| StoreError::NotFound(format!("price peg {}", hex::encode(peg_id))))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Apply `cmd` at `height`, anchored to advanced output `anchor_id`
/// (the matching-type script output of the same transaction, already
/// inserted). Re-validates first; all mutations happen in the caller's
/// write transaction.
pub fn execute(
    cmd: &Command,
    input: &ScriptInput<'_>,
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    anchor_id: u64,
) -> Result<ExecutionResult, CommandError> {
    validate(cmd, input, tables, params, height)?;

    let result = match cmd {
        Command::CreateAccount(c) => {
            store_account(
                tables,
                &AccountRecord {
                    username: c.username.clone(),
                    pubkey: c.pubkey,
                    data: c.data.clone(),
                    outputs: vec![anchor_id],
                },
            )?;
            ExecutionResult::AccountCreated {
                username: c.username.clone(),
            }
        }
        Command::EditAccount(c) => {
            let mut record = require_account(tables, &c.username)?;
            record.data = c.data.clone();
            record.outputs.push(anchor_id);
            store_account(tables, &record)?;
            ExecutionResult::AccountEdited {
                username: c.username.clone(),
            }
        }
        Command::StakeToken(c) => {
            staking::stake(tables, params, height, c.token_amount, anchor_id)?;
            ExecutionResult::TokenStaked {
                token_amount: c.token_amount,
                block_height: height,
            }
        }
        Command::UnstakeToken(c) => {
            let stake_id = input.key_offsets[0];
            let stake = tables
                .advanced_output(stake_id)?
                .ok_or_else(|| StoreError::NotFound(format!("staked output {stake_id}")))?;
            let interest =
                staking::unstake(tables, params, height, stake.height, c.token_amount, stake_id)?;
            ExecutionResult::TokenUnstaked {
                token_amount: c.token_amount,
                interest,
            }
        }
        Command::DonateNetworkFee(c) => {
            staking::collect_network_fee(tables, params, height, c.amount)?;
            ExecutionResult::NetworkFeeDonated { amount: c.amount }
        }
        Command::CreateOffer(c) => {
            store_offer(
                tables,
                &OfferRecord {
                    offer_id: c.offer_id,
                    seller: c.seller.clone(),
                    title: c.title.clone(),
                    description: c.description.clone(),
                    quantity: c.quantity,
                    price: c.price,
                    min_price: c.min_price,
                    price_peg_id: c.price_peg_id,
                    price_peg_used: c.price_peg_used,
                    active: true,
                    seller_pubkey: c.seller_pubkey,
                    outputs: vec![anchor_id],
                },
            )?;
            ExecutionResult::OfferCreated {
                offer_id: c.offer_id,
            }
        }
        Command::EditOffer(c) => {
            let mut record = require_offer(tables, &c.offer_id)?;
            record.title = c.title.clone();
            record.description = c.description.clone();
            record.price = c.price;
            record.min_price = c.min_price;
            record.quantity = c.quantity;
            record.price_peg_id = c.price_peg_id;
            record.price_peg_used = c.price_peg_used;
            record.active = c.active;
            record.outputs.push(anchor_id);
            store_offer(tables, &record)?;
            ExecutionResult::OfferEdited {
                offer_id: c.offer_id,
            }
        }
        Command::Purchase(c) => {
            let mut record = require_offer(tables, &c.offer_id)?;
            record.quantity = record.quantity.checked_sub(c.quantity).ok_or_else(|| {
                StoreError::Consistency("purchase exceeds validated stock".into())
            })?;
            record.outputs.push(anchor_id);
            store_offer(tables, &record)?;

            let fee = purchase_network_fee(c.price_paid);
            staking::collect_network_fee(tables, params, height, fee)?;
            ExecutionResult::Purchased {
                quantity_remaining: record.quantity,
                network_fee: fee,
            }
        }
        Command::Feedback(c) => {
            let mut record = tables.feedback(&c.offer_id)?.unwrap_or_default();
            record.entries.push(FeedbackEntry {
                stars: c.stars_given,
                comment: c.comment.clone(),
                output_id: anchor_id,
            });
            store_feedback(tables, &c.offer_id, &record)?;
            ExecutionResult::FeedbackGiven {
                offer_id: c.offer_id,
                stars_given: c.stars_given,
            }
        }
        Command::CreatePricePeg(c) => {
            store_price_peg(
                tables,
                &PricePegRecord {
                    peg_id: c.price_peg_id,
                    title: c.title.clone(),
                    creator: c.creator.clone(),
                    currency: c.currency.clone(),
                    rate: c.rate,
                    data: c.data.clone(),
                    outputs: vec![anchor_id],
                },
            )?;
            ExecutionResult::PricePegCreated {
                price_peg_id: c.price_peg_id,
            }
        }
        Command::UpdatePricePeg(c) => {
            let mut record = require_peg(tables, &c.price_peg_id)?;
            record.rate = c.rate;
            record.outputs.push(anchor_id);
            store_price_peg(tables, &record)?;
            ExecutionResult::PricePegUpdated {
                price_peg_id: c.price_peg_id,
                rate: c.rate,
            }
        }
    };

    debug!(command = %cmd.command_type(), height, "command executed");
    Ok(result)
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Parse the command payload an advanced output stored at creation.
fn stored_command(tables: &mut Tables<'_>, output_id: u64) -> StoreResult<Command> {
    let output = tables
        .advanced_output(output_id)?
        .ok_or_else(|| StoreError::NotFound(format!("advanced output {output_id}")))?;
    Command::parse(&output.data)
        .map_err(|e| StoreError::Consistency(format!("stored payload of output {output_id}: {e}")))
}

fn pop_history_entry(outputs: &mut Vec<u64>, anchor_id: u64) -> StoreResult<()> {
    match outputs.pop() {
        Some(id) if id == anchor_id => Ok(()),
        other => Err(StoreError::Consistency(format!(
            "history tail {other:?} does not match rolled-back output {anchor_id}"
        ))),
    }
}

/// Rebuild an account record from its surviving output history.
fn replay_account(tables: &mut Tables<'_>, outputs: &[u64]) -> StoreResult<AccountRecord> {
    let mut record: Option<AccountRecord> = None;
    for &id in outputs {
        match (stored_command(tables, id)?, &mut record) {
            (Command::CreateAccount(c), slot @ None) => {
                *slot = Some(AccountRecord {
                    username: c.username,
                    pubkey: c.pubkey,
                    data: c.data,
                    outputs: Vec::new(),
                });
            }
            (Command::EditAccount(c), Some(r)) => r.data = c.data,
            (cmd, _) => {
                return Err(StoreError::Consistency(format!(
                    "unexpected {} in account history",
                    cmd.command_type()
                )))
            }
        }
    }
    let mut record =
        record.ok_or_else(|| StoreError::Consistency("empty account history".into()))?;
    record.outputs = outputs.to_vec();
    Ok(record)
}

/// Rebuild an offer record from its surviving output history.
fn replay_offer(tables: &mut Tables<'_>, outputs: &[u64]) -> StoreResult<OfferRecord> {
    let mut record: Option<OfferRecord> = None;
    for &id in outputs {
        match (stored_command(tables, id)?, &mut record) {
            (Command::CreateOffer(c), slot @ None) => {
                *slot = Some(OfferRecord {
                    offer_id: c.offer_id,
                    seller: c.seller,
                    title: c.title,
                    description: c.description,
                    quantity: c.quantity,
                    price: c.price,
                    min_price: c.min_price,
                    price_peg_id: c.price_peg_id,
                    price_peg_used: c.price_peg_used,
                    active: true,
                    seller_pubkey: c.seller_pubkey,
                    outputs: Vec::new(),
                });
            }
            (Command::EditOffer(c), Some(r)) => {
                r.title = c.title;
                r.description = c.description;
                r.price = c.price;
                r.min_price = c.min_price;
                r.quantity = c.quantity;
                r.price_peg_id = c.price_peg_id;
                r.price_peg_used = c.price_peg_used;
                r.active = c.active;
            }
            (Command::Purchase(c), Some(r)) => {
                r.quantity = r.quantity.checked_sub(c.quantity).ok_or_else(|| {
                    StoreError::Consistency("offer history replays below zero stock".into())
                })?;
            }
            (cmd, _) => {
                return Err(StoreError::Consistency(format!(
                    "unexpected {} in offer history",
                    cmd.command_type()
                )))
            }
        }
    }
    let mut record = record.ok_or_else(|| StoreError::Consistency("empty offer history".into()))?;
    record.outputs = outputs.to_vec();
    Ok(record)
}

/// Rebuild a price peg record from its surviving output history.
fn replay_price_peg(tables: &mut Tables<'_>, outputs: &[u64]) -> StoreResult<PricePegRecord> {
    let mut record: Option<PricePegRecord> = None;
    for &id in outputs {
        match (stored_command(tables, id)?, &mut record) {
            (Command::CreatePricePeg(c), slot @ None) => {
                *slot = Some(PricePegRecord {
                    peg_id: c.price_peg_id,
                    title: c.title,
                    creator: c.creator,
                    currency: c.currency,
                    rate: c.rate,
                    data: c.data,
                    outputs: Vec::new(),
                });
            }
            (Command::UpdatePricePeg(c), Some(r)) => r.rate = c.rate,
            (cmd, _) => {
                return Err(StoreError::Consistency(format!(
                    "unexpected {} in price peg history",
                    cmd.command_type()
                )))
            }
        }
    }
    let mut record =
        record.ok_or_else(|| StoreError::Consistency("empty price peg history".into()))?;
    record.outputs = outputs.to_vec();
    Ok(record)
}

/// Undo `cmd`'s effects exactly. Called by `pop_block` with the same
/// arguments `execute` saw, in reverse transaction order.
pub fn rollback(
    cmd: &Command,
    input: &ScriptInput<'_>,
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    anchor_id: u64,
) -> StoreResult<()> {
    match cmd {
        Command::CreateAccount(c) => {
            tables.market_accounts.remove(c.username.as_str())?;
        }
        Command::EditAccount(c) => {
            let mut record = require_account(tables, &c.username)?;
            pop_history_entry(&mut record.outputs, anchor_id)?;
            let replayed = replay_account(tables, &record.outputs.clone())?;
            store_account(tables, &replayed)?;
        }
        Command::StakeToken(c) => {
            staking::rollback_stake(tables, params, height, c.token_amount, anchor_id)?;
        }
        Command::UnstakeToken(c) => {
            let stake_id = input.key_offsets.first().copied().ok_or_else(|| {
                StoreError::Consistency("unstake rollback without stake reference".into())
            })?;
            let stake = tables
                .advanced_output(stake_id)?
                .ok_or_else(|| StoreError::NotFound(format!("staked output {stake_id}")))?;
            staking::rollback_unstake(
                tables,
                params,
                height,
                stake.height,
                c.token_amount,
                stake_id,
            )?;
        }
        Command::DonateNetworkFee(c) => {
            staking::rollback_network_fee(tables, params, height, c.amount)?;
        }
        Command::CreateOffer(c) => {
            tables.market_offers.remove(c.offer_id.as_slice())?;
        }
        Command::EditOffer(c) => {
            let mut record = require_offer(tables, &c.offer_id)?;
            pop_history_entry(&mut record.outputs, anchor_id)?;
            let replayed = replay_offer(tables, &record.outputs.clone())?;
            store_offer(tables, &replayed)?;
        }
        Command::Purchase(c) => {
            let mut record = require_offer(tables, &c.offer_id)?;
            pop_history_entry(&mut record.outputs, anchor_id)?;
            let replayed = replay_offer(tables, &record.outputs.clone())?;
            store_offer(tables, &replayed)?;
            staking::rollback_network_fee(
                tables,
                params,
                height,
                purchase_network_fee(c.price_paid),
            )?;
        }
        Command::Feedback(c) => {
            let mut record = tables.feedback(&c.offer_id)?.ok_or_else(|| {
                StoreError::NotFound(format!("feedback for {}", hex::encode(c.offer_id)))
            })?;
            match record.entries.pop() {
                Some(entry) if entry.output_id == anchor_id => {}
                other => {
                    return Err(StoreError::Consistency(format!(
                        "feedback tail {other:?} does not match rolled-back output {anchor_id}"
                    )))
                }
            }
            if record.entries.is_empty() {
                tables.market_feedback.remove(c.offer_id.as_slice())?;
            } else {
                store_feedback(tables, &c.offer_id, &record)?;
            }
        }
        Command::CreatePricePeg(c) => {
            tables.market_price_pegs.remove(c.price_peg_id.as_slice())?;
        }
        Command::UpdatePricePeg(c) => {
            let mut record = require_peg(tables, &c.price_peg_id)?;
            pop_history_entry(&mut record.outputs, anchor_id)?;
            let replayed = replay_price_peg(tables, &record.outputs.clone())?;
            store_price_peg(tables, &replayed)?;
        }
    }

    debug!(command = %cmd.command_type(), height, "command rolled back");
    Ok(())
}
