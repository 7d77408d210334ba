//! End-to-end integration tests for the Agora ledger store.
//!
//! These tests exercise the full block lifecycle against a real on-disk
//! store: block append, command execution, staking interest accrual,
//! marketplace state transitions, and the add/pop symmetry guarantee.
//! Everything runs on regtest parameters, whose tiny staking windows let
//! a complete stake/earn/unstake cycle fit in a few dozen blocks.
//!
//! Each test stands alone with its own temporary database. No shared
//! state, no test ordering dependencies, no flaky failures.

use agora_ledger::chain::{Block, BlockHeader, OutputTarget, OutputType, Transaction, TxInput, TxOutput};
use agora_ledger::config::{ACCOUNT_TOKEN_LOCK, COIN, TOKEN_UNIT};
use agora_ledger::error::{CommandError, ExecutionStatus, StoreError};
use agora_ledger::market::command::{
    Command, CreateAccountCmd, CreateOfferCmd, CreatePricePegCmd, DonateNetworkFeeCmd,
    EditOfferCmd, FeedbackCmd, PurchaseCmd, StakeTokenCmd, UnstakeTokenCmd,
};
use agora_ledger::storage::AgoraDB;
use agora_ledger::NetworkType;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn open_db() -> (tempfile::TempDir, AgoraDB) {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = AgoraDB::open(dir.path(), NetworkType::Regtest).expect("open");
    (dir, db)
}

/// Builds the next block on the current chain tip.
fn next_block(db: &AgoraDB, txs: &[Transaction]) -> Block {
    let height = db.height().expect("height");
    let prev_hash = if height == 0 {
        [0u8; 32]
    } else {
        db.block_hash(height - 1).expect("hash").expect("tip hash")
    };
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            timestamp: 1_700_000_000 + height,
            nonce: height as u32,
        },
        tx_hashes: txs.iter().map(|tx| tx.hash()).collect(),
    }
}

fn add_block(db: &AgoraDB, txs: Vec<Transaction>) -> Result<u64, StoreError> {
    let block = next_block(db, &txs);
    db.add_block(&block, &txs, 1000, db.height()?.wrapping_add(1), 0, 0)
}

fn add_empty_blocks(db: &AgoraDB, count: u64) {
    for _ in 0..count {
        add_block(db, vec![]).expect("empty block");
    }
}

/// A transaction carrying exactly one command: a script input with the
/// serialized command, plus a script output of the anchoring type whose
/// data blob is the same command bytes (that blob is what rollback
/// replays).
fn command_tx(
    key_image_seed: u8,
    cmd: &Command,
    amount: u64,
    token_amount: u64,
    key_offsets: Vec<u64>,
    output_type: OutputType,
) -> Transaction {
    let script = cmd.serialize().expect("serialize command");
    Transaction {
        version: 1,
        unlock_time: 0,
        inputs: vec![TxInput::Script {
            amount,
            token_amount,
            key_offsets,
            key_image: [key_image_seed; 32],
            script: script.clone(),
        }],
        outputs: vec![TxOutput {
            amount: 0,
            token_amount,
            target: OutputTarget::Script {
                key: [key_image_seed; 32],
                output_type,
                data: script,
            },
        }],
    }
}

fn create_account_tx(seed: u8, username: &str) -> Transaction {
    command_tx(
        seed,
        &Command::CreateAccount(CreateAccountCmd {
            username: username.into(),
            pubkey: [seed; 32],
            data: b"profile".to_vec(),
        }),
        0,
        ACCOUNT_TOKEN_LOCK,
        vec![],
        OutputType::Account,
    )
}

fn create_offer_tx(seed: u8, offer_id: [u8; 32], quantity: u64, price: u64) -> Transaction {
    command_tx(
        seed,
        &Command::CreateOffer(CreateOfferCmd {
            offer_id,
            seller: "alice".into(),
            title: "Apple".into(),
            description: b"crisp and red".to_vec(),
            price,
            min_price: price,
            quantity,
            price_peg_id: None,
            price_peg_used: false,
            seller_pubkey: [1u8; 32],
        }),
        0,
        0,
        vec![],
        OutputType::Offer,
    )
}

fn purchase_tx(seed: u8, offer_id: [u8; 32], quantity: u64, price_paid: u64) -> Transaction {
    command_tx(
        seed,
        &Command::Purchase(PurchaseCmd {
            offer_id,
            quantity,
            price_paid,
        }),
        price_paid,
        0,
        vec![],
        OutputType::Purchase,
    )
}

fn stake_tx(seed: u8, token_amount: u64) -> Transaction {
    command_tx(
        seed,
        &Command::StakeToken(StakeTokenCmd {
            pubkey: [seed; 32],
            token_amount,
        }),
        0,
        token_amount,
        vec![],
        OutputType::TokenStake,
    )
}

fn unstake_tx(seed: u8, stake_id: u64, token_amount: u64, interest_claim: u64) -> Transaction {
    let script = Command::UnstakeToken(UnstakeTokenCmd { token_amount })
        .serialize()
        .expect("serialize");
    Transaction {
        version: 1,
        unlock_time: 0,
        inputs: vec![TxInput::Script {
            amount: interest_claim,
            token_amount,
            key_offsets: vec![stake_id],
            key_image: [seed; 32],
            script,
        }],
        // Unstaking returns plain tokens plus the interest as cash; no
        // advanced output needed.
        outputs: vec![
            TxOutput {
                amount: 0,
                token_amount,
                target: OutputTarget::TokenKey { key: [seed; 32] },
            },
            TxOutput {
                amount: interest_claim,
                token_amount: 0,
                target: OutputTarget::Key { key: [seed; 32] },
            },
        ],
    }
}

fn donate_tx(seed: u8, amount: u64) -> Transaction {
    command_tx(
        seed,
        &Command::DonateNetworkFee(DonateNetworkFeeCmd { amount }),
        amount,
        0,
        vec![],
        OutputType::NetworkFee,
    )
}

/// Everything the public query surface can tell us about the store, for
/// before/after comparisons around add/pop cycles.
#[derive(Debug, PartialEq)]
struct Snapshot {
    height: u64,
    tx_count: u64,
    advanced_outputs: u64,
    staked_total: u64,
    staked_by_interval: Vec<u64>,
    fees_by_interval: Vec<u64>,
    account: Option<agora_ledger::market::AccountRecord>,
    offer: Option<agora_ledger::market::OfferRecord>,
    feedback: Option<agora_ledger::market::FeedbackRecord>,
    peg: Option<agora_ledger::market::PricePegRecord>,
}

fn snapshot(db: &AgoraDB, offer_id: &[u8; 32], peg_id: &[u8; 32]) -> Snapshot {
    Snapshot {
        height: db.height().unwrap(),
        tx_count: db.tx_count().unwrap(),
        advanced_outputs: db.num_advanced_outputs().unwrap(),
        staked_total: db.current_staked_token_sum().unwrap(),
        staked_by_interval: (0..8)
            .map(|i| db.staked_token_sum_for_interval(i).unwrap())
            .collect(),
        fees_by_interval: (0..8)
            .map(|i| db.network_fee_sum_for_interval(i).unwrap())
            .collect(),
        account: db.account("alice").unwrap(),
        offer: db.offer(offer_id).unwrap(),
        feedback: db.feedback(offer_id).unwrap(),
        peg: db.price_peg(peg_id).unwrap(),
    }
}

fn rejection(err: StoreError) -> Option<ExecutionStatus> {
    match err {
        StoreError::Command(CommandError::Rejected(status)) => Some(status),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Marketplace lifecycle
// ---------------------------------------------------------------------------

#[test]
fn marketplace_end_to_end() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];

    add_block(&db, vec![]).unwrap(); // genesis
    add_block(&db, vec![create_account_tx(10, "alice")]).unwrap();
    assert_eq!(db.account_key("alice").unwrap(), Some([10u8; 32]));
    assert_eq!(db.account_data("alice").unwrap(), Some(b"profile".to_vec()));

    add_block(&db, vec![create_offer_tx(11, offer_id, 10, 5 * COIN)]).unwrap();
    assert_eq!(db.offer_quantity(&offer_id).unwrap(), Some(10));
    assert_eq!(db.offer_active(&offer_id).unwrap(), Some(true));
    assert_eq!(db.offer_price(&offer_id).unwrap(), Some(5 * COIN));
    assert_eq!(db.offer_seller(&offer_id).unwrap(), Some("alice".into()));

    // Two units for 10 AGC; 5% lands in the fee pool.
    add_block(&db, vec![purchase_tx(12, offer_id, 2, 10 * COIN)]).unwrap();
    assert_eq!(db.offer_quantity(&offer_id).unwrap(), Some(8));
    let interval = db.params().interval_for(db.height().unwrap() - 1);
    assert_eq!(
        db.network_fee_sum_for_interval(interval).unwrap(),
        COIN / 2
    );

    add_block(
        &db,
        vec![command_tx(
            13,
            &Command::Feedback(FeedbackCmd {
                offer_id,
                stars_given: 3,
                comment: b"as crisp as advertised".to_vec(),
            }),
            0,
            0,
            vec![],
            OutputType::Feedback,
        )],
    )
    .unwrap();
    let feedback = db.feedback(&offer_id).unwrap().unwrap();
    assert_eq!(feedback.stars(), (3, 1));

    // Seller closes the offer; purchases stop.
    add_block(
        &db,
        vec![command_tx(
            14,
            &Command::EditOffer(EditOfferCmd {
                offer_id,
                seller: "alice".into(),
                title: "Apple".into(),
                description: b"crisp and red".to_vec(),
                price: 5 * COIN,
                min_price: 5 * COIN,
                quantity: 8,
                price_peg_id: None,
                price_peg_used: false,
                active: false,
            }),
            0,
            0,
            vec![],
            OutputType::Offer,
        )],
    )
    .unwrap();
    assert_eq!(db.offer_active(&offer_id).unwrap(), Some(false));

    let err = add_block(&db, vec![purchase_tx(15, offer_id, 1, 5 * COIN)]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::PurchaseOfferNotActive));
}

#[test]
fn marketplace_rejections_leave_no_trace() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];
    add_block(&db, vec![]).unwrap();
    add_block(&db, vec![create_account_tx(10, "alice")]).unwrap();
    add_block(&db, vec![create_offer_tx(11, offer_id, 3, 5 * COIN)]).unwrap();
    let height_before = db.height().unwrap();

    // Out of stock.
    let err = add_block(&db, vec![purchase_tx(20, offer_id, 4, 100 * COIN)]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::PurchaseOutOfStock));

    // Rating above the 0..=3 scale.
    let err = add_block(
        &db,
        vec![command_tx(
            21,
            &Command::Feedback(FeedbackCmd {
                offer_id,
                stars_given: 4,
                comment: vec![],
            }),
            0,
            0,
            vec![],
            OutputType::Feedback,
        )],
    )
    .unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::FeedbackInvalidRating));

    // A command with no anchoring output in its transaction.
    let mut orphan = purchase_tx(22, offer_id, 1, 5 * COIN);
    orphan.outputs.clear();
    let err = add_block(&db, vec![orphan]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::MissingScriptOutput));

    assert_eq!(db.height().unwrap(), height_before);
    assert_eq!(db.offer_quantity(&offer_id).unwrap(), Some(3));
    assert!(db.feedback(&offer_id).unwrap().is_none());
}

#[test]
fn pegged_offer_price_follows_the_peg() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];
    let peg_id = [9u8; 32];
    add_block(&db, vec![]).unwrap();
    add_block(&db, vec![create_account_tx(10, "alice")]).unwrap();
    add_block(
        &db,
        vec![command_tx(
            11,
            &Command::CreatePricePeg(CreatePricePegCmd {
                price_peg_id: peg_id,
                title: "usd".into(),
                creator: "alice".into(),
                currency: "USD".into(),
                rate: 2 * COIN,
                data: vec![],
            }),
            0,
            0,
            vec![],
            OutputType::PricePeg,
        )],
    )
    .unwrap();
    assert_eq!(db.price_peg_rate(&peg_id).unwrap(), Some(2 * COIN));

    add_block(
        &db,
        vec![command_tx(
            12,
            &Command::CreateOffer(CreateOfferCmd {
                offer_id,
                seller: "alice".into(),
                title: "Apple".into(),
                description: vec![],
                price: 3, // 3 USD
                min_price: COIN,
                quantity: 5,
                price_peg_id: Some(peg_id),
                price_peg_used: true,
                seller_pubkey: [10u8; 32],
            }),
            0,
            0,
            vec![],
            OutputType::Offer,
        )],
    )
    .unwrap();
    // 3 USD at 2 AGC/USD.
    assert_eq!(db.offer_price(&offer_id).unwrap(), Some(6 * COIN));
}

// ---------------------------------------------------------------------------
// Staking lifecycle
// ---------------------------------------------------------------------------

#[test]
fn staking_full_cycle_with_interest() {
    let (_dir, db) = open_db();
    add_block(&db, vec![]).unwrap(); // genesis, height 0

    // Stake 100 AGT in the block at height 1 (interval 0).
    add_block(&db, vec![stake_tx(30, 100 * TOKEN_UNIT)]).unwrap();
    let stake_id = db.num_advanced_outputs().unwrap() - 1;
    assert_eq!(db.current_staked_token_sum().unwrap(), 100 * TOKEN_UNIT);
    assert_eq!(db.staked_token_sum_for_interval(0).unwrap(), 0);
    assert_eq!(
        db.staked_token_sum_for_interval(1).unwrap(),
        100 * TOKEN_UNIT
    );
    let expiry = 1 + db.params().token_lock_period;
    assert_eq!(db.token_stake_expiry_outputs(expiry).unwrap(), vec![stake_id]);

    // Donations land in intervals 1 and 2 (heights 12 and 22).
    add_empty_blocks(&db, 10); // heights 2..=11
    add_block(&db, vec![donate_tx(31, 1000)]).unwrap(); // height 12
    add_empty_blocks(&db, 9); // 13..=21
    add_block(&db, vec![donate_tx(32, 1000)]).unwrap(); // height 22
    assert_eq!(db.network_fee_sum_for_interval(1).unwrap(), 1000);
    assert_eq!(db.network_fee_sum_for_interval(2).unwrap(), 1000);

    // Advance to height 40 (interval 4): stake is mature and earned the
    // full pools of intervals 1 and 2 as sole staker.
    add_empty_blocks(&db, 17); // heights 23..=39
    assert_eq!(db.height().unwrap(), 40);

    // The public pre-check agrees with what a block would do.
    let claim_too_much = unstake_tx(33, stake_id, 100 * TOKEN_UNIT, 2001);
    let err = db.validate_command(&claim_too_much.inputs[0]).unwrap_err();
    assert_eq!(
        err.status(),
        Some(ExecutionStatus::UnstakeTokenNetworkFeeNotMatching)
    );

    let fair_claim = unstake_tx(33, stake_id, 100 * TOKEN_UNIT, 2000);
    db.validate_command(&fair_claim.inputs[0]).unwrap();
    add_block(&db, vec![fair_claim]).unwrap();

    assert_eq!(db.current_staked_token_sum().unwrap(), 0);
    assert_eq!(db.staked_token_sum_for_interval(4).unwrap(), 0);
    assert_eq!(
        db.staked_token_sum_for_interval(3).unwrap(),
        100 * TOKEN_UNIT
    );
    assert!(db.token_stake_expiry_outputs(expiry).unwrap().is_empty());
}

#[test]
fn staking_boundary_rejections() {
    let (_dir, db) = open_db();
    add_block(&db, vec![]).unwrap();

    // 8000 atomic units is dust, not a whole token.
    let err = add_block(&db, vec![stake_tx(30, 8000)]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::StakeTokenNotWholeAmount));

    add_block(&db, vec![stake_tx(30, 100 * TOKEN_UNIT)]).unwrap();
    let stake_id = db.num_advanced_outputs().unwrap() - 1;

    // Regtest minimum stake period is 30 blocks; height 2 is far too early.
    let err = add_block(&db, vec![unstake_tx(31, stake_id, 100 * TOKEN_UNIT, 0)]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::UnstakeTokenMinimumPeriod));

    // A stake reference that points at nothing.
    add_empty_blocks(&db, 38);
    let err = add_block(&db, vec![unstake_tx(32, 999, 100 * TOKEN_UNIT, 0)]).unwrap_err();
    assert_eq!(rejection(err), Some(ExecutionStatus::UnstakeTokenOutputNotFound));

    // The chain is untouched by any of it.
    assert_eq!(db.current_staked_token_sum().unwrap(), 100 * TOKEN_UNIT);
}

// ---------------------------------------------------------------------------
// Add/pop symmetry
// ---------------------------------------------------------------------------

#[test]
fn pop_restores_marketplace_and_staking_state() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];
    let peg_id = [9u8; 32];

    add_block(&db, vec![]).unwrap();
    add_block(&db, vec![create_account_tx(10, "alice")]).unwrap();
    add_block(&db, vec![create_offer_tx(11, offer_id, 10, 5 * COIN)]).unwrap();
    add_block(&db, vec![stake_tx(12, 100 * TOKEN_UNIT)]).unwrap();
    let before = snapshot(&db, &offer_id, &peg_id);

    // A burst of activity...
    add_block(&db, vec![purchase_tx(20, offer_id, 2, 10 * COIN)]).unwrap();
    add_block(
        &db,
        vec![command_tx(
            21,
            &Command::Feedback(FeedbackCmd {
                offer_id,
                stars_given: 2,
                comment: b"fine".to_vec(),
            }),
            0,
            0,
            vec![],
            OutputType::Feedback,
        )],
    )
    .unwrap();
    add_block(&db, vec![stake_tx(22, 50 * TOKEN_UNIT), donate_tx(23, 777)]).unwrap();
    assert_ne!(snapshot(&db, &offer_id, &peg_id), before);

    // ...and exactly that much retreat.
    db.pop_block().unwrap();
    db.pop_block().unwrap();
    db.pop_block().unwrap();
    assert_eq!(snapshot(&db, &offer_id, &peg_id), before);
}

#[test]
fn pop_unwinds_multi_tx_blocks_in_order() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];

    add_block(&db, vec![]).unwrap();
    // Account, offer, and purchase all in one block: three transactions
    // whose effects depend on each other in order.
    add_block(
        &db,
        vec![
            create_account_tx(10, "alice"),
            create_offer_tx(11, offer_id, 10, 5 * COIN),
            purchase_tx(12, offer_id, 3, 15 * COIN),
        ],
    )
    .unwrap();
    assert_eq!(db.offer_quantity(&offer_id).unwrap(), Some(7));

    let (block, txs) = db.pop_block().unwrap();
    assert_eq!(txs.len(), 3);
    assert_eq!(block.tx_hashes.len(), 3);
    assert!(db.account("alice").unwrap().is_none());
    assert!(db.offer(&offer_id).unwrap().is_none());
    assert_eq!(db.num_advanced_outputs().unwrap(), 0);
    assert_eq!(db.tx_count().unwrap(), 0);
    assert_eq!(db.height().unwrap(), 1);
}

#[test]
fn popped_transactions_can_be_reapplied() {
    let (_dir, db) = open_db();
    let offer_id = [2u8; 32];

    add_block(&db, vec![]).unwrap();
    add_block(&db, vec![create_account_tx(10, "alice")]).unwrap();
    add_block(&db, vec![create_offer_tx(11, offer_id, 10, 5 * COIN)]).unwrap();

    let (_, txs) = db.pop_block().unwrap();
    assert!(db.offer(&offer_id).unwrap().is_none());

    // The popped transactions go back to the mempool and come straight
    // back in the next block.
    add_block(&db, txs).unwrap();
    assert_eq!(db.offer_quantity(&offer_id).unwrap(), Some(10));
}
