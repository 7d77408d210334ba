//! # Interval Staking Accounting
//!
//! Token stakes earn a share of the network fee pool, accounted per
//! *interval* (a fixed run of blocks, see
//! [`ChainParams::interval_length`]). Two interval-keyed tables carry the
//! whole scheme:
//!
//! - `token_locked_sum`: tokens staked per interval, **sparsely
//!   materialized** — a bucket exists only for intervals where the staked
//!   sum changed; the effective value at interval `n` is the nearest
//!   bucket at or below `n`. A cached running total lives in the
//!   `token_locked_sum_total` singleton.
//! - `network_fee_sum`: fees collected per interval, exact buckets.
//!
//! A stake made in interval `I` starts counting at `I + 1` (partial
//! intervals never earn). An unstake in interval `J` stops counting at
//! `J - 1`. Interest is the stake's whole-token share of each fully
//! staked interval's fee pool, integer math throughout.
//!
//! Every forward operation has an exact inverse here; `pop_block` relies
//! on them restoring byte-identical table state, including deleting any
//! bucket the forward operation alone materialized.

use redb::{MultimapTable, ReadableTable, Table};

use crate::config::{ChainParams, TOKEN_UNIT};
use crate::error::{StoreError, StoreResult};
use crate::storage::schema::Tables;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Effective staked sum at `interval`: the nearest materialized bucket at
/// or below it, 0 before the first stake.
pub fn staked_sum_for_interval(
    table: &impl ReadableTable<u64, u64>,
    interval: u64,
) -> StoreResult<u64> {
    let mut range = table.range(..=interval)?;
    Ok(match range.next_back() {
        Some(entry) => entry?.1.value(),
        None => 0,
    })
}

/// Fees collected during exactly `interval`, 0 when none were.
pub fn fee_sum_for_interval(
    table: &impl ReadableTable<u64, u64>,
    interval: u64,
) -> StoreResult<u64> {
    Ok(table.get(&interval)?.map(|v| v.value()).unwrap_or(0))
}

/// The cached running total of staked tokens, in atomic units.
pub fn staked_sum_total(table: &impl ReadableTable<(), u64>) -> StoreResult<u64> {
    Ok(table.get(&())?.map(|v| v.value()).unwrap_or(0))
}

/// Interest a stake of `token_amount` placed at `stake_height` has earned
/// by `unstake_height`.
///
/// Only intervals strictly between the stake's and the unstake's count:
/// for each such interval, the stake's whole-token share of that
/// interval's fee pool. Intervals with nothing staked (impossible while
/// this stake is live, but guarded anyway) contribute nothing.
pub fn interest_earned(
    locked: &impl ReadableTable<u64, u64>,
    fees: &impl ReadableTable<u64, u64>,
    params: &ChainParams,
    stake_height: u64,
    unstake_height: u64,
    token_amount: u64,
) -> StoreResult<u64> {
    let first = params.interval_for(stake_height) + 1;
    let last_excl = params.interval_for(unstake_height);
    let whole_tokens = token_amount / TOKEN_UNIT;
    if whole_tokens == 0 || first >= last_excl {
        return Ok(0);
    }

    let mut interest: u64 = 0;
    for interval in first..last_excl {
        let pool = fee_sum_for_interval(fees, interval)?;
        if pool == 0 {
            continue;
        }
        let staked_whole = staked_sum_for_interval(locked, interval)? / TOKEN_UNIT;
        if staked_whole == 0 {
            continue;
        }
        let share = (pool as u128 * whole_tokens as u128 / staked_whole as u128) as u64;
        interest = interest
            .checked_add(share)
            .ok_or_else(|| StoreError::Consistency("interest sum overflow".into()))?;
    }
    Ok(interest)
}

// ---------------------------------------------------------------------------
// Bucket plumbing
// ---------------------------------------------------------------------------

/// Add `delta` to every materialized bucket with key >= `from`.
fn shift_buckets(table: &mut Table<u64, u64>, from: u64, delta: i64) -> StoreResult<()> {
    let touched: Vec<(u64, u64)> = {
        let mut out = Vec::new();
        for entry in table.range(from..)? {
            let (k, v) = entry?;
            out.push((k.value(), v.value()));
        }
        out
    };
    for (interval, value) in touched {
        let updated = if delta >= 0 {
            value
                .checked_add(delta as u64)
                .ok_or_else(|| StoreError::Consistency("staked sum overflow".into()))?
        } else {
            value
                .checked_sub(delta.unsigned_abs())
                .ok_or_else(|| StoreError::Consistency("staked sum underflow".into()))?
        };
        table.insert(interval, updated)?;
    }
    Ok(())
}

/// Materialize a bucket at `interval` if one is not already there,
/// seeding it from the effective value just below. Returns the bucket's
/// value after the call.
fn materialize_bucket(table: &mut Table<u64, u64>, interval: u64) -> StoreResult<u64> {
    if let Some(existing) = table.get(&interval)? {
        return Ok(existing.value());
    }
    let seed = if interval == 0 {
        0
    } else {
        staked_sum_for_interval(table, interval - 1)?
    };
    table.insert(interval, seed)?;
    Ok(seed)
}

/// Drop the bucket at `interval` when it no longer encodes a change,
/// i.e. when its value equals the effective value just below it. Keeps
/// the "buckets exist only where the sum changed" invariant exact across
/// rollback.
fn prune_redundant_bucket(table: &mut Table<u64, u64>, interval: u64) -> StoreResult<()> {
    let value = match table.get(&interval)? {
        Some(v) => v.value(),
        None => return Ok(()),
    };
    let below = if interval == 0 {
        0
    } else {
        staked_sum_for_interval(table, interval - 1)?
    };
    if value == below {
        table.remove(&interval)?;
    }
    Ok(())
}

fn adjust_total(table: &mut Table<(), u64>, delta: i64) -> StoreResult<()> {
    let current = staked_sum_total(table)?;
    let updated = if delta >= 0 {
        current
            .checked_add(delta as u64)
            .ok_or_else(|| StoreError::Consistency("staked total overflow".into()))?
    } else {
        current
            .checked_sub(delta.unsigned_abs())
            .ok_or_else(|| StoreError::Consistency("staked total underflow".into()))?
    };
    table.insert((), updated)?;
    Ok(())
}

fn to_delta(amount: u64) -> StoreResult<i64> {
    i64::try_from(amount).map_err(|_| StoreError::Consistency("stake amount exceeds i64".into()))
}

fn remove_expiry(
    table: &mut MultimapTable<u64, u64>,
    expiry_height: u64,
    output_id: u64,
) -> StoreResult<()> {
    if !table.remove(expiry_height, output_id)? {
        return Err(StoreError::Consistency(format!(
            "expiry index missing output {output_id} at height {expiry_height}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Forward operations
// ---------------------------------------------------------------------------

/// Record a stake of `token_amount` made at `height` by advanced output
/// `output_id`. Effective from the next interval; the running total
/// moves immediately; the lock's expiry is indexed for the wallet-facing
/// expiry query.
pub fn stake(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    token_amount: u64,
    output_id: u64,
) -> StoreResult<()> {
    let effective_from = params.interval_for(height) + 1;
    let delta = to_delta(token_amount)?;

    adjust_total(&mut tables.token_locked_sum_total, delta)?;
    materialize_bucket(&mut tables.token_locked_sum, effective_from)?;
    shift_buckets(&mut tables.token_locked_sum, effective_from, delta)?;
    tables
        .token_lock_expiry
        .insert(height + params.token_lock_period, output_id)?;
    Ok(())
}

/// Exact inverse of [`stake`].
pub fn rollback_stake(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    token_amount: u64,
    output_id: u64,
) -> StoreResult<()> {
    let effective_from = params.interval_for(height) + 1;
    let delta = to_delta(token_amount)?;

    adjust_total(&mut tables.token_locked_sum_total, -delta)?;
    shift_buckets(&mut tables.token_locked_sum, effective_from, -delta)?;
    prune_redundant_bucket(&mut tables.token_locked_sum, effective_from)?;
    remove_expiry(
        &mut tables.token_lock_expiry,
        height + params.token_lock_period,
        output_id,
    )?;
    Ok(())
}

/// Release a stake of `token_amount` placed at `stake_height`, at
/// `unstake_height`. Returns the interest earned, computed *before* the
/// sums move. The releasing interval itself stops earning.
pub fn unstake(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    unstake_height: u64,
    stake_height: u64,
    token_amount: u64,
    output_id: u64,
) -> StoreResult<u64> {
    let interest = interest_earned(
        &tables.token_locked_sum,
        &tables.network_fee_sum,
        params,
        stake_height,
        unstake_height,
        token_amount,
    )?;

    let effective_from = params.interval_for(unstake_height);
    let delta = to_delta(token_amount)?;

    adjust_total(&mut tables.token_locked_sum_total, -delta)?;
    materialize_bucket(&mut tables.token_locked_sum, effective_from)?;
    shift_buckets(&mut tables.token_locked_sum, effective_from, -delta)?;
    remove_expiry(
        &mut tables.token_lock_expiry,
        stake_height + params.token_lock_period,
        output_id,
    )?;
    Ok(interest)
}

/// Exact inverse of [`unstake`].
pub fn rollback_unstake(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    unstake_height: u64,
    stake_height: u64,
    token_amount: u64,
    output_id: u64,
) -> StoreResult<()> {
    let effective_from = params.interval_for(unstake_height);
    let delta = to_delta(token_amount)?;

    adjust_total(&mut tables.token_locked_sum_total, delta)?;
    shift_buckets(&mut tables.token_locked_sum, effective_from, delta)?;
    prune_redundant_bucket(&mut tables.token_locked_sum, effective_from)?;
    tables
        .token_lock_expiry
        .insert(stake_height + params.token_lock_period, output_id)?;
    Ok(())
}

/// Add `amount` of cash to the fee pool of `height`'s interval. Covers
/// both the 5% purchase cut and voluntary donations.
pub fn collect_network_fee(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    amount: u64,
) -> StoreResult<()> {
    let interval = params.interval_for(height);
    let current = fee_sum_for_interval(&tables.network_fee_sum, interval)?;
    let updated = current
        .checked_add(amount)
        .ok_or_else(|| StoreError::Consistency("network fee sum overflow".into()))?;
    tables.network_fee_sum.insert(interval, updated)?;
    Ok(())
}

/// Exact inverse of [`collect_network_fee`]; drops the bucket when it
/// reaches zero so rollback restores the exact table state.
pub fn rollback_network_fee(
    tables: &mut Tables<'_>,
    params: &ChainParams,
    height: u64,
    amount: u64,
) -> StoreResult<()> {
    let interval = params.interval_for(height);
    let current = fee_sum_for_interval(&tables.network_fee_sum, interval)?;
    let updated = current
        .checked_sub(amount)
        .ok_or_else(|| StoreError::Consistency("network fee sum underflow".into()))?;
    if updated == 0 {
        tables.network_fee_sum.remove(&interval)?;
    } else {
        tables.network_fee_sum.insert(interval, updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkType;
    use redb::{Database, ReadableMultimapTable};

    fn regtest() -> ChainParams {
        ChainParams::for_network(NetworkType::Regtest)
    }

    fn with_tables<T>(f: impl FnOnce(&mut Tables<'_>, &ChainParams) -> T) -> T {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("staking_test.redb")).unwrap();
        let txn = db.begin_write().unwrap();
        let result = {
            let mut tables = Tables::open(&txn).unwrap();
            f(&mut tables, &regtest())
        };
        txn.commit().unwrap();
        result
    }

    fn snapshot(tables: &Tables<'_>) -> (Vec<(u64, u64)>, Vec<(u64, u64)>, u64) {
        let locked: Vec<(u64, u64)> = tables
            .token_locked_sum
            .range(0..)
            .unwrap()
            .map(|e| {
                let (k, v) = e.unwrap();
                (k.value(), v.value())
            })
            .collect();
        let fees: Vec<(u64, u64)> = tables
            .network_fee_sum
            .range(0..)
            .unwrap()
            .map(|e| {
                let (k, v) = e.unwrap();
                (k.value(), v.value())
            })
            .collect();
        let total = staked_sum_total(&tables.token_locked_sum_total).unwrap();
        (locked, fees, total)
    }

    #[test]
    fn stake_becomes_effective_next_interval() {
        with_tables(|tables, params| {
            // Regtest interval length is 10; height 5 is interval 0.
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();

            assert_eq!(staked_sum_total(&tables.token_locked_sum_total).unwrap(), 100 * TOKEN_UNIT);
            assert_eq!(staked_sum_for_interval(&tables.token_locked_sum, 0).unwrap(), 0);
            assert_eq!(
                staked_sum_for_interval(&tables.token_locked_sum, 1).unwrap(),
                100 * TOKEN_UNIT
            );
            // Sparse: interval 7 reads through to the last bucket.
            assert_eq!(
                staked_sum_for_interval(&tables.token_locked_sum, 7).unwrap(),
                100 * TOKEN_UNIT
            );
        });
    }

    #[test]
    fn stacked_stakes_accumulate() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            stake(tables, params, 25, 50 * TOKEN_UNIT, 1).unwrap();

            assert_eq!(
                staked_sum_for_interval(&tables.token_locked_sum, 1).unwrap(),
                100 * TOKEN_UNIT
            );
            assert_eq!(
                staked_sum_for_interval(&tables.token_locked_sum, 3).unwrap(),
                150 * TOKEN_UNIT
            );
            assert_eq!(
                staked_sum_total(&tables.token_locked_sum_total).unwrap(),
                150 * TOKEN_UNIT
            );
        });
    }

    #[test]
    fn interest_covers_only_whole_intervals() {
        with_tables(|tables, params| {
            // Stake at interval 0; fees land in intervals 0..=3.
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            for interval in 0u64..4 {
                collect_network_fee(tables, params, interval * 10 + 1, 1000).unwrap();
            }

            // Unstake in interval 3: only intervals 1 and 2 earn.
            let interest = interest_earned(
                &tables.token_locked_sum,
                &tables.network_fee_sum,
                params,
                5,
                35,
                100 * TOKEN_UNIT,
            )
            .unwrap();
            assert_eq!(interest, 2000);

            // Same window, half the stake staked by someone else.
            stake(tables, params, 5, 100 * TOKEN_UNIT, 1).unwrap();
            let interest = interest_earned(
                &tables.token_locked_sum,
                &tables.network_fee_sum,
                params,
                5,
                35,
                100 * TOKEN_UNIT,
            )
            .unwrap();
            assert_eq!(interest, 1000);
        });
    }

    #[test]
    fn interest_is_zero_without_a_full_interval() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            collect_network_fee(tables, params, 12, 1000).unwrap();
            // Unstake in interval 1: no interval lies strictly between.
            let interest = interest_earned(
                &tables.token_locked_sum,
                &tables.network_fee_sum,
                params,
                5,
                15,
                100 * TOKEN_UNIT,
            )
            .unwrap();
            assert_eq!(interest, 0);
        });
    }

    #[test]
    fn unstake_stops_earning_in_its_own_interval() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            let interest = unstake(tables, params, 35, 5, 100 * TOKEN_UNIT, 0).unwrap();
            assert_eq!(interest, 0); // no fees collected

            assert_eq!(staked_sum_total(&tables.token_locked_sum_total).unwrap(), 0);
            // Effective from the unstake's own interval.
            assert_eq!(staked_sum_for_interval(&tables.token_locked_sum, 3).unwrap(), 0);
            assert_eq!(
                staked_sum_for_interval(&tables.token_locked_sum, 2).unwrap(),
                100 * TOKEN_UNIT
            );
        });
    }

    #[test]
    fn stake_rollback_restores_exact_state() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            let before = snapshot(tables);

            stake(tables, params, 25, 50 * TOKEN_UNIT, 1).unwrap();
            rollback_stake(tables, params, 25, 50 * TOKEN_UNIT, 1).unwrap();

            assert_eq!(snapshot(tables), before);
        });
    }

    #[test]
    fn unstake_rollback_restores_exact_state() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 0).unwrap();
            collect_network_fee(tables, params, 12, 1000).unwrap();
            let before = snapshot(tables);

            unstake(tables, params, 35, 5, 100 * TOKEN_UNIT, 0).unwrap();
            rollback_unstake(tables, params, 35, 5, 100 * TOKEN_UNIT, 0).unwrap();

            assert_eq!(snapshot(tables), before);
        });
    }

    #[test]
    fn fee_rollback_prunes_empty_buckets() {
        with_tables(|tables, params| {
            let before = snapshot(tables);
            collect_network_fee(tables, params, 12, 1000).unwrap();
            collect_network_fee(tables, params, 13, 500).unwrap();
            rollback_network_fee(tables, params, 13, 500).unwrap();
            assert_eq!(fee_sum_for_interval(&tables.network_fee_sum, 1).unwrap(), 1000);
            rollback_network_fee(tables, params, 12, 1000).unwrap();
            assert_eq!(snapshot(tables), before);
        });
    }

    #[test]
    fn expiry_index_tracks_locks() {
        with_tables(|tables, params| {
            stake(tables, params, 5, 100 * TOKEN_UNIT, 7).unwrap();
            let expiry = 5 + params.token_lock_period;
            let ids: Vec<u64> = tables
                .token_lock_expiry
                .get(&expiry)
                .unwrap()
                .map(|v| v.unwrap().value())
                .collect();
            assert_eq!(ids, vec![7]);

            unstake(tables, params, 35, 5, 100 * TOKEN_UNIT, 7).unwrap();
            assert_eq!(tables.token_lock_expiry.get(&expiry).unwrap().count(), 0);
        });
    }

    #[test]
    fn underflow_is_a_consistency_fault() {
        with_tables(|tables, params| {
            let err = rollback_network_fee(tables, params, 12, 1000).unwrap_err();
            assert!(matches!(err, StoreError::Consistency(_)));
        });
    }
}
