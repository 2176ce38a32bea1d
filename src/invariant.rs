//! Cross-domain invariant checker.
//!
//! Re-validates the contracts linking the risk engine, the ledger, and the
//! market engine. [`check`] is cheap enough to run after every public
//! operation; [`check_deep`] adds the ledger replay and trade↔transaction
//! linkage and is meant for fuzzers and test suites.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::fixed::Credits;
use crate::lmsr;
use crate::market::Markets;
use crate::models::{LockKind, MarketStatus};
use crate::risk::RiskEngine;

fn violation(msg: String) -> EngineError {
    EngineError::InvariantViolation(msg)
}

/// Per-operation checks: conservation, frozen bookkeeping, q/position
/// agreement, price normalization, conditional-lock exclusivity, and
/// terminal-market cleanliness.
pub fn check(risk: &RiskEngine, markets: &Markets) -> Result<(), EngineError> {
    // Credit conservation: everything ever minted, less burns, is exactly
    // what accounts hold now.
    let minted = risk.ledger.total_minted();
    let burned = risk.ledger.total_burned();
    let held = risk.total_in_system();
    if held != minted - burned {
        return Err(violation(format!(
            "conservation broken: accounts hold {held}, minted {minted} − burned {burned}"
        )));
    }

    for acc in risk.accounts.values() {
        if acc.available < 0 {
            return Err(violation(format!(
                "account {} has negative available balance {}",
                acc.id, acc.available
            )));
        }
        let lock_sum: Credits = acc.locks.iter().map(|l| l.amount).sum();
        if acc.frozen != lock_sum {
            return Err(violation(format!(
                "account {}: frozen {} != lock sum {}",
                acc.id, acc.frozen, lock_sum
            )));
        }
        for lock in &acc.locks {
            if lock.amount <= 0 {
                return Err(violation(format!(
                    "lock {} on account {} has non-positive amount {}",
                    lock.id, acc.id, lock.amount
                )));
            }
            if lock.account_id != acc.id {
                return Err(violation(format!(
                    "lock {} carries owner {} but lives on account {}",
                    lock.id, lock.account_id, acc.id
                )));
            }
        }
        // At most one conditional lock per (account, market).
        let mut conditionals: BTreeMap<u64, usize> = BTreeMap::new();
        for lock in acc.locks.iter().filter(|l| l.kind.is_conditional()) {
            *conditionals.entry(lock.market_id).or_default() += 1;
        }
        if let Some((market, n)) = conditionals.iter().find(|(_, n)| **n > 1) {
            return Err(violation(format!(
                "account {} holds {n} conditional locks in market {market}",
                acc.id
            )));
        }
    }

    for market in markets.markets.values() {
        // Status vs resolution.
        match market.status {
            MarketStatus::Resolved => {
                if market.resolution.is_none() {
                    return Err(violation(format!(
                        "market {} resolved without a resolution",
                        market.id
                    )));
                }
            }
            _ => {
                if market.resolution.is_some() {
                    return Err(violation(format!(
                        "market {} is {:?} but carries a resolution",
                        market.id, market.status
                    )));
                }
            }
        }

        // q is the column sum of positions, and never negative.
        for (o, q_o) in market.q.iter().enumerate() {
            if *q_o < 0 {
                return Err(violation(format!(
                    "market {}: q[{o}] is negative ({q_o})",
                    market.id
                )));
            }
            let pos_sum: i128 = market.positions.values().map(|p| p[o]).sum();
            if *q_o != pos_sum {
                return Err(violation(format!(
                    "market {}: q[{o}] = {q_o} but positions sum to {pos_sum}",
                    market.id
                )));
            }
        }

        if market.is_open() {
            // Quantized prices sum to exactly one whole.
            let scale = market.token_scale();
            let prices = lmsr::prices_quantized(&market.q_f64(), market.b_f64(), scale)?;
            let total: i128 = prices.iter().sum();
            if total != scale {
                return Err(violation(format!(
                    "market {}: quantized prices sum to {total}/{scale}",
                    market.id
                )));
            }
            // The AMM still holds a subsidy lock while positions are open.
            let amm = risk.account(market.amm_account_id)?;
            let subsidy = amm.locked_in(market.id, LockKind::Subsidy);
            if subsidy < 0 {
                return Err(violation(format!(
                    "market {}: negative subsidy {subsidy}",
                    market.id
                )));
            }
        } else {
            // Terminal markets leave no locks behind.
            for acc in risk.accounts.values() {
                if let Some(lock) = acc.locks_for_market(market.id).next() {
                    return Err(violation(format!(
                        "market {} is terminal but lock {} remains on account {}",
                        market.id, lock.id, acc.id
                    )));
                }
            }
        }

        // Position zero ⇔ position lock zero, per outcome, while open.
        if market.is_open() {
            for (account_id, pos) in &market.positions {
                if *account_id == market.amm_account_id {
                    continue;
                }
                let acc = risk.account(*account_id)?;
                for (o, held) in pos.iter().enumerate() {
                    let locked = acc.locked_in(market.id, LockKind::Position(o));
                    if *held == 0 && locked != 0 {
                        return Err(violation(format!(
                            "account {account_id}: zero position in market {} outcome {o} \
                             but {locked} still locked",
                            market.id
                        )));
                    }
                    if *held > 0 && locked == 0 {
                        return Err(violation(format!(
                            "account {account_id}: position {held} in market {} outcome {o} \
                             with no backing lock",
                            market.id
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Everything in [`check`], plus ledger replay against live balances and the
/// trade↔transaction linkage.
pub fn check_deep(risk: &RiskEngine, markets: &Markets) -> Result<(), EngineError> {
    check(risk, markets)?;

    // Replaying the ledger from empty reconstructs every balance exactly.
    let replayed = risk.ledger.replay();
    for acc in risk.accounts.values() {
        let (avail, frozen) = replayed.get(&acc.id).copied().unwrap_or((0, 0));
        if acc.available != avail || acc.frozen != frozen {
            return Err(violation(format!(
                "ledger replay disagrees for account {}: replay ({avail}, {frozen}), \
                 live ({}, {})",
                acc.id, acc.available, acc.frozen
            )));
        }
    }

    // Every trade points at exactly two transactions whose deltas match its
    // legs.
    let mut tagged: BTreeMap<u64, usize> = BTreeMap::new();
    for tx in risk.ledger.entries() {
        if let Some(trade_id) = tx.trade_id {
            *tagged.entry(trade_id).or_default() += 1;
        }
    }
    for market in markets.markets.values() {
        for trade in &market.trades {
            for leg in [&trade.buyer, &trade.seller] {
                let tx = risk.ledger.get(leg.tx_id).ok_or_else(|| {
                    violation(format!(
                        "trade {}: leg transaction {} missing",
                        trade.id, leg.tx_id
                    ))
                })?;
                if tx.account_id != leg.account_id
                    || tx.available_delta != leg.available_delta
                    || tx.frozen_delta != leg.frozen_delta
                    || tx.trade_id != Some(trade.id)
                {
                    return Err(violation(format!(
                        "trade {}: transaction {} does not match its leg",
                        trade.id, tx.id
                    )));
                }
            }
            if tagged.get(&trade.id).copied().unwrap_or(0) != 2 {
                return Err(violation(format!(
                    "trade {} does not have exactly 2 tagged transactions",
                    trade.id
                )));
            }
        }
    }

    Ok(())
}
