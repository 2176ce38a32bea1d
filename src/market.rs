//! Market engine. Market lifecycle, LMSR trading, positions, liquidity,
//! settlement, and void.
//!
//! The market engine owns the LMSR state (q, positions, trades) and drives
//! the risk engine for every balance mutation. Every trade is between a
//! trader and the market's AMM, which is an ordinary account holding a
//! `Subsidy` lock.
//!
//! Rounding contract:
//!   - buyers pay `ceil` of the exact cost (dust stays in their cost basis,
//!     reaching the AMM at settlement),
//!   - sellers receive `floor` of the exact proceeds,
//!   - recorded average prices round half-even.
//!
//! Position close is proportional: each outcome has its own position lock,
//! and a sell releases `floor(lock · amount / held)` of it — the whole lock
//! when the position closes out, so position zero always means lock zero.
//!
//! PnL from sells is conditional until resolution. Profit is fronted from
//! the AMM subsidy into a `ConditionalProfit` lock on the trader; loss is
//! re-frozen from the trader's released basis as `ConditionalLoss`. The two
//! net against each other, so a trader carries at most one of them per
//! market at any time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::fixed::{
    checked_units, credits_to_f64, quantize, tokens_to_credits, Credits, Rounding, CREDIT_SCALE,
    MAX_MARKET_DP,
};
use crate::lmsr;
use crate::models::{
    AccountId, LockKind, Market, MarketId, MarketStatus, Trade, TradeId, TradeLeg,
};
use crate::risk::{LegDraft, RiskEngine};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Markets {
    pub markets: BTreeMap<MarketId, Market>,
    next_market_id: MarketId,
    next_trade_id: TradeId,
}

impl Markets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MarketId) -> Result<&Market, EngineError> {
        self.markets.get(&id).ok_or(EngineError::MarketNotFound(id))
    }

    fn get_open_mut(&mut self, id: MarketId) -> Result<&mut Market, EngineError> {
        let market = self
            .markets
            .get_mut(&id)
            .ok_or(EngineError::MarketNotFound(id))?;
        if !market.is_open() {
            return Err(EngineError::MarketNotOpen(id));
        }
        Ok(market)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a market with a freshly minted AMM subsidy of ceil(b·ln n).
    pub fn create(
        &mut self,
        risk: &mut RiskEngine,
        outcomes: Vec<String>,
        b: f64,
        deadline: Option<DateTime<Utc>>,
        precision: u32,
    ) -> Result<MarketId, EngineError> {
        self.create_funded(risk, outcomes, b, deadline, precision, None)
    }

    /// Create a market, drawing the subsidy from `funding_account` when one
    /// is given (treasury mode) instead of minting fresh credits.
    pub fn create_funded(
        &mut self,
        risk: &mut RiskEngine,
        outcomes: Vec<String>,
        b: f64,
        deadline: Option<DateTime<Utc>>,
        precision: u32,
        funding_account: Option<AccountId>,
    ) -> Result<MarketId, EngineError> {
        if outcomes.len() < 2 {
            return Err(EngineError::InvalidOutcomes(format!(
                "need at least 2 outcomes, got {}",
                outcomes.len()
            )));
        }
        for (i, o) in outcomes.iter().enumerate() {
            if o.is_empty() || outcomes[..i].contains(o) {
                return Err(EngineError::InvalidOutcomes(format!(
                    "outcome {o:?} is empty or duplicated"
                )));
            }
        }
        if precision > MAX_MARKET_DP {
            return Err(EngineError::InvalidPrecision(format!(
                "market precision {precision} exceeds {MAX_MARKET_DP} dp"
            )));
        }
        let b_units = checked_units(b, CREDIT_SCALE)?;
        if b_units <= 0 {
            return Err(EngineError::InvalidPrecision(format!(
                "liquidity b must be positive, got {b}"
            )));
        }
        if let Some(funder) = funding_account {
            risk.account(funder)?;
        }

        let subsidy = quantize(
            lmsr::max_loss(credits_to_f64(b_units), outcomes.len()),
            CREDIT_SCALE,
            Rounding::Ceil,
        )?;

        let market_id = self.next_market_id;
        let amm = risk.open_account();
        match funding_account {
            Some(funder) => {
                risk.transfer_available(funder, amm, subsidy, Some(market_id), "market_funding")?;
            }
            None => {
                risk.mint(amm, subsidy)?;
            }
        }
        risk.lock(amm, market_id, subsidy, LockKind::Subsidy)?;

        self.next_market_id += 1;
        let n = outcomes.len();
        self.markets.insert(
            market_id,
            Market {
                id: market_id,
                amm_account_id: amm,
                status: MarketStatus::Open,
                outcomes,
                precision,
                b: b_units,
                q: vec![0; n],
                positions: BTreeMap::new(),
                trades: Vec::new(),
                deadline,
                resolution: None,
            },
        );
        info!(market = market_id, amm, subsidy, "market created");
        Ok(market_id)
    }

    // ------------------------------------------------------------------
    // Trading
    // ------------------------------------------------------------------

    /// Buy `amount` tokens of `outcome`, paying at most `budget_cap`.
    pub fn buy(
        &mut self,
        risk: &mut RiskEngine,
        market_id: MarketId,
        account_id: AccountId,
        outcome: &str,
        amount: f64,
        budget_cap: f64,
    ) -> Result<Trade, EngineError> {
        let cap_units = checked_units(budget_cap, CREDIT_SCALE)?;
        let market = self.get_open_mut(market_id)?;
        let o = market.outcome_index(outcome)?;
        let delta_units = checked_units(amount, market.token_scale())?;
        if delta_units <= 0 {
            return Err(EngineError::InvalidPrecision(format!(
                "buy amount must be positive, got {amount}"
            )));
        }
        risk.account(account_id)?;

        let scale = market.token_scale();
        let delta = delta_units as f64 / scale as f64;
        let exact_cost = lmsr::cost_of_trade(&market.q_f64(), market.b_f64(), o, delta);
        let cost = quantize(exact_cost, CREDIT_SCALE, Rounding::Ceil)?.max(0);
        if cost > cap_units {
            return Err(EngineError::BudgetExceeded {
                cost,
                cap: cap_units,
            });
        }

        let amm = market.amm_account_id;
        let trade_id = self.next_trade_id;
        let legs = [
            LegDraft {
                account_id,
                available_delta: -cost,
                lock_changes: vec![(LockKind::Position(o), cost)],
            },
            LegDraft {
                account_id: amm,
                available_delta: 0,
                lock_changes: vec![],
            },
        ];
        let txs = risk.apply_legs(market_id, trade_id, &legs)?;
        self.next_trade_id += 1;

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.q[o] += delta_units;
        let n = market.outcomes.len();
        let pos = market
            .positions
            .entry(account_id)
            .or_insert_with(|| vec![0; n]);
        pos[o] += delta_units;

        let price = quantize(exact_cost / delta, scale, Rounding::HalfEven)?;
        let buyer = TradeLeg {
            account_id,
            available_delta: -cost,
            frozen_delta: cost,
            lock_id: risk
                .account(account_id)?
                .lock_for(market_id, LockKind::Position(o))
                .map(|l| l.id),
            tx_id: txs[0],
        };
        let seller = TradeLeg {
            account_id: amm,
            available_delta: 0,
            frozen_delta: 0,
            lock_id: None,
            tx_id: txs[1],
        };
        let trade = Trade {
            id: trade_id,
            market_id,
            outcome: o,
            amount: delta_units,
            price,
            buyer,
            seller,
        };
        market.trades.push(trade.clone());
        debug!(market = market_id, account = account_id, outcome, amount, cost, "buy executed");
        Ok(trade)
    }

    /// Sell `amount` tokens of `outcome` back to the AMM.
    pub fn sell(
        &mut self,
        risk: &mut RiskEngine,
        market_id: MarketId,
        account_id: AccountId,
        outcome: &str,
        amount: f64,
    ) -> Result<Trade, EngineError> {
        let market = self.get_open_mut(market_id)?;
        let o = market.outcome_index(outcome)?;
        let delta_units = checked_units(amount, market.token_scale())?;
        if delta_units <= 0 {
            return Err(EngineError::InvalidPrecision(format!(
                "sell amount must be positive, got {amount}"
            )));
        }
        let held = market.held(account_id, o);
        if held < delta_units {
            return Err(EngineError::InsufficientPosition {
                account: account_id,
                outcome: outcome.to_string(),
                held,
                requested: delta_units,
            });
        }

        let scale = market.token_scale();
        let delta = delta_units as f64 / scale as f64;
        let exact_proceeds =
            -lmsr::cost_of_trade(&market.q_f64(), market.b_f64(), o, -delta);
        let proceeds = quantize(exact_proceeds, CREDIT_SCALE, Rounding::Floor)?.max(0);

        let amm = market.amm_account_id;
        let account = risk.account(account_id)?;
        let pos_lock = account.locked_in(market_id, LockKind::Position(o));

        // Proportional cost-basis release; the whole lock when closing out.
        let basis = if delta_units == held {
            pos_lock
        } else {
            pos_lock * delta_units / held
        };
        let pnl = proceeds - basis;

        // Net the new pnl against the existing conditional lock. After this,
        // at most one of CP/CL exists, by construction.
        let cp = account.locked_in(market_id, LockKind::ConditionalProfit);
        let cl = account.locked_in(market_id, LockKind::ConditionalLoss);
        let net = cp - cl + pnl;
        let (new_cp, new_cl) = if net >= 0 { (net, 0) } else { (0, -net) };
        let (d_cp, d_cl) = (new_cp - cp, new_cl - cl);

        // Growing CP is fronted by the AMM subsidy; refuse rather than pay
        // out of thin air when a pathological sequence has drained it.
        if d_cp > 0 {
            let subsidy = risk.account(amm)?.locked_in(market_id, LockKind::Subsidy);
            if subsidy < d_cp {
                return Err(EngineError::InsufficientSubsidy {
                    needed: d_cp,
                    available: subsidy,
                });
            }
        }

        let trader_changes: Vec<(LockKind, Credits)> = [
            (LockKind::Position(o), -basis),
            (LockKind::ConditionalProfit, d_cp),
            (LockKind::ConditionalLoss, d_cl),
        ]
        .into_iter()
        .filter(|(_, d)| *d != 0)
        .collect();
        let trader_avail = basis - d_cl;
        let trade_id = self.next_trade_id;
        let legs = [
            LegDraft {
                account_id,
                available_delta: trader_avail,
                lock_changes: trader_changes,
            },
            LegDraft {
                account_id: amm,
                available_delta: 0,
                lock_changes: if d_cp != 0 {
                    vec![(LockKind::Subsidy, -d_cp)]
                } else {
                    vec![]
                },
            },
        ];
        let txs = risk.apply_legs(market_id, trade_id, &legs)?;
        self.next_trade_id += 1;

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.q[o] -= delta_units;
        let pos = market.positions.get_mut(&account_id).expect("held > 0");
        pos[o] -= delta_units;

        let price = quantize(exact_proceeds / delta, scale, Rounding::HalfEven)?.max(0);
        let seller = TradeLeg {
            account_id,
            available_delta: trader_avail,
            frozen_delta: -basis + d_cp + d_cl,
            lock_id: risk
                .account(account_id)?
                .lock_for(market_id, LockKind::Position(o))
                .map(|l| l.id),
            tx_id: txs[0],
        };
        let buyer = TradeLeg {
            account_id: amm,
            available_delta: 0,
            frozen_delta: -d_cp,
            lock_id: None,
            tx_id: txs[1],
        };
        let trade = Trade {
            id: trade_id,
            market_id,
            outcome: o,
            amount: -delta_units,
            price,
            buyer,
            seller,
        };
        market.trades.push(trade.clone());
        debug!(
            market = market_id,
            account = account_id,
            outcome,
            amount,
            proceeds,
            basis,
            pnl,
            "sell executed"
        );
        Ok(trade)
    }

    // ------------------------------------------------------------------
    // Liquidity
    // ------------------------------------------------------------------

    /// Deepen the market: b grows by `delta_b`, the subsidy lock grows by
    /// ceil(Δb·ln n) from the AMM's available balance. q is unchanged.
    pub fn add_liquidity(
        &mut self,
        risk: &mut RiskEngine,
        market_id: MarketId,
        delta_b: f64,
    ) -> Result<(), EngineError> {
        let market = self.get_open_mut(market_id)?;
        let db_units = checked_units(delta_b, CREDIT_SCALE)?;
        if db_units <= 0 {
            return Err(EngineError::InvalidPrecision(format!(
                "liquidity delta must be positive, got {delta_b}"
            )));
        }
        let n = market.outcomes.len();
        let additional = quantize(
            lmsr::max_loss(credits_to_f64(db_units), n),
            CREDIT_SCALE,
            Rounding::Ceil,
        )?;
        let amm = market.amm_account_id;
        let subsidy_lock = risk
            .account(amm)?
            .lock_for(market_id, LockKind::Subsidy)
            .ok_or(EngineError::LockNotFound(0))?
            .id;
        risk.increase_lock(subsidy_lock, additional)?;

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.b += db_units;
        info!(market = market_id, delta_b, additional, "liquidity added");
        Ok(())
    }

    /// Shrink the market's liquidity, releasing floor(Δb·ln n) of the
    /// subsidy back to the AMM. Refused unless a simulated resolution of
    /// every outcome stays solvent afterwards.
    pub fn remove_liquidity(
        &mut self,
        risk: &mut RiskEngine,
        market_id: MarketId,
        delta_b: f64,
    ) -> Result<(), EngineError> {
        let market = self.get_open_mut(market_id)?;
        let db_units = checked_units(delta_b, CREDIT_SCALE)?;
        if db_units <= 0 {
            return Err(EngineError::InvalidPrecision(format!(
                "liquidity delta must be positive, got {delta_b}"
            )));
        }
        if db_units >= market.b {
            return Err(EngineError::InsufficientSubsidy {
                needed: db_units,
                available: market.b,
            });
        }
        let n = market.outcomes.len();
        let release = quantize(
            lmsr::max_loss(credits_to_f64(db_units), n),
            CREDIT_SCALE,
            Rounding::Floor,
        )?;
        let amm = market.amm_account_id;
        let subsidy = risk.account(amm)?.locked_in(market_id, LockKind::Subsidy);
        if subsidy < release {
            return Err(EngineError::InsufficientSubsidy {
                needed: release,
                available: subsidy,
            });
        }

        // Settlement solvency: after the release, the market-wide lock pool
        // must still cover the winners' payouts plus outstanding conditional
        // profit, whichever outcome wins.
        let pool: Credits = risk
            .accounts
            .values()
            .flat_map(|a| a.locks_for_market(market_id))
            .map(|l| l.amount)
            .sum();
        let cp_total: Credits = risk
            .accounts
            .values()
            .flat_map(|a| a.locks_for_market(market_id))
            .filter(|l| l.kind == LockKind::ConditionalProfit)
            .map(|l| l.amount)
            .sum();
        let precision = market.precision;
        for (o, _) in market.outcomes.iter().enumerate() {
            let winners: Credits = market
                .positions
                .iter()
                .filter(|(id, _)| **id != amm)
                .map(|(_, pos)| tokens_to_credits(pos[o], precision))
                .sum();
            if pool - release < winners + cp_total {
                return Err(EngineError::InsufficientSubsidy {
                    needed: winners + cp_total - (pool - release),
                    available: 0,
                });
            }
        }

        let subsidy_lock = risk
            .account(amm)?
            .lock_for(market_id, LockKind::Subsidy)
            .expect("subsidy checked above")
            .id;
        risk.decrease_lock(subsidy_lock, release)?;

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.b -= db_units;
        info!(market = market_id, delta_b, release, "liquidity removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settlement and void
    // ------------------------------------------------------------------

    /// Resolve the market. Cost bases and conditional losses join the
    /// settlement pool inside the AMM's subsidy lock, winners are paid their
    /// tokens' face value from the pool, conditional profits release to
    /// their traders, and the AMM keeps the remainder.
    pub fn resolve(
        &mut self,
        risk: &mut RiskEngine,
        market_id: MarketId,
        outcome: &str,
    ) -> Result<(), EngineError> {
        let market = self.get_open_mut(market_id)?;
        let winner = market.outcome_index(outcome)?;
        let amm = market.amm_account_id;
        let precision = market.precision;
        let payouts: Vec<(AccountId, Credits)> = market
            .positions
            .iter()
            .filter(|(id, _)| **id != amm)
            .map(|(id, pos)| (*id, tokens_to_credits(pos[winner], precision)))
            .filter(|(_, c)| *c > 0)
            .collect();

        // Pool assembly: every position lock and every conditional loss
        // flows into the subsidy lock before anything is paid out.
        let sweep: Vec<u64> = risk
            .accounts
            .values()
            .flat_map(|a| a.locks_for_market(market_id))
            .filter(|l| {
                l.account_id != amm
                    && matches!(l.kind, LockKind::Position(_) | LockKind::ConditionalLoss)
            })
            .map(|l| l.id)
            .collect();
        for lock_id in sweep {
            let amount = risk.lock_ref(lock_id)?.amount;
            risk.transfer_frozen(lock_id, amm, LockKind::Subsidy, amount, "settlement_pool")?;
        }

        // Winning payouts: token face value, from the pool. Any winner
        // implies swept position locks, so the pool lock exists.
        if !payouts.is_empty() {
            let pool_lock = risk
                .account(amm)?
                .lock_for(market_id, LockKind::Subsidy)
                .ok_or(EngineError::LockNotFound(0))?
                .id;
            for (account_id, payout) in &payouts {
                risk.transfer_locked(pool_lock, *account_id, *payout, "settlement")?;
            }
        }

        // Conditional profits release to their traders at face value.
        let cps: Vec<u64> = risk
            .accounts
            .values()
            .flat_map(|a| a.locks_for_market(market_id))
            .filter(|l| l.kind == LockKind::ConditionalProfit)
            .map(|l| l.id)
            .collect();
        for lock_id in cps {
            risk.release_lock(lock_id)?;
        }

        // Remainder to the AMM: its realized profit, or bounded loss.
        if let Some(lock) = risk.account(amm)?.lock_for(market_id, LockKind::Subsidy) {
            let id = lock.id;
            risk.release_lock(id)?;
        }

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.status = MarketStatus::Resolved;
        market.resolution = Some(winner);
        info!(market = market_id, outcome, "market resolved");
        Ok(())
    }

    /// Void the market. No clawbacks: conditional profit returns to the AMM
    /// that fronted it, every other lock releases to its owner, and every
    /// account ends at exactly its pre-market total.
    pub fn void(&mut self, risk: &mut RiskEngine, market_id: MarketId) -> Result<(), EngineError> {
        let market = self.get_open_mut(market_id)?;
        let amm = market.amm_account_id;

        let locks: Vec<(u64, LockKind, AccountId)> = risk
            .accounts
            .values()
            .flat_map(|a| a.locks_for_market(market_id))
            .map(|l| (l.id, l.kind, l.account_id))
            .collect();
        for (lock_id, kind, owner) in locks {
            if kind == LockKind::ConditionalProfit && owner != amm {
                let amount = risk.lock_ref(lock_id)?.amount;
                risk.transfer_locked(lock_id, amm, amount, "void_return_cp")?;
            } else {
                risk.release_lock(lock_id)?;
            }
        }

        let market = self.markets.get_mut(&market_id).expect("checked above");
        market.status = MarketStatus::Void;
        info!(market = market_id, "market voided");
        Ok(())
    }

    /// Void every open market whose deadline has passed. Returns the count.
    pub fn tick(&mut self, risk: &mut RiskEngine, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired: Vec<MarketId> = self
            .markets
            .values()
            .filter(|m| m.is_open() && m.deadline.is_some_and(|d| d <= now))
            .map(|m| m.id)
            .collect();
        for id in &expired {
            self.void(risk, *id)?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired markets voided");
        }
        Ok(expired.len())
    }

    // ------------------------------------------------------------------
    // Prices
    // ------------------------------------------------------------------

    /// Quantized price of one outcome of an open market.
    pub fn price(&self, market_id: MarketId, outcome: &str) -> Result<f64, EngineError> {
        let market = self.get(market_id)?;
        if !market.is_open() {
            return Err(EngineError::MarketNotOpen(market_id));
        }
        let o = market.outcome_index(outcome)?;
        let scale = market.token_scale();
        let quantized = lmsr::prices_quantized(&market.q_f64(), market.b_f64(), scale)?;
        Ok(quantized[o] as f64 / scale as f64)
    }

    /// Quantized price vector of an open market; sums to exactly 1.
    pub fn prices(&self, market_id: MarketId) -> Result<Vec<f64>, EngineError> {
        let market = self.get(market_id)?;
        if !market.is_open() {
            return Err(EngineError::MarketNotOpen(market_id));
        }
        let scale = market.token_scale();
        let quantized = lmsr::prices_quantized(&market.q_f64(), market.b_f64(), scale)?;
        Ok(quantized
            .into_iter()
            .map(|p| p as f64 / scale as f64)
            .collect())
    }
}
