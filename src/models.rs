//! Data model for the engine.
//!
//! Two separate domains, linked only by integer ids:
//! - Risk side: accounts, locks, transactions. The risk engine tracks
//!   credits — available, frozen, and where they are frozen.
//! - Market side: markets, positions, trades. The market engine owns the
//!   LMSR state and talks to the risk engine for every balance mutation.
//!
//! The AMM of a market is an ordinary account; only its `Subsidy` lock
//! distinguishes it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::fixed::{scale_for, Credits, TokenUnits};

pub type AccountId = u64;
pub type MarketId = u64;
pub type LockId = u64;
pub type TxId = u64;
pub type TradeId = u64;

/// What a lock is backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "outcome")]
pub enum LockKind {
    /// A trader's cost basis for one outcome of one market.
    Position(usize),
    /// The AMM's b·ln(n) reserve plus any added liquidity.
    Subsidy,
    /// Unrealized gain from a profitable sell, held until resolution.
    ConditionalProfit,
    /// Unrealized loss from a losing sell, realized by the AMM at resolution.
    ConditionalLoss,
}

impl LockKind {
    pub fn label(&self) -> String {
        match self {
            LockKind::Position(o) => format!("position:{o}"),
            LockKind::Subsidy => "subsidy".to_string(),
            LockKind::ConditionalProfit => "conditional_profit".to_string(),
            LockKind::ConditionalLoss => "conditional_loss".to_string(),
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            LockKind::ConditionalProfit | LockKind::ConditionalLoss
        )
    }
}

/// Credits frozen in a market. The risk engine's receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub account_id: AccountId,
    pub market_id: MarketId,
    pub kind: LockKind,
    /// Always positive; a lock that reaches zero is removed.
    pub amount: Credits,
}

/// An account in the risk engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Credits available to spend or stake.
    pub available: Credits,
    /// Credits committed to open markets. Always Σ locks.
    pub frozen: Credits,
    pub locks: Vec<Lock>,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            available: 0,
            frozen: 0,
            locks: Vec::new(),
        }
    }

    pub fn total(&self) -> Credits {
        self.available + self.frozen
    }

    pub fn lock_for(&self, market_id: MarketId, kind: LockKind) -> Option<&Lock> {
        self.locks
            .iter()
            .find(|l| l.market_id == market_id && l.kind == kind)
    }

    pub fn locks_for_market(&self, market_id: MarketId) -> impl Iterator<Item = &Lock> {
        self.locks.iter().filter(move |l| l.market_id == market_id)
    }

    pub fn locked_in(&self, market_id: MarketId, kind: LockKind) -> Credits {
        self.lock_for(market_id, kind).map_or(0, |l| l.amount)
    }
}

/// Append-only ledger entry. Every credit movement gets one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub account_id: AccountId,
    /// Change to the account's available balance.
    pub available_delta: Credits,
    /// Change to the account's frozen balance.
    pub frozen_delta: Credits,
    pub reason: String,
    pub market_id: Option<MarketId>,
    pub trade_id: Option<TradeId>,
    pub lock_id: Option<LockId>,
}

/// The exact balance changes one side of a trade experienced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub account_id: AccountId,
    pub available_delta: Credits,
    pub frozen_delta: Credits,
    /// The position lock touched by this leg, if any survives the trade.
    pub lock_id: Option<LockId>,
    pub tx_id: TxId,
}

/// A single executed trade. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub outcome: usize,
    /// Token units, signed: positive for a buy, negative for a sell.
    pub amount: TokenUnits,
    /// Average price per token, in units of the market's precision.
    pub price: i128,
    pub buyer: TradeLeg,
    pub seller: TradeLeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Resolved,
    Void,
}

/// A market instance. Owns the LMSR state, positions, and trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub amm_account_id: AccountId,
    pub status: MarketStatus,
    pub outcomes: Vec<String>,
    /// Token decimal places for this market.
    pub precision: u32,
    /// Liquidity parameter, credit units.
    pub b: Credits,
    /// Quantity sold per outcome, token units. Always Σ positions.
    pub q: Vec<TokenUnits>,
    /// Token holdings per account per outcome, token units.
    pub positions: BTreeMap<AccountId, Vec<TokenUnits>>,
    pub trades: Vec<Trade>,
    /// Unresolved markets past this instant are voided by `tick`.
    pub deadline: Option<DateTime<Utc>>,
    pub resolution: Option<usize>,
}

impl Market {
    pub fn outcome_index(&self, outcome: &str) -> Result<usize, EngineError> {
        self.outcomes
            .iter()
            .position(|o| o == outcome)
            .ok_or_else(|| EngineError::UnknownOutcome(outcome.to_string()))
    }

    pub fn token_scale(&self) -> i128 {
        scale_for(self.precision)
    }

    pub fn b_f64(&self) -> f64 {
        crate::fixed::credits_to_f64(self.b)
    }

    /// q as token counts, for the LMSR math.
    pub fn q_f64(&self) -> Vec<f64> {
        let scale = self.token_scale() as f64;
        self.q.iter().map(|v| *v as f64 / scale).collect()
    }

    pub fn position(&self, account_id: AccountId) -> Vec<TokenUnits> {
        self.positions
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| vec![0; self.outcomes.len()])
    }

    pub fn held(&self, account_id: AccountId, outcome: usize) -> TokenUnits {
        self.positions
            .get(&account_id)
            .map_or(0, |p| p[outcome])
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }
}
