//! Public engine facade.
//!
//! A single value owning the risk engine, the ledger, and all markets. No
//! globals; tests instantiate as many engines as they like. All operations
//! are synchronous and run to completion — embedders driving the engine from
//! several producers put a mutex in front of it.
//!
//! In debug and test builds (or with `strict_invariants` set) every mutating
//! operation re-validates the cross-domain invariants and panics on a
//! violation; precondition errors simply return to the caller with no state
//! change.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fixed::credits_from_input;
use crate::invariant;
use crate::ledger::Ledger;
use crate::market::Markets;
use crate::models::{Account, AccountId, Market, MarketId, Trade, TxId};
use crate::risk::RiskEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engine {
    #[serde(default)]
    config: EngineConfig,
    risk: RiskEngine,
    markets: Markets,
}

/// Point-in-time copy of the whole engine state, returned by value.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub accounts: Vec<Account>,
    pub markets: Vec<Market>,
    pub ledger: Ledger,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            risk: RiskEngine::new(),
            markets: Markets::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accounts and credits
    // ------------------------------------------------------------------

    pub fn open_account(&mut self) -> AccountId {
        self.risk.open_account()
    }

    /// Privileged: create credits from nothing. The only way money enters.
    pub fn mint(&mut self, account: AccountId, amount: f64) -> Result<TxId, EngineError> {
        let units = credits_from_input(amount)?;
        let tx = self.risk.mint(account, units)?;
        self.assert_invariants();
        Ok(tx)
    }

    /// Privileged: destroy credits. The only way money leaves.
    pub fn burn(&mut self, account: AccountId, amount: f64) -> Result<TxId, EngineError> {
        let units = credits_from_input(amount)?;
        let tx = self.risk.burn(account, units)?;
        self.assert_invariants();
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    /// Create a market with config-default liquidity and precision.
    pub fn create_market_default(
        &mut self,
        outcomes: &[&str],
        deadline: Option<DateTime<Utc>>,
    ) -> Result<MarketId, EngineError> {
        let b = self.config.market.default_b;
        let precision = self.config.market.default_precision;
        self.create_market(outcomes, b, deadline, precision)
    }

    pub fn create_market(
        &mut self,
        outcomes: &[&str],
        b: f64,
        deadline: Option<DateTime<Utc>>,
        precision: u32,
    ) -> Result<MarketId, EngineError> {
        let outcomes = outcomes.iter().map(|s| s.to_string()).collect();
        let id = self
            .markets
            .create(&mut self.risk, outcomes, b, deadline, precision)?;
        self.assert_invariants();
        Ok(id)
    }

    /// Create a market whose subsidy is transferred from `funding_account`
    /// instead of minted.
    pub fn create_market_funded(
        &mut self,
        outcomes: &[&str],
        b: f64,
        deadline: Option<DateTime<Utc>>,
        precision: u32,
        funding_account: AccountId,
    ) -> Result<MarketId, EngineError> {
        let outcomes = outcomes.iter().map(|s| s.to_string()).collect();
        let id = self.markets.create_funded(
            &mut self.risk,
            outcomes,
            b,
            deadline,
            precision,
            Some(funding_account),
        )?;
        self.assert_invariants();
        Ok(id)
    }

    pub fn buy(
        &mut self,
        account: AccountId,
        market: MarketId,
        outcome: &str,
        amount: f64,
        budget_cap: f64,
    ) -> Result<Trade, EngineError> {
        let trade = self
            .markets
            .buy(&mut self.risk, market, account, outcome, amount, budget_cap)?;
        self.assert_invariants();
        Ok(trade)
    }

    pub fn sell(
        &mut self,
        account: AccountId,
        market: MarketId,
        outcome: &str,
        amount: f64,
    ) -> Result<Trade, EngineError> {
        let trade = self
            .markets
            .sell(&mut self.risk, market, account, outcome, amount)?;
        self.assert_invariants();
        Ok(trade)
    }

    pub fn add_liquidity(&mut self, market: MarketId, delta_b: f64) -> Result<(), EngineError> {
        self.markets.add_liquidity(&mut self.risk, market, delta_b)?;
        self.assert_invariants();
        Ok(())
    }

    pub fn remove_liquidity(&mut self, market: MarketId, delta_b: f64) -> Result<(), EngineError> {
        self.markets
            .remove_liquidity(&mut self.risk, market, delta_b)?;
        self.assert_invariants();
        Ok(())
    }

    pub fn resolve(&mut self, market: MarketId, outcome: &str) -> Result<(), EngineError> {
        self.markets.resolve(&mut self.risk, market, outcome)?;
        self.assert_invariants();
        Ok(())
    }

    pub fn void(&mut self, market: MarketId) -> Result<(), EngineError> {
        self.markets.void(&mut self.risk, market)?;
        self.assert_invariants();
        Ok(())
    }

    /// Void every open market whose deadline is at or before `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let voided = self.markets.tick(&mut self.risk, now)?;
        self.assert_invariants();
        Ok(voided)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn price(&self, market: MarketId, outcome: &str) -> Result<f64, EngineError> {
        self.markets.price(market, outcome)
    }

    /// Quantized price vector; sums to exactly 1 at market precision.
    pub fn prices(&self, market: MarketId) -> Result<Vec<f64>, EngineError> {
        self.markets.prices(market)
    }

    pub fn account(&self, id: AccountId) -> Result<&Account, EngineError> {
        self.risk.account(id)
    }

    pub fn market(&self, id: MarketId) -> Result<&Market, EngineError> {
        self.markets.get(id)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.risk.ledger
    }

    /// Immutable copy of the full state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            accounts: self.risk.accounts.values().cloned().collect(),
            markets: self.markets.markets.values().cloned().collect(),
            ledger: self.risk.ledger.clone(),
        }
    }

    /// Hash of the serialized state; two engines with equal hashes are
    /// bitwise-identical for every observable purpose.
    pub fn snapshot_hash(&self) -> u64 {
        let json = serde_json::to_string(&self.snapshot()).expect("snapshot serializes");
        let mut hasher = DefaultHasher::new();
        json.hash(&mut hasher);
        hasher.finish()
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Run the cheap per-operation checks.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        invariant::check(&self.risk, &self.markets)
    }

    /// Run the full suite including ledger replay and trade linkage.
    pub fn check_invariants_deep(&self) -> Result<(), EngineError> {
        invariant::check_deep(&self.risk, &self.markets)
    }

    fn assert_invariants(&self) {
        if cfg!(debug_assertions) || self.config.strict_invariants {
            if let Err(e) = self.check_invariants() {
                panic!("{e}");
            }
        }
    }
}
