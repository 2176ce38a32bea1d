//! Stress harness for the engine.
//!
//! Simulates traders with varying skill levels against markets with hidden
//! true probabilities, checking invariants throughout, then resolves against
//! sampled outcomes and verifies:
//! 1. **Correctness**: every operation either succeeds or rejects cleanly
//! 2. **Financial invariants**: no credits created or destroyed
//! 3. **Bounded loss**: each AMM loses at most b·ln(n)
//! 4. **Market accuracy**: final prices beat chance (Brier score)
//!
//! Fully deterministic under a fixed seed.

use rand::prelude::*;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::fixed::credits_to_f64;
use crate::lmsr;
use crate::models::{AccountId, MarketId};

/// A simulated trader with a defined skill level.
#[derive(Debug, Clone)]
struct Trader {
    account: AccountId,
    /// 0.0 = pure noise, 1.0 = perfect knowledge.
    skill: f64,
}

/// A market with a hidden ground truth.
#[derive(Debug, Clone)]
struct SimMarket {
    id: MarketId,
    true_prob: f64,
}

#[derive(Debug, Clone)]
pub struct StressParams {
    pub traders: usize,
    pub markets: usize,
    pub rounds: usize,
    pub trader_balance: f64,
    pub b: f64,
    pub seed: u64,
    /// Run the deep invariant suite every this many operations.
    pub check_every: usize,
}

impl Default for StressParams {
    fn default() -> Self {
        Self {
            traders: 5,
            markets: 2,
            rounds: 500,
            trader_balance: 1_000.0,
            b: 100.0,
            seed: 42,
            check_every: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StressReport {
    pub trades_executed: u64,
    pub trades_rejected: u64,
    pub total_minted: f64,
    /// Worst AMM loss observed across markets, and the bound it stayed under.
    pub worst_amm_loss: f64,
    pub loss_bound: f64,
    /// Mean squared error of final prices against sampled outcomes.
    pub brier: f64,
}

/// A trader's belief: skill pulls it toward the truth, noise away from it.
fn simulate_belief(skill: f64, true_prob: f64, noise: f64) -> f64 {
    let offset = (noise - 0.5) * (1.0 - skill);
    (true_prob + offset).clamp(0.01, 0.99)
}

pub fn run(params: &StressParams) -> Result<StressReport, EngineError> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut engine = Engine::new();

    let traders: Vec<Trader> = (0..params.traders)
        .map(|_| {
            let account = engine.open_account();
            Trader {
                account,
                skill: rng.gen(),
            }
        })
        .collect();
    for trader in &traders {
        engine.mint(trader.account, params.trader_balance)?;
    }

    let markets: Vec<SimMarket> = (0..params.markets)
        .map(|_| {
            let true_prob = rng.gen_range(0.2..0.8);
            engine
                .create_market(&["yes", "no"], params.b, None, 4)
                .map(|id| SimMarket { id, true_prob })
        })
        .collect::<Result<_, _>>()?;

    let amm_start: Vec<f64> = markets
        .iter()
        .map(|m| {
            let amm = engine.market(m.id).unwrap().amm_account_id;
            credits_to_f64(engine.account(amm).unwrap().total())
        })
        .collect();

    let mut executed = 0u64;
    let mut rejected = 0u64;

    for round in 0..params.rounds {
        let trader = &traders[rng.gen_range(0..traders.len())];
        let market = &markets[rng.gen_range(0..markets.len())];
        let belief = simulate_belief(trader.skill, market.true_prob, rng.gen());
        let p_yes = engine.price(market.id, "yes")?;

        let result = if rng.gen_bool(0.7) {
            // Trade toward the belief: buy whichever side looks cheap.
            let side = if belief > p_yes { "yes" } else { "no" };
            let amount = (rng.gen_range(0.5f64..20.0) * 1e4).round() / 1e4;
            let budget = credits_to_f64(engine.account(trader.account)?.available);
            engine.buy(trader.account, market.id, side, amount, budget)
        } else {
            // Unwind part of an existing position.
            let side = if rng.gen_bool(0.5) { "yes" } else { "no" };
            let m = engine.market(market.id)?;
            let o = m.outcome_index(side)?;
            let held = m.held(trader.account, o);
            let fraction = rng.gen_range(0.1..1.0);
            let sell_units = (held as f64 * fraction) as i128;
            if sell_units <= 0 {
                continue;
            }
            let amount = sell_units as f64 / 1e4;
            engine.sell(trader.account, market.id, side, amount)
        };

        match result {
            Ok(_) => executed += 1,
            Err(
                EngineError::InsufficientBalance { .. }
                | EngineError::InsufficientPosition { .. }
                | EngineError::BudgetExceeded { .. }
                | EngineError::InsufficientSubsidy { .. },
            ) => rejected += 1,
            Err(e) => return Err(e),
        }

        if round % params.check_every == 0 {
            engine.check_invariants_deep()?;
        }
    }

    debug!(executed, rejected, "trading rounds finished");

    // Resolve every market against a sampled outcome and score accuracy.
    let mut brier_sum = 0.0;
    let mut worst_loss = 0.0f64;
    for (i, market) in markets.iter().enumerate() {
        let final_p = engine.price(market.id, "yes")?;
        let outcome_yes = rng.gen_bool(market.true_prob);
        let target = if outcome_yes { 1.0 } else { 0.0 };
        brier_sum += (final_p - target) * (final_p - target);

        engine.resolve(market.id, if outcome_yes { "yes" } else { "no" })?;

        let amm = engine.market(market.id)?.amm_account_id;
        let amm_total = credits_to_f64(engine.account(amm)?.total());
        worst_loss = worst_loss.max(amm_start[i] - amm_total);
    }
    engine.check_invariants_deep()?;

    let report = StressReport {
        trades_executed: executed,
        trades_rejected: rejected,
        total_minted: credits_to_f64(engine.ledger().total_minted()),
        worst_amm_loss: worst_loss,
        loss_bound: lmsr::max_loss(params.b, 2),
        brier: brier_sum / markets.len() as f64,
    };
    info!(?report, "stress run complete");
    Ok(report)
}
