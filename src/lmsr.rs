//! LMSR (Logarithmic Market Scoring Rule) — pure math, no state.
//!
//! All functions take f64 quantity vectors and return f64; the market engine
//! owns quantization and the ledger. Exponentiation is always normalized by
//! the largest exponent so deep markets never overflow.

use crate::error::EngineError;
use crate::fixed::{quantize, Rounding};

/// Largest exponent the inverse cost function will feed to `exp`.
/// Beyond this the budget is absurd relative to liquidity.
pub const MAX_BUDGET_TO_LIQUIDITY_RATIO: f64 = 700.0;

/// ln(Σ e^(x_i)), stable for arbitrary magnitudes.
#[inline]
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    m + xs.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

/// Cost function: C(q) = b · ln(Σ e^(q_i / b)).
///
/// Trading costs are always C(after) − C(before); the absolute value only
/// matters relative to C(0) = b · ln(n).
pub fn cost(q: &[f64], b: f64) -> f64 {
    debug_assert!(b.is_finite() && b > 0.0, "b invalid");
    let scaled: Vec<f64> = q.iter().map(|v| v / b).collect();
    b * log_sum_exp(&scaled)
}

/// Price (probability) vector: p_i = e^(q_i/b) / Σ e^(q_j/b).
///
/// Softmax over q/b; always sums to 1 up to float noise.
pub fn prices(q: &[f64], b: f64) -> Vec<f64> {
    debug_assert!(b.is_finite() && b > 0.0, "b invalid");
    let m = q.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = q.iter().map(|v| ((v - m) / b).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

/// Price vector quantized to `scale` units, summing to exactly one whole.
/// Residual units from rounding go to the largest component.
pub fn prices_quantized(q: &[f64], b: f64, scale: i128) -> Result<Vec<i128>, EngineError> {
    let raw = prices(q, b);
    let mut out = Vec::with_capacity(raw.len());
    for p in &raw {
        out.push(quantize(*p, scale, Rounding::HalfEven)?);
    }
    let residual = scale - out.iter().sum::<i128>();
    if residual != 0 {
        let largest = raw
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        out[largest] += residual;
    }
    Ok(out)
}

/// Credits required to move outcome `o` by `delta` tokens:
/// cost_of_trade = C(q + delta·e_o) − C(q).
///
/// Positive delta (buy) returns a positive cost; negative delta (sell)
/// returns a negative value whose magnitude is the seller's proceeds.
pub fn cost_of_trade(q: &[f64], b: f64, o: usize, delta: f64) -> f64 {
    let mut after = q.to_vec();
    after[o] += delta;
    cost(&after, b) - cost(q, b)
}

/// Inverse of `cost_of_trade`: tokens of `o` a credit budget buys.
///
/// amount = b · ln(1 + S·(e^(budget/b) − 1)/e_o) in normalized space,
/// where S = Σ e^(q_i/b) and e_o = e^(q_o/b).
pub fn amount_for_cost(q: &[f64], b: f64, o: usize, budget: f64) -> Result<f64, EngineError> {
    debug_assert!(b.is_finite() && b > 0.0, "b invalid");
    if budget / b > MAX_BUDGET_TO_LIQUIDITY_RATIO {
        return Err(EngineError::Overflow(format!(
            "budget {budget} too large relative to liquidity {b}"
        )));
    }
    let m = q.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let s: f64 = q.iter().map(|v| ((v - m) / b).exp()).sum();
    let e_o = ((q[o] - m) / b).exp();
    let inner = s * ((budget / b).exp() - 1.0) / e_o + 1.0;
    let amount = b * inner.ln();
    if !amount.is_finite() {
        return Err(EngineError::Overflow(format!(
            "amount for budget {budget} is not finite"
        )));
    }
    Ok(amount)
}

/// Maximum market-maker loss: b · ln(n). The required initial subsidy.
pub fn max_loss(b: f64, n: usize) -> f64 {
    b * (n as f64).ln()
}
