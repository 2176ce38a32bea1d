//! Fixed-point scaling between f64 math and integer ledger units.
//!
//! Credits live at 6 decimal places (`CREDIT_SCALE`), token amounts at a
//! per-market precision up to 6 decimal places. All quantization names its
//! rounding direction; the direction decides who keeps the rounding dust.

use crate::error::EngineError;

/// Credit amounts in ledger units: 1 credit = 1_000_000 units.
pub type Credits = i128;

/// Raw token amounts at a market's own scale (`10^precision` units per token).
pub type TokenUnits = i128;

pub const CREDITS_DP: u32 = 6;
pub const CREDIT_SCALE: i128 = 1_000_000;

/// Highest market precision a token→credit conversion stays exact for.
pub const MAX_MARKET_DP: u32 = CREDITS_DP;

/// Guard against f64 values too large to hold in ledger units.
const MAX_SCALED: f64 = 1e30;

/// Rounding direction for a quantization. Part of the engine contract:
/// buyer costs round `Ceil`, seller proceeds and payouts round `Floor`,
/// recorded prices round `HalfEven`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    HalfEven,
    Floor,
    Ceil,
}

/// Scale factor for a market precision (`10^dp`).
pub fn scale_for(dp: u32) -> i128 {
    10i128.pow(dp)
}

/// Quantize an f64 onto an integer grid of the given scale.
pub fn quantize(x: f64, scale: i128, rounding: Rounding) -> Result<i128, EngineError> {
    if !x.is_finite() {
        return Err(EngineError::Overflow(format!(
            "non-finite value {x} cannot be quantized"
        )));
    }
    let scaled = x * scale as f64;
    if scaled.abs() > MAX_SCALED {
        return Err(EngineError::Overflow(format!(
            "value {x} out of ledger range"
        )));
    }
    let units = match rounding {
        Rounding::Floor => scaled.floor(),
        Rounding::Ceil => scaled.ceil(),
        Rounding::HalfEven => half_even(scaled),
    };
    Ok(units as i128)
}

/// Round half-to-even on an already-scaled value.
fn half_even(scaled: f64) -> f64 {
    let floor = scaled.floor();
    let frac = scaled - floor;
    if frac > 0.5 {
        floor + 1.0
    } else if frac < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

/// Validate an API-boundary amount against a scale and return its exact
/// integer representation. Rejects values carrying more precision than the
/// grid can hold, so excess precision never silently rounds away.
pub fn checked_units(x: f64, scale: i128) -> Result<i128, EngineError> {
    if !x.is_finite() {
        return Err(EngineError::Overflow(format!("non-finite amount {x}")));
    }
    let scaled = x * scale as f64;
    if scaled.abs() > MAX_SCALED {
        return Err(EngineError::Overflow(format!("amount {x} out of range")));
    }
    let nearest = scaled.round();
    // Binary-representation noise of an on-grid decimal input stays far
    // below one hundredth of a unit; a genuine extra decimal digit is at
    // least a tenth of one.
    if (scaled - nearest).abs() > 0.01 {
        return Err(EngineError::InvalidPrecision(format!(
            "amount {x} does not fit a grid of {scale} units per whole"
        )));
    }
    Ok(nearest as i128)
}

/// Credits from an API-boundary f64, rejecting excess precision.
pub fn credits_from_input(x: f64) -> Result<Credits, EngineError> {
    checked_units(x, CREDIT_SCALE)
}

pub fn credits_to_f64(c: Credits) -> f64 {
    c as f64 / CREDIT_SCALE as f64
}

pub fn tokens_to_f64(raw: TokenUnits, dp: u32) -> f64 {
    raw as f64 / scale_for(dp) as f64
}

/// Token face value in credits. Exact for every supported precision since
/// `dp <= CREDITS_DP`.
pub fn tokens_to_credits(raw: TokenUnits, dp: u32) -> Credits {
    raw * 10i128.pow(CREDITS_DP - dp)
}
