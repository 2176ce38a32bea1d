//! Configuration for the engine.
//! Supports environment variables and default values for market parameters.

use serde::{Deserialize, Serialize};
use std::env;

use crate::fixed::MAX_MARKET_DP;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Market defaults.
    pub market: MarketDefaults,

    /// Run the invariant checker after every public operation even in
    /// release builds (debug and test builds always check).
    pub strict_invariants: bool,
}

/// Defaults applied when a market is created without explicit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDefaults {
    /// LMSR liquidity parameter (default: 100.0)
    pub default_b: f64,

    /// Token decimal places (default: 4)
    pub default_precision: u32,
}

impl Default for MarketDefaults {
    fn default() -> Self {
        Self {
            default_b: 100.0,
            default_precision: 4,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            market: MarketDefaults::default(),
            strict_invariants: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();

        if let Ok(b) = env::var("ENGINE_DEFAULT_B") {
            config.market.default_b = b.parse().unwrap_or(config.market.default_b);
        }

        if let Ok(precision) = env::var("ENGINE_DEFAULT_PRECISION") {
            config.market.default_precision = precision
                .parse()
                .unwrap_or(config.market.default_precision);
        }

        if let Ok(strict) = env::var("ENGINE_STRICT_INVARIANTS") {
            config.strict_invariants = strict.parse().unwrap_or(config.strict_invariants);
        }

        config.validate();
        config
    }

    /// Clamp configuration values to sane bounds.
    fn validate(&mut self) {
        if !(self.market.default_b.is_finite() && self.market.default_b > 0.0) {
            eprintln!(
                "invalid ENGINE_DEFAULT_B: {}, using default",
                self.market.default_b
            );
            self.market.default_b = MarketDefaults::default().default_b;
        }

        if self.market.default_precision > MAX_MARKET_DP {
            eprintln!(
                "invalid ENGINE_DEFAULT_PRECISION: {}, using default",
                self.market.default_precision
            );
            self.market.default_precision = MarketDefaults::default().default_precision;
        }
    }
}
