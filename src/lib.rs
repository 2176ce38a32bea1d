//! Core trading engine for a conditional prediction-market system.
//!
//! A ledger of accounts holding an internal credit unit, and a collection of
//! independent LMSR markets trading outcome tokens against those accounts.
//! Credits are conserved exactly; prices and payouts are deterministic under
//! fixed-point arithmetic; every public operation leaves the cross-domain
//! invariants intact or rejects without residue.
//!
//! The engine is in-process, single-writer, and synchronous. Start from
//! [`engine::Engine`].

pub mod config;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod invariant;
pub mod ledger;
pub mod lmsr;
pub mod market;
pub mod models;
pub mod risk;
pub mod stress;

pub use config::EngineConfig;
pub use engine::{Engine, Snapshot};
pub use error::EngineError;
pub use fixed::{Credits, Rounding, CREDITS_DP};
pub use models::{Account, Lock, LockKind, Market, MarketStatus, Trade, TradeLeg, Transaction};
