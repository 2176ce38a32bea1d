//! Risk engine. Accounts, balances, itemized locks, and the transaction log.
//!
//! Every balance mutation produces a ledger transaction. The risk engine is
//! the single source of truth for who has how much and where it is frozen;
//! it knows nothing about outcome tokens or LMSR.
//!
//! Trades go through [`RiskEngine::apply_legs`]: the market engine describes
//! each side of a trade as a [`LegDraft`] (net available delta plus per-lock
//! deltas), the risk engine validates both legs completely and then commits
//! both, emitting exactly one transaction per leg. A rejected trade touches
//! nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::fixed::Credits;
use crate::ledger::{Ledger, REASON_BURN, REASON_MINT};
use crate::models::{Account, AccountId, Lock, LockId, LockKind, MarketId, TradeId, TxId};

/// One side of a trade, as net balance effects. `lock_changes` are deltas on
/// the account's locks in the given market (positive grows, negative
/// shrinks); `available_delta` is the change to spendable balance. Across
/// all legs of a trade the deltas sum to zero.
#[derive(Debug, Clone)]
pub struct LegDraft {
    pub account_id: AccountId,
    pub available_delta: Credits,
    pub lock_changes: Vec<(LockKind, Credits)>,
}

impl LegDraft {
    pub fn frozen_delta(&self) -> Credits {
        self.lock_changes.iter().map(|(_, d)| d).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskEngine {
    pub accounts: BTreeMap<AccountId, Account>,
    pub ledger: Ledger,
    next_account_id: AccountId,
    next_lock_id: LockId,
}

impl RiskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(&mut self) -> AccountId {
        let id = self.next_account_id;
        self.next_account_id += 1;
        self.accounts.insert(id, Account::new(id));
        debug!(account = id, "account opened");
        id
    }

    pub fn account(&self, id: AccountId) -> Result<&Account, EngineError> {
        self.accounts
            .get(&id)
            .ok_or(EngineError::AccountNotFound(id))
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, EngineError> {
        self.accounts
            .get_mut(&id)
            .ok_or(EngineError::AccountNotFound(id))
    }

    pub fn lock_ref(&self, lock_id: LockId) -> Result<&Lock, EngineError> {
        self.accounts
            .values()
            .flat_map(|a| a.locks.iter())
            .find(|l| l.id == lock_id)
            .ok_or(EngineError::LockNotFound(lock_id))
    }

    fn lock_owner(&self, lock_id: LockId) -> Result<AccountId, EngineError> {
        Ok(self.lock_ref(lock_id)?.account_id)
    }

    // ------------------------------------------------------------------
    // Minting and burning (privileged)
    // ------------------------------------------------------------------

    pub fn mint(&mut self, account_id: AccountId, amount: Credits) -> Result<TxId, EngineError> {
        require_positive(amount)?;
        let acc = self.account_mut(account_id)?;
        acc.available += amount;
        let tx = self
            .ledger
            .append(account_id, amount, 0, REASON_MINT, None, None, None);
        debug!(account = account_id, amount, "minted credits");
        Ok(tx)
    }

    pub fn burn(&mut self, account_id: AccountId, amount: Credits) -> Result<TxId, EngineError> {
        require_positive(amount)?;
        let acc = self.account_mut(account_id)?;
        if acc.available < amount {
            return Err(EngineError::InsufficientBalance {
                account: account_id,
                needed: amount,
                available: acc.available,
            });
        }
        acc.available -= amount;
        let tx = self
            .ledger
            .append(account_id, -amount, 0, REASON_BURN, None, None, None);
        debug!(account = account_id, amount, "burned credits");
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Move credits from available to a new lock.
    pub fn lock(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        amount: Credits,
        kind: LockKind,
    ) -> Result<(LockId, TxId), EngineError> {
        require_positive(amount)?;
        let lock_id = self.next_lock_id;
        let acc = self.account_mut(account_id)?;
        if acc.available < amount {
            return Err(EngineError::InsufficientBalance {
                account: account_id,
                needed: amount,
                available: acc.available,
            });
        }
        self.next_lock_id += 1;
        let acc = self.account_mut(account_id)?;
        acc.available -= amount;
        acc.frozen += amount;
        acc.locks.push(Lock {
            id: lock_id,
            account_id,
            market_id,
            kind,
            amount,
        });
        let tx = self.ledger.append(
            account_id,
            -amount,
            amount,
            &format!("lock:{}", kind.label()),
            Some(market_id),
            None,
            Some(lock_id),
        );
        debug!(account = account_id, market = market_id, lock = lock_id, amount, kind = %kind.label(), "locked credits");
        Ok((lock_id, tx))
    }

    /// Grow an existing lock from the owner's available balance.
    pub fn increase_lock(&mut self, lock_id: LockId, amount: Credits) -> Result<TxId, EngineError> {
        require_positive(amount)?;
        let owner = self.lock_owner(lock_id)?;
        let acc = self.account_mut(owner)?;
        if acc.available < amount {
            return Err(EngineError::InsufficientBalance {
                account: owner,
                needed: amount,
                available: acc.available,
            });
        }
        acc.available -= amount;
        acc.frozen += amount;
        let lock = acc.locks.iter_mut().find(|l| l.id == lock_id).expect("lock vanished");
        lock.amount += amount;
        let (market_id, label) = (lock.market_id, lock.kind.label());
        Ok(self.ledger.append(
            owner,
            -amount,
            amount,
            &format!("increase_lock:{label}"),
            Some(market_id),
            None,
            Some(lock_id),
        ))
    }

    /// Shrink a lock back into the owner's available balance. A lock that
    /// reaches zero is removed.
    pub fn decrease_lock(&mut self, lock_id: LockId, amount: Credits) -> Result<TxId, EngineError> {
        require_positive(amount)?;
        let owner = self.lock_owner(lock_id)?;
        let acc = self.account_mut(owner)?;
        let idx = acc.locks.iter().position(|l| l.id == lock_id).expect("lock vanished");
        if acc.locks[idx].amount < amount {
            return Err(EngineError::LockUnderflow {
                lock: lock_id,
                held: acc.locks[idx].amount,
                requested: amount,
            });
        }
        acc.locks[idx].amount -= amount;
        let (market_id, label) = (acc.locks[idx].market_id, acc.locks[idx].kind.label());
        if acc.locks[idx].amount == 0 {
            acc.locks.remove(idx);
        }
        acc.frozen -= amount;
        acc.available += amount;
        Ok(self.ledger.append(
            owner,
            amount,
            -amount,
            &format!("decrease_lock:{label}"),
            Some(market_id),
            None,
            Some(lock_id),
        ))
    }

    /// Release a whole lock back to its owner's available balance.
    pub fn release_lock(&mut self, lock_id: LockId) -> Result<TxId, EngineError> {
        let amount = self.lock_ref(lock_id)?.amount;
        self.decrease_lock(lock_id, amount)
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Move frozen credits from one account's lock into another account's
    /// lock of the given kind (created or merged), staying frozen
    /// throughout. Emits two transactions.
    pub fn transfer_frozen(
        &mut self,
        from_lock_id: LockId,
        to_account: AccountId,
        to_kind: LockKind,
        amount: Credits,
        reason: &str,
    ) -> Result<(TxId, TxId), EngineError> {
        require_positive(amount)?;
        let from = self.lock_ref(from_lock_id)?.clone();
        if from.amount < amount {
            return Err(EngineError::LockUnderflow {
                lock: from_lock_id,
                held: from.amount,
                requested: amount,
            });
        }
        self.account(to_account)?;

        // Debit side.
        let acc = self.account_mut(from.account_id)?;
        let idx = acc.locks.iter().position(|l| l.id == from_lock_id).expect("lock vanished");
        acc.locks[idx].amount -= amount;
        if acc.locks[idx].amount == 0 {
            acc.locks.remove(idx);
        }
        acc.frozen -= amount;
        let tx_from = self.ledger.append(
            from.account_id,
            0,
            -amount,
            reason,
            Some(from.market_id),
            None,
            Some(from_lock_id),
        );

        // Credit side.
        let to_lock_id = self.grow_or_create_lock(to_account, from.market_id, to_kind, amount);
        let acc = self.account_mut(to_account)?;
        acc.frozen += amount;
        let tx_to = self.ledger.append(
            to_account,
            0,
            amount,
            reason,
            Some(from.market_id),
            None,
            Some(to_lock_id),
        );
        Ok((tx_from, tx_to))
    }

    /// Move frozen credits from a lock straight into another account's
    /// available balance. Used for settlement payouts. Two transactions.
    pub fn transfer_locked(
        &mut self,
        from_lock_id: LockId,
        to_account: AccountId,
        amount: Credits,
        reason: &str,
    ) -> Result<(TxId, TxId), EngineError> {
        require_positive(amount)?;
        let from = self.lock_ref(from_lock_id)?.clone();
        if from.amount < amount {
            return Err(EngineError::LockUnderflow {
                lock: from_lock_id,
                held: from.amount,
                requested: amount,
            });
        }
        self.account(to_account)?;

        let acc = self.account_mut(from.account_id)?;
        let idx = acc.locks.iter().position(|l| l.id == from_lock_id).expect("lock vanished");
        acc.locks[idx].amount -= amount;
        if acc.locks[idx].amount == 0 {
            acc.locks.remove(idx);
        }
        acc.frozen -= amount;
        let tx_from = self.ledger.append(
            from.account_id,
            0,
            -amount,
            reason,
            Some(from.market_id),
            None,
            Some(from_lock_id),
        );

        let acc = self.account_mut(to_account)?;
        acc.available += amount;
        let tx_to = self.ledger.append(
            to_account,
            amount,
            0,
            reason,
            Some(from.market_id),
            None,
            None,
        );
        Ok((tx_from, tx_to))
    }

    /// Available-to-available transfer between accounts.
    pub fn transfer_available(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: Credits,
        market_id: Option<MarketId>,
        reason: &str,
    ) -> Result<(TxId, TxId), EngineError> {
        require_positive(amount)?;
        self.account(to)?;
        let acc = self.account_mut(from)?;
        if acc.available < amount {
            return Err(EngineError::InsufficientBalance {
                account: from,
                needed: amount,
                available: acc.available,
            });
        }
        acc.available -= amount;
        let tx_from = self
            .ledger
            .append(from, -amount, 0, reason, market_id, None, None);
        let acc = self.account_mut(to)?;
        acc.available += amount;
        let tx_to = self
            .ledger
            .append(to, amount, 0, reason, market_id, None, None);
        Ok((tx_from, tx_to))
    }

    // ------------------------------------------------------------------
    // Atomic trade legs
    // ------------------------------------------------------------------

    /// Validate every leg, then commit every leg, emitting exactly one
    /// transaction per leg tagged with the trade id. Any failure rejects the
    /// whole batch with no state change.
    pub fn apply_legs(
        &mut self,
        market_id: MarketId,
        trade_id: TradeId,
        legs: &[LegDraft],
    ) -> Result<Vec<TxId>, EngineError> {
        debug_assert_eq!(
            legs.iter()
                .map(|l| l.available_delta + l.frozen_delta())
                .sum::<Credits>(),
            0,
            "trade legs must balance"
        );

        // Validate everything first.
        for leg in legs {
            let acc = self.account(leg.account_id)?;
            if acc.available + leg.available_delta < 0 {
                return Err(EngineError::InsufficientBalance {
                    account: leg.account_id,
                    needed: -leg.available_delta,
                    available: acc.available,
                });
            }
            for (kind, delta) in &leg.lock_changes {
                if *delta >= 0 {
                    continue;
                }
                let held = acc.locked_in(market_id, *kind);
                if held + delta < 0 {
                    return Err(match kind {
                        LockKind::Subsidy => EngineError::InsufficientSubsidy {
                            needed: -delta,
                            available: held,
                        },
                        _ => EngineError::LockUnderflow {
                            lock: acc
                                .lock_for(market_id, *kind)
                                .map_or(0, |l| l.id),
                            held,
                            requested: -delta,
                        },
                    });
                }
            }
        }

        // Commit.
        let mut txs = Vec::with_capacity(legs.len());
        for leg in legs {
            let frozen_delta = leg.frozen_delta();
            let mut tagged_lock = None;
            for (kind, delta) in &leg.lock_changes {
                if *delta == 0 {
                    continue;
                }
                let lock_id = self.adjust_lock(leg.account_id, market_id, *kind, *delta);
                if matches!(kind, LockKind::Position(_)) {
                    tagged_lock = lock_id;
                }
            }
            let acc = self.account_mut(leg.account_id).expect("validated above");
            acc.available += leg.available_delta;
            acc.frozen += frozen_delta;
            let tx = self.ledger.append(
                leg.account_id,
                leg.available_delta,
                frozen_delta,
                "trade",
                Some(market_id),
                Some(trade_id),
                tagged_lock,
            );
            txs.push(tx);
        }
        Ok(txs)
    }

    /// Apply a signed delta to the (account, market, kind) lock, creating or
    /// removing it as needed. Returns the lock id if the lock survives.
    /// Caller has already validated underflow and adjusts `frozen`.
    fn adjust_lock(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        kind: LockKind,
        delta: Credits,
    ) -> Option<LockId> {
        let acc = self.accounts.get_mut(&account_id).expect("validated");
        if let Some(idx) = acc
            .locks
            .iter()
            .position(|l| l.market_id == market_id && l.kind == kind)
        {
            acc.locks[idx].amount += delta;
            debug_assert!(acc.locks[idx].amount >= 0, "lock underflow slipped through");
            if acc.locks[idx].amount == 0 {
                acc.locks.remove(idx);
                None
            } else {
                Some(acc.locks[idx].id)
            }
        } else {
            debug_assert!(delta > 0, "cannot shrink a missing lock");
            let id = self.next_lock_id;
            self.next_lock_id += 1;
            let acc = self.accounts.get_mut(&account_id).expect("validated");
            acc.locks.push(Lock {
                id,
                account_id,
                market_id,
                kind,
                amount: delta,
            });
            Some(id)
        }
    }

    /// Merge into an existing lock of this kind or create a new one, without
    /// touching balances (used by transfer paths that adjust frozen
    /// themselves). Returns the lock id.
    fn grow_or_create_lock(
        &mut self,
        account_id: AccountId,
        market_id: MarketId,
        kind: LockKind,
        amount: Credits,
    ) -> LockId {
        let acc = self.accounts.get_mut(&account_id).expect("checked by caller");
        if let Some(lock) = acc
            .locks
            .iter_mut()
            .find(|l| l.market_id == market_id && l.kind == kind)
        {
            lock.amount += amount;
            lock.id
        } else {
            let id = self.next_lock_id;
            self.next_lock_id += 1;
            let acc = self.accounts.get_mut(&account_id).expect("checked by caller");
            acc.locks.push(Lock {
                id,
                account_id,
                market_id,
                kind,
                amount,
            });
            id
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn total_in_system(&self) -> Credits {
        self.accounts.values().map(|a| a.total()).sum()
    }
}

fn require_positive(amount: Credits) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::InvalidPrecision(format!(
            "amount must be positive, got {amount} units"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_account(balance: Credits) -> (RiskEngine, AccountId) {
        let mut risk = RiskEngine::new();
        let acc = risk.open_account();
        risk.mint(acc, balance).unwrap();
        (risk, acc)
    }

    #[test]
    fn mint_and_burn_round_trip() {
        let (mut risk, acc) = engine_with_account(1_000);
        assert_eq!(risk.account(acc).unwrap().available, 1_000);
        risk.burn(acc, 400).unwrap();
        assert_eq!(risk.account(acc).unwrap().available, 600);
        assert_eq!(risk.ledger.total_minted(), 1_000);
        assert_eq!(risk.ledger.total_burned(), 400);
    }

    #[test]
    fn burn_more_than_available_rejects() {
        let (mut risk, acc) = engine_with_account(100);
        assert!(matches!(
            risk.burn(acc, 101),
            Err(EngineError::InsufficientBalance { .. })
        ));
        assert_eq!(risk.account(acc).unwrap().available, 100);
    }

    #[test]
    fn lock_moves_available_to_frozen() {
        let (mut risk, acc) = engine_with_account(1_000);
        let (lock_id, _) = risk.lock(acc, 1, 700, LockKind::Subsidy).unwrap();
        let a = risk.account(acc).unwrap();
        assert_eq!(a.available, 300);
        assert_eq!(a.frozen, 700);
        assert_eq!(a.locks.len(), 1);

        risk.decrease_lock(lock_id, 200).unwrap();
        let a = risk.account(acc).unwrap();
        assert_eq!(a.available, 500);
        assert_eq!(a.frozen, 500);

        risk.release_lock(lock_id).unwrap();
        let a = risk.account(acc).unwrap();
        assert_eq!(a.available, 1_000);
        assert_eq!(a.frozen, 0);
        assert!(a.locks.is_empty());
    }

    #[test]
    fn lock_without_balance_rejects_cleanly() {
        let (mut risk, acc) = engine_with_account(50);
        let before = risk.clone();
        assert!(matches!(
            risk.lock(acc, 1, 51, LockKind::Position(0)),
            Err(EngineError::InsufficientBalance { .. })
        ));
        assert_eq!(risk, before);
    }

    #[test]
    fn decrease_past_zero_is_underflow() {
        let (mut risk, acc) = engine_with_account(100);
        let (lock_id, _) = risk.lock(acc, 1, 60, LockKind::Position(0)).unwrap();
        assert!(matches!(
            risk.decrease_lock(lock_id, 61),
            Err(EngineError::LockUnderflow { .. })
        ));
    }

    #[test]
    fn transfer_frozen_moves_between_locks() {
        let (mut risk, amm) = engine_with_account(500);
        let trader = risk.open_account();
        let (subsidy, _) = risk.lock(amm, 1, 500, LockKind::Subsidy).unwrap();

        risk.transfer_frozen(subsidy, trader, LockKind::ConditionalProfit, 120, "trade_pnl")
            .unwrap();

        assert_eq!(risk.account(amm).unwrap().frozen, 380);
        let t = risk.account(trader).unwrap();
        assert_eq!(t.frozen, 120);
        assert_eq!(t.available, 0);
        assert_eq!(t.locked_in(1, LockKind::ConditionalProfit), 120);
        // Conservation.
        assert_eq!(risk.total_in_system(), 500);
    }

    #[test]
    fn transfer_locked_pays_out_to_available() {
        let (mut risk, amm) = engine_with_account(300);
        let trader = risk.open_account();
        let (subsidy, _) = risk.lock(amm, 1, 300, LockKind::Subsidy).unwrap();
        risk.transfer_locked(subsidy, trader, 100, "settlement").unwrap();
        assert_eq!(risk.account(trader).unwrap().available, 100);
        assert_eq!(risk.account(amm).unwrap().frozen, 200);
        assert_eq!(risk.total_in_system(), 300);
    }

    #[test]
    fn apply_legs_is_atomic_on_failure() {
        let (mut risk, trader) = engine_with_account(100);
        let amm = risk.open_account();
        let before = risk.clone();

        // Trader cannot afford this buy; neither leg may land.
        let legs = [
            LegDraft {
                account_id: trader,
                available_delta: -150,
                lock_changes: vec![(LockKind::Position(0), 150)],
            },
            LegDraft {
                account_id: amm,
                available_delta: 0,
                lock_changes: vec![],
            },
        ];
        assert!(matches!(
            risk.apply_legs(1, 0, &legs),
            Err(EngineError::InsufficientBalance { .. })
        ));
        assert_eq!(risk, before);
    }

    #[test]
    fn apply_legs_emits_one_tx_per_leg() {
        let (mut risk, trader) = engine_with_account(1_000);
        let amm = risk.open_account();
        let legs = [
            LegDraft {
                account_id: trader,
                available_delta: -250,
                lock_changes: vec![(LockKind::Position(1), 250)],
            },
            LegDraft {
                account_id: amm,
                available_delta: 0,
                lock_changes: vec![],
            },
        ];
        let txs = risk.apply_legs(9, 42, &legs).unwrap();
        assert_eq!(txs.len(), 2);
        let tx = risk.ledger.get(txs[0]).unwrap();
        assert_eq!(tx.available_delta, -250);
        assert_eq!(tx.frozen_delta, 250);
        assert_eq!(tx.trade_id, Some(42));
        assert!(tx.lock_id.is_some());
        assert_eq!(risk.account(trader).unwrap().locked_in(9, LockKind::Position(1)), 250);
    }

    #[test]
    fn ledger_replay_matches_balances() {
        let (mut risk, a) = engine_with_account(2_000);
        let b = risk.open_account();
        risk.mint(b, 500).unwrap();
        let (lock_id, _) = risk.lock(a, 3, 800, LockKind::Position(0)).unwrap();
        risk.decrease_lock(lock_id, 300).unwrap();
        risk.transfer_available(a, b, 100, None, "gift").unwrap();

        let replayed = risk.ledger.replay();
        for (id, acc) in &risk.accounts {
            let (avail, frozen) = replayed.get(id).copied().unwrap_or((0, 0));
            assert_eq!(acc.available, avail, "account {id} available");
            assert_eq!(acc.frozen, frozen, "account {id} frozen");
        }
    }
}
