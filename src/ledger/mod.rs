//! Account ledger: per-(user, asset) balances, per-(user, symbol)
//! positions, and atomic trade settlement.
//!
//! Every trade touches two distinct accounts at once, so settlement
//! locks both account mutexes in ascending `user_id` order - a fixed,
//! canonical order across all callers rules out the classic two-mutex
//! deadlock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::FeeConfig;
use crate::error::LedgerError;
use crate::models::account::{AccountSnapshot, TransactionKind, TransactionRecord, UserAccount};
use crate::models::now_millis;
use crate::models::trade::Trade;
use crate::models::UserId;

pub struct AccountManager {
    accounts: DashMap<UserId, Arc<Mutex<UserAccount>>>,
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountManager {
    pub fn new() -> Self {
        AccountManager { accounts: DashMap::new() }
    }

    fn handle(&self, user_id: &str) -> Arc<Mutex<UserAccount>> {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserAccount::new(user_id.to_string()))))
            .clone()
    }

    pub fn deposit(&self, user_id: &str, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount);
        }
        let account = self.handle(user_id);
        let mut guard = account.lock();
        guard.balance_mut(asset).free += amount;
        guard.push_transaction(TransactionRecord {
            kind: TransactionKind::Deposit,
            asset: asset.to_string(),
            amount,
            symbol: None,
            timestamp: now_millis(),
        });
        tracing::debug!(user_id, asset, %amount, "deposit applied");
        Ok(())
    }

    pub fn withdraw(&self, user_id: &str, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount);
        }
        let account = self.handle(user_id);
        let mut guard = account.lock();
        let balance = guard.balance_mut(asset);
        if balance.free < amount {
            return Err(LedgerError::InsufficientFree { have: balance.free, need: amount });
        }
        balance.free -= amount;
        guard.push_transaction(TransactionRecord {
            kind: TransactionKind::Withdraw,
            asset: asset.to_string(),
            amount,
            symbol: None,
            timestamp: now_millis(),
        });
        tracing::debug!(user_id, asset, %amount, "withdrawal applied");
        Ok(())
    }

    /// Moves `amount` of `asset` from free to locked, reserving it
    /// against an open order.
    pub fn lock_funds(&self, user_id: &str, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        let account = self.handle(user_id);
        let mut guard = account.lock();
        let balance = guard.balance_mut(asset);
        if balance.free < amount {
            return Err(LedgerError::InsufficientFree { have: balance.free, need: amount });
        }
        balance.free -= amount;
        balance.locked += amount;
        Ok(())
    }

    /// Moves `amount` of `asset` from locked back to free (order
    /// canceled, expired, or over-reserved due to price improvement).
    pub fn unlock_funds(&self, user_id: &str, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        let account = self.handle(user_id);
        let mut guard = account.lock();
        let balance = guard.balance_mut(asset);
        if balance.locked < amount {
            return Err(LedgerError::InsufficientLocked { have: balance.locked, need: amount });
        }
        balance.locked -= amount;
        balance.free += amount;
        Ok(())
    }

    pub fn snapshot(&self, user_id: &str) -> Option<AccountSnapshot> {
        self.accounts.get(user_id).map(|handle| handle.lock().snapshot())
    }

    pub fn transactions(&self, user_id: &str, limit: usize, before: Option<i64>) -> Vec<TransactionRecord> {
        let Some(handle) = self.accounts.get(user_id) else {
            return Vec::new();
        };
        let guard = handle.lock();
        guard
            .transactions()
            .iter()
            .rev()
            .filter(|t| before.map(|b| t.timestamp < b).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Atomically settles one trade across both sides' accounts,
    /// acquiring the two account mutexes in canonical (user_id-sorted)
    /// order so that two concurrent opposite-direction trades can never
    /// deadlock on each other's lock.
    pub fn settle_trade(&self, trade: &Trade, base_asset: &str, quote_asset: &str, fee_config: &FeeConfig) {
        if trade.buyer_user_id == trade.seller_user_id {
            let account = self.handle(&trade.buyer_user_id);
            let mut guard = account.lock();
            apply_buy_leg(&mut guard, trade, base_asset, quote_asset, fee_config);
            apply_sell_leg(&mut guard, trade, base_asset, quote_asset, fee_config);
            return;
        }

        let buyer_handle = self.handle(&trade.buyer_user_id);
        let seller_handle = self.handle(&trade.seller_user_id);
        if trade.buyer_user_id < trade.seller_user_id {
            let mut buyer = buyer_handle.lock();
            let mut seller = seller_handle.lock();
            apply_buy_leg(&mut buyer, trade, base_asset, quote_asset, fee_config);
            apply_sell_leg(&mut seller, trade, base_asset, quote_asset, fee_config);
        } else {
            let mut seller = seller_handle.lock();
            let mut buyer = buyer_handle.lock();
            apply_buy_leg(&mut buyer, trade, base_asset, quote_asset, fee_config);
            apply_sell_leg(&mut seller, trade, base_asset, quote_asset, fee_config);
        }
    }
}

fn apply_buy_leg(account: &mut UserAccount, trade: &Trade, base_asset: &str, quote_asset: &str, fee_config: &FeeConfig) {
    let rate = fee_config.rate_for(&trade.symbol);
    let fee_rate = if trade.is_buyer_maker { rate.maker } else { rate.taker };
    let fee = trade.quantity * fee_rate;
    let quote_cost = trade.notional();

    account.balance_mut(quote_asset).locked -= quote_cost;
    account.balance_mut(base_asset).free += trade.quantity - fee;

    let position = account.position_mut(&trade.symbol);
    let new_qty = position.quantity + trade.quantity;
    if new_qty.is_zero() {
        position.average_cost = Decimal::ZERO;
    } else {
        position.average_cost = (position.average_cost * position.quantity + trade.price * trade.quantity) / new_qty;
    }
    position.quantity = new_qty;

    account.push_transaction(TransactionRecord {
        kind: TransactionKind::Trade,
        asset: base_asset.to_string(),
        amount: trade.quantity - fee,
        symbol: Some(trade.symbol.clone()),
        timestamp: trade.timestamp,
    });
}

fn apply_sell_leg(account: &mut UserAccount, trade: &Trade, base_asset: &str, quote_asset: &str, fee_config: &FeeConfig) {
    let rate = fee_config.rate_for(&trade.symbol);
    let fee_rate = if trade.is_buyer_maker { rate.taker } else { rate.maker };
    let quote_proceeds = trade.notional();
    let fee = quote_proceeds * fee_rate;

    account.balance_mut(base_asset).locked -= trade.quantity;
    account.balance_mut(quote_asset).free += quote_proceeds - fee;

    let position = account.position_mut(&trade.symbol);
    position.realized_pnl += trade.quantity * (trade.price - position.average_cost);
    position.quantity -= trade.quantity;
    if position.quantity.is_zero() {
        position.average_cost = Decimal::ZERO;
    }

    account.push_transaction(TransactionRecord {
        kind: TransactionKind::Trade,
        asset: quote_asset.to_string(),
        amount: quote_proceeds - fee,
        symbol: Some(trade.symbol.clone()),
        timestamp: trade.timestamp,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_trade() -> Trade {
        Trade {
            trade_id: 1,
            symbol: "BTCUSDT".into(),
            price: dec!(50000),
            quantity: dec!(0.1),
            buy_order_id: uuid::Uuid::new_v4(),
            sell_order_id: uuid::Uuid::new_v4(),
            buyer_user_id: "alice".into(),
            seller_user_id: "bob".into(),
            timestamp: 0,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn deposit_and_lock_round_trip() {
        let ledger = AccountManager::new();
        ledger.deposit("alice", "USDT", dec!(10000)).unwrap();
        ledger.lock_funds("alice", "USDT", dec!(5000)).unwrap();
        let snap = ledger.snapshot("alice").unwrap();
        let (_, bal) = snap.balances.iter().find(|(a, _)| a == "USDT").unwrap();
        assert_eq!(bal.free, dec!(5000));
        assert_eq!(bal.locked, dec!(5000));
        ledger.unlock_funds("alice", "USDT", dec!(5000)).unwrap();
        let snap = ledger.snapshot("alice").unwrap();
        let (_, bal) = snap.balances.iter().find(|(a, _)| a == "USDT").unwrap();
        assert_eq!(bal.free, dec!(10000));
        assert_eq!(bal.locked, dec!(0));
    }

    #[test]
    fn settle_trade_moves_funds_both_ways() {
        let ledger = AccountManager::new();
        ledger.deposit("alice", "USDT", dec!(10000)).unwrap();
        ledger.lock_funds("alice", "USDT", dec!(5000)).unwrap();
        ledger.deposit("bob", "BTC", dec!(1)).unwrap();
        ledger.lock_funds("bob", "BTC", dec!(0.1)).unwrap();

        let trade = sample_trade();
        let fee_config = FeeConfig::default();
        ledger.settle_trade(&trade, "BTC", "USDT", &fee_config);

        let alice = ledger.snapshot("alice").unwrap();
        let (_, btc) = alice.balances.iter().find(|(a, _)| a == "BTC").unwrap();
        assert!(btc.free > dec!(0) && btc.free < dec!(0.1));

        let bob = ledger.snapshot("bob").unwrap();
        let (_, usdt) = bob.balances.iter().find(|(a, _)| a == "USDT").unwrap();
        assert!(usdt.free > dec!(0) && usdt.free < dec!(5000));
    }

    #[test]
    fn insufficient_balance_rejects_lock() {
        let ledger = AccountManager::new();
        ledger.deposit("alice", "USDT", dec!(100)).unwrap();
        let err = ledger.lock_funds("alice", "USDT", dec!(1000)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFree { .. }));
    }
}
