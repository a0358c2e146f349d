//! Per-user balances, positions, and the append-only transaction log.
//!
//! Plain in-memory value types throughout - there is no persistence
//! layer here, so nothing derives a row-mapping trait.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::UserId;

/// Free (withdrawable/spendable) and locked (reserved against open
/// orders) balance of a single asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Running position in one symbol: net quantity, volume-weighted average
/// cost of the open quantity, and cumulative realized P&L.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Trade,
}

/// One append-only entry in a user's transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub kind: TransactionKind,
    pub asset: String,
    pub amount: Decimal,
    pub symbol: Option<String>,
    pub timestamp: i64,
}

/// A point-in-time, display-ready view of an account: zero balances are
/// dropped, everything else reported as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub user_id: UserId,
    pub balances: Vec<(String, AssetBalance)>,
    pub positions: Vec<(String, Position)>,
}

/// A single user's ledger state: balances, positions, and history.
///
/// Single-writer discipline: every mutation goes through
/// `AccountManager`, which holds this behind a `parking_lot::Mutex` so
/// only one task touches a given account at a time.
#[derive(Debug, Clone)]
pub struct UserAccount {
    user_id: UserId,
    balances: HashMap<String, AssetBalance>,
    positions: HashMap<String, Position>,
    transactions: Vec<TransactionRecord>,
}

impl UserAccount {
    pub fn new(user_id: UserId) -> Self {
        UserAccount {
            user_id,
            balances: HashMap::new(),
            positions: HashMap::new(),
            transactions: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn balance(&self, asset: &str) -> AssetBalance {
        self.balances.get(asset).copied().unwrap_or_default()
    }

    pub fn position(&self, symbol: &str) -> Position {
        self.positions.get(symbol).copied().unwrap_or_default()
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    pub(crate) fn balance_mut(&mut self, asset: &str) -> &mut AssetBalance {
        self.balances.entry(asset.to_string()).or_default()
    }

    pub(crate) fn position_mut(&mut self, symbol: &str) -> &mut Position {
        self.positions.entry(symbol.to_string()).or_default()
    }

    pub(crate) fn push_transaction(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            user_id: self.user_id.clone(),
            balances: self
                .balances
                .iter()
                .filter(|(_, b)| !b.total().is_zero())
                .map(|(a, b)| (a.clone(), *b))
                .collect(),
            positions: self.positions.iter().map(|(s, p)| (s.clone(), *p)).collect(),
        }
    }
}
