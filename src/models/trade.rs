//! Executed trade records.
//!
//! Deliberately free of maker/taker fee fields - fees are ledger-side
//! bookkeeping, not part of the trade tape itself.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserId;

/// One executed fill between a resting maker order and an incoming
/// taker order. `trade_id` is monotonically increasing per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    pub timestamp: i64,
    /// `true` when the buy side of this trade was the resting maker.
    pub is_buyer_maker: bool,
}

impl Trade {
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Query parameters for paginated trade-tape lookups.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeHistoryQuery {
    pub symbol: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

impl TradeHistoryQuery {
    pub fn get_limit(&self) -> usize {
        self.limit.unwrap_or(100).min(1000)
    }

    pub fn matches(&self, trade: &Trade) -> bool {
        if let Some(symbol) = &self.symbol {
            if &trade.symbol != symbol {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if trade.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if trade.timestamp > end {
                return false;
            }
        }
        true
    }
}
