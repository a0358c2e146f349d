//! Wire message schemas for the four externally-visible event kinds.
//!
//! Numbers are serialized as strings and timestamps as integer
//! milliseconds, so downstream consumers never lose precision round-
//! tripping through JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::{ExecutionType, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::models::UserId;

fn as_string<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_string())
}

/// `<user_id>@order` - one per order-status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTradeUpdate {
    pub user_id: UserId,
    pub symbol: String,
    pub order_id: Uuid,
    pub client_order_id: Option<String>,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(serialize_with = "as_string")]
    pub quantity: Decimal,
    #[serde(serialize_with = "as_string")]
    pub price: Decimal,
    pub execution_type: ExecutionType,
    pub status: OrderStatus,
    #[serde(serialize_with = "as_string")]
    pub last_fill_quantity: Decimal,
    #[serde(serialize_with = "as_string")]
    pub last_fill_price: Decimal,
    #[serde(serialize_with = "as_string")]
    pub filled_quantity: Decimal,
    pub reject_reason: Option<crate::error::RejectReason>,
    /// Event time, milliseconds.
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Order creation time, milliseconds.
    #[serde(rename = "O")]
    pub order_time: i64,
}

/// `<symbol>@trade` - one per executed fill, public.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMessage {
    pub symbol: String,
    pub trade_id: u64,
    #[serde(serialize_with = "as_string")]
    pub price: Decimal,
    #[serde(serialize_with = "as_string")]
    pub quantity: Decimal,
    pub buyer_order_id: Uuid,
    pub seller_order_id: Uuid,
    pub is_buyer_maker: bool,
    /// Trade time, milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,
}

/// `<symbol>@depth` - aggregated top-of-book snapshot, public.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdateMessage {
    pub symbol: String,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    /// Event time, milliseconds.
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Update id, monotonically increasing per symbol.
    #[serde(rename = "u")]
    pub update_id: u64,
}

impl DepthUpdateMessage {
    pub fn from_levels(
        symbol: &str,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        event_time: i64,
        update_id: u64,
    ) -> Self {
        DepthUpdateMessage {
            symbol: symbol.to_string(),
            bids: bids.iter().map(|(p, q)| [p.to_string(), q.to_string()]).collect(),
            asks: asks.iter().map(|(p, q)| [p.to_string(), q.to_string()]).collect(),
            event_time,
            update_id,
        }
    }
}

/// `<user_id>@account` - one per settled trade / deposit / withdrawal
/// affecting balances or positions, private.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPositionMessage {
    pub user_id: UserId,
    pub balances: Vec<AccountBalanceEntry>,
    /// Event time, milliseconds.
    #[serde(rename = "E")]
    pub event_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalanceEntry {
    pub asset: String,
    #[serde(serialize_with = "as_string")]
    pub free: Decimal,
    #[serde(serialize_with = "as_string")]
    pub locked: Decimal,
}
