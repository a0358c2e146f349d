//! Order types, states, and the request/response shapes around them.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RejectReason;
use crate::models::UserId;

mod millis {
    use serde::Serializer;

    pub fn serialize<S>(ts: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(*ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopLimit,
}

impl OrderType {
    /// Stop and stop-limit orders never sit in the live book directly -
    /// they wait in the stop book until triggered, at which point they
    /// re-enter the pipeline as this equivalent type.
    pub fn activation_type(self) -> OrderType {
        match self {
            OrderType::Stop => OrderType::Market,
            OrderType::StopLimit => OrderType::Limit,
            other => other,
        }
    }

    pub fn is_stop(self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }

    pub fn is_limit_class(self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Good-till-canceled: unfilled residual rests on the book.
    Gtc,
    /// Immediate-or-cancel: unfilled residual is canceled, never rests.
    Ioc,
    /// Fill-or-kill: the whole order fills immediately or is canceled
    /// with zero fills.
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Gtc
    }
}

/// Self-trade prevention mode: what happens when a taker would trade
/// against its own resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StpMode {
    /// Self-trades are allowed to execute normally.
    None,
    /// The taker's remaining quantity is expired; the resting maker is
    /// untouched.
    ExpireTaker,
    /// The resting maker is expired; the taker continues matching
    /// against the next candidate.
    ExpireMaker,
    /// Both orders are expired.
    ExpireBoth,
}

impl Default for StpMode {
    fn default() -> Self {
        StpMode::None
    }
}

/// How an order's effective limit price should be derived from the
/// current state of the opposite/same side of the book at match time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceMatchMode {
    /// Use the submitted price as-is.
    None,
    /// Peg to the current best price on the opposite side of the book.
    Opponent,
    /// Peg to the current best price on the same side of the book.
    Queue,
}

impl Default for PriceMatchMode {
    fn default() -> Self {
        PriceMatchMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// Never entered the book at all (MARKET with nothing on the
    /// opposite side, IOC/FOK residual with no counterparty).
    Expired,
    /// Removed from the book mid-match by self-trade prevention.
    ExpiredInMatch,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// Cause of an `ORDER_TRADE_UPDATE` event, distinct from the resulting
/// `status` - e.g. a fill's `execution_type` is `Trade` whether the
/// resulting status is `PartiallyFilled` or `Filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    New,
    Trade,
    Canceled,
    Rejected,
    Expired,
}

/// What a caller submits to `MatchingEngine::submit_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub user_id: UserId,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Zero/ignored for `Market`.
    pub price: Decimal,
    /// Required for `Stop` / `StopLimit`.
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub self_trade_prevention: StpMode,
    #[serde(default)]
    pub price_match: PriceMatchMode,
}

/// The authoritative, mutable record the engine keeps for every order it
/// has ever accepted, terminal or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub client_order_id: Option<String>,
    pub user_id: UserId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub self_trade_prevention: StpMode,
    pub price_match: PriceMatchMode,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    #[serde(with = "millis")]
    pub created_at: i64,
    #[serde(with = "millis")]
    pub updated_at: i64,
    pub reject_reason: Option<RejectReason>,

    /// Quote asset currently reserved on this order's behalf (BUY only).
    /// Decremented in lock-step with the ledger on every fill; whatever
    /// remains is released in full the moment the order stops resting.
    #[serde(skip)]
    pub(crate) reserved_quote: Decimal,
    /// Base asset currently reserved on this order's behalf (SELL only).
    #[serde(skip)]
    pub(crate) reserved_base: Decimal,
}

impl Order {
    pub fn new(req: &NewOrderRequest, order_id: Uuid, now: i64) -> Self {
        Order {
            order_id,
            client_order_id: req.client_order_id.clone(),
            user_id: req.user_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            quantity: req.quantity,
            price: req.price,
            stop_price: req.stop_price,
            time_in_force: req.time_in_force,
            self_trade_prevention: req.self_trade_prevention,
            price_match: req.price_match,
            status: OrderStatus::New,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            created_at: now,
            updated_at: now,
            reject_reason: None,
            reserved_quote: Decimal::ZERO,
            reserved_base: Decimal::ZERO,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn record_fill(&mut self, fill_qty: Decimal, fill_price: Decimal, now: i64) {
        let prior_notional = self.average_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        self.filled_quantity += fill_qty;
        self.average_fill_price = Some((prior_notional + fill_price * fill_qty) / self.filled_quantity);
        self.status = if self.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
    }

    pub fn reject(&mut self, reason: RejectReason, now: i64) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason);
        self.updated_at = now;
    }
}

/// Query parameters for paginated order history lookups.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn get_limit(&self) -> usize {
        self.limit.unwrap_or(100).min(1000)
    }

    pub fn matches(&self, order: &Order) -> bool {
        if let Some(symbol) = &self.symbol {
            if &order.symbol != symbol {
                return false;
            }
        }
        if let Some(status) = self.status {
            if order.status != status {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if order.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if order.created_at > end {
                return false;
            }
        }
        true
    }
}
