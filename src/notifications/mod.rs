//! Notification fan-out: translates matching-engine and ledger events
//! into the normative wire messages and publishes them on the event bus
//! under the right stream key.
//!
//! A distinct layer from the event bus itself (which only knows about
//! opaque `BusMessage`s and stream keys) and from the matching engine
//! (which only knows about `Order`/`Trade` domain types) - this is
//! where the two vocabularies meet.

pub mod schema;

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::eventbus::{BusMessage, EventBus, Priority};
use crate::models::account::AccountSnapshot;
use crate::models::order::{ExecutionType, Order};
use crate::models::trade::Trade;
use crate::models::now_millis;
use crate::orderbook::OrderBook;
use schema::{AccountBalanceEntry, AccountPositionMessage, DepthUpdateMessage, OrderTradeUpdate, TradeMessage};

pub fn trade_stream(symbol: &str) -> String {
    format!("{symbol}@trade")
}

pub fn depth_stream(symbol: &str) -> String {
    format!("{symbol}@depth")
}

pub fn order_stream(user_id: &str) -> String {
    format!("{user_id}@order")
}

pub fn account_stream(user_id: &str) -> String {
    format!("{user_id}@account")
}

pub struct NotificationFanout {
    bus: Arc<EventBus>,
    depth_levels: usize,
}

impl NotificationFanout {
    pub fn new(bus: Arc<EventBus>) -> Self {
        NotificationFanout { bus, depth_levels: 20 }
    }

    pub fn publish_order_update(&self, order: &Order, execution_type: ExecutionType, last_fill: Option<(Decimal, Decimal)>) {
        let (last_fill_price, last_fill_quantity) = last_fill.unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let message = OrderTradeUpdate {
            user_id: order.user_id.clone(),
            symbol: order.symbol.clone(),
            order_id: order.order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            quantity: order.quantity,
            price: order.price,
            execution_type,
            status: order.status,
            last_fill_quantity,
            last_fill_price,
            filled_quantity: order.filled_quantity,
            reject_reason: order.reject_reason,
            event_time: now_millis(),
            order_time: order.created_at,
        };
        self.bus.publish(order_stream(&order.user_id), BusMessage::Order(message));
    }

    pub fn publish_trade(&self, trade: &Trade) {
        let message = TradeMessage {
            symbol: trade.symbol.clone(),
            trade_id: trade.trade_id,
            price: trade.price,
            quantity: trade.quantity,
            buyer_order_id: trade.buy_order_id,
            seller_order_id: trade.sell_order_id,
            is_buyer_maker: trade.is_buyer_maker,
            trade_time: trade.timestamp,
        };
        self.bus.publish(trade_stream(&trade.symbol), BusMessage::Trade(message));
    }

    pub fn publish_depth(&self, book: &OrderBook, update_id: u64) {
        let (bids, asks) = book.depth(self.depth_levels);
        let message = DepthUpdateMessage::from_levels(book.symbol(), &bids, &asks, now_millis(), update_id);
        self.bus.publish(depth_stream(book.symbol()), BusMessage::Depth(message));
    }

    pub fn publish_account(&self, snapshot: &AccountSnapshot) {
        let message = AccountPositionMessage {
            user_id: snapshot.user_id.clone(),
            balances: snapshot
                .balances
                .iter()
                .map(|(asset, balance)| AccountBalanceEntry {
                    asset: asset.clone(),
                    free: balance.free,
                    locked: balance.locked,
                })
                .collect(),
            event_time: now_millis(),
        };
        self.bus.publish(account_stream(&snapshot.user_id), BusMessage::Account(message));
    }

    /// Default subscriber priority for internal housekeeping
    /// subscriptions (e.g. trade-tape archival) that should not starve
    /// user-facing consumers.
    pub fn default_priority() -> Priority {
        Priority::Normal
    }
}
