//! The price-time priority book for a single symbol: resting limit
//! orders on the live side, pending stop/stop-limit orders on the stop
//! side.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::decimal::PriceLevel;
use crate::models::order::OrderSide;
use crate::models::UserId;

/// A resting order as the book sees it: just enough to match against
/// and to report in a snapshot. The authoritative `Order` record lives
/// in the matching engine's order map; this is a lightweight mirror
/// kept in lock-step with it for O(log L) book operations.
#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub order_id: Uuid,
    pub user_id: UserId,
    pub side: OrderSide,
    pub price: Decimal,
    pub remaining_quantity: Decimal,
    pub created_at: i64,
}

/// A pending stop or stop-limit order, waiting for the trigger
/// condition to be crossed by the last trade price.
#[derive(Debug, Clone)]
pub struct StopEntry {
    pub order_id: Uuid,
    pub user_id: UserId,
    pub side: OrderSide,
    pub stop_price: Decimal,
    pub limit_price: Decimal,
    pub quantity: Decimal,
    pub created_at: i64,
}

type Book = RwLock<BTreeMap<PriceLevel, VecDeque<OrderEntry>>>;
type StopBook = RwLock<BTreeMap<PriceLevel, VecDeque<StopEntry>>>;

pub struct OrderBook {
    symbol: String,
    // Bids keyed ascending; best bid is the last (max) key.
    bids: Book,
    // Asks keyed ascending; best ask is the first (min) key.
    asks: Book,
    index: DashMap<Uuid, (OrderSide, PriceLevel)>,

    // BUY STOP triggers when the last trade price rises to or above the
    // stop price, so `buy_stops` is walked from the lowest key up.
    buy_stops: StopBook,
    // SELL STOP triggers when the last trade price falls to or below
    // the stop price, so `sell_stops` is walked from the highest key
    // down.
    sell_stops: StopBook,
    stop_index: DashMap<Uuid, (OrderSide, PriceLevel)>,

    last_trade_price: RwLock<Option<Decimal>>,
    trade_seq: std::sync::atomic::AtomicU64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        OrderBook {
            symbol: symbol.into(),
            bids: RwLock::new(BTreeMap::new()),
            asks: RwLock::new(BTreeMap::new()),
            index: DashMap::new(),
            buy_stops: RwLock::new(BTreeMap::new()),
            sell_stops: RwLock::new(BTreeMap::new()),
            stop_index: DashMap::new(),
            last_trade_price: RwLock::new(None),
            trade_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn next_trade_id(&self) -> u64 {
        self.trade_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.read().keys().next_back().map(|p| p.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.read().keys().next().map(|p| p.to_decimal())
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        *self.last_trade_price.read()
    }

    pub fn set_last_trade_price(&self, price: Decimal) {
        *self.last_trade_price.write() = Some(price);
    }

    fn side_book(&self, side: OrderSide) -> &Book {
        match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        }
    }

    /// The book an incoming order of `taker_side` matches against.
    fn opposite_book(&self, taker_side: OrderSide) -> &Book {
        match taker_side {
            OrderSide::Buy => &self.asks,
            OrderSide::Sell => &self.bids,
        }
    }

    pub fn add_resting(&self, entry: OrderEntry) {
        let level = PriceLevel::from_decimal(entry.price);
        let side = entry.side;
        self.index.insert(entry.order_id, (side, level));
        self.side_book(side).write().entry(level).or_default().push_back(entry);
    }

    pub fn has_order(&self, order_id: Uuid) -> bool {
        self.index.contains_key(&order_id)
    }

    /// Removes a resting order from the book entirely, wherever it is.
    pub fn remove(&self, order_id: Uuid) -> Option<OrderEntry> {
        let (side, level) = self.index.remove(&order_id).map(|(_, v)| v)?;
        let book = self.side_book(side);
        let mut guard = book.write();
        let entry = {
            let queue = guard.get_mut(&level)?;
            let pos = queue.iter().position(|o| o.order_id == order_id)?;
            queue.remove(pos)
        };
        if guard.get(&level).map(|q| q.is_empty()).unwrap_or(false) {
            guard.remove(&level);
        }
        entry
    }

    /// Top-of-book candidate on the opposite side from `taker_side`,
    /// without removing it.
    pub fn peek_top_opposite(&self, taker_side: OrderSide) -> Option<OrderEntry> {
        let book = self.opposite_book(taker_side);
        let guard = book.read();
        let (_, queue) = match taker_side {
            // Asks are walked ascending (cheapest first).
            OrderSide::Buy => guard.iter().next()?,
            // Bids are walked descending (richest first).
            OrderSide::Sell => guard.iter().next_back()?,
        };
        queue.front().cloned()
    }

    /// Reduces the top resting order on the opposite side by `fill_qty`,
    /// removing it if fully consumed. Returns `true` if it was fully
    /// filled and removed. Panics (an internal invariant violation) if
    /// the top-of-book entry changed out from under the caller - callers
    /// must always `peek_top_opposite` immediately before calling this,
    /// inside the same per-symbol critical section.
    pub fn fill_top_opposite(&self, taker_side: OrderSide, order_id: Uuid, fill_qty: Decimal) -> bool {
        let book = self.opposite_book(taker_side);
        let mut guard = book.write();
        let level = match taker_side {
            OrderSide::Buy => *guard.keys().next().expect("fill_top_opposite: ask book invariant"),
            OrderSide::Sell => *guard.keys().next_back().expect("fill_top_opposite: bid book invariant"),
        };
        let fully_filled = {
            let queue = guard.get_mut(&level).expect("fill_top_opposite: level invariant");
            let front = queue.front_mut().expect("fill_top_opposite: queue invariant");
            assert_eq!(front.order_id, order_id, "fill_top_opposite: top-of-book changed mid-match");
            front.remaining_quantity -= fill_qty;
            if front.remaining_quantity.is_zero() {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        if fully_filled {
            self.index.remove(&order_id);
            if guard.get(&level).map(|q| q.is_empty()).unwrap_or(false) {
                guard.remove(&level);
            }
        }
        fully_filled
    }

    /// Aggregated `(price, total_quantity)` pairs for each side, best
    /// price first, at most `levels` entries per side.
    pub fn depth(&self, levels: usize) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        let bids = self
            .bids
            .read()
            .iter()
            .rev()
            .take(levels)
            .map(|(p, q)| (p.to_decimal(), q.iter().map(|o| o.remaining_quantity).sum()))
            .collect();
        let asks = self
            .asks
            .read()
            .iter()
            .take(levels)
            .map(|(p, q)| (p.to_decimal(), q.iter().map(|o| o.remaining_quantity).sum()))
            .collect();
        (bids, asks)
    }

    /// Pure feasibility check for FOK: can `qty` be fully satisfied by
    /// the opposite side, honoring `limit_price` if present, without
    /// mutating anything?
    pub fn can_fill_fully(&self, taker_side: OrderSide, qty: Decimal, limit_price: Option<Decimal>) -> bool {
        let book = self.opposite_book(taker_side);
        let guard = book.read();
        let mut available = Decimal::ZERO;
        let levels: Box<dyn Iterator<Item = (&PriceLevel, &VecDeque<OrderEntry>)>> = match taker_side {
            OrderSide::Buy => Box::new(guard.iter()),
            OrderSide::Sell => Box::new(guard.iter().rev()),
        };
        for (level, queue) in levels {
            if let Some(limit) = limit_price {
                let price = level.to_decimal();
                let incompatible = match taker_side {
                    OrderSide::Buy => price > limit,
                    OrderSide::Sell => price < limit,
                };
                if incompatible {
                    break;
                }
            }
            available += queue.iter().map(|o| o.remaining_quantity).sum::<Decimal>();
            if available >= qty {
                return true;
            }
        }
        available >= qty
    }

    pub fn add_stop(&self, entry: StopEntry) {
        let level = PriceLevel::from_decimal(entry.stop_price);
        let side = entry.side;
        self.stop_index.insert(entry.order_id, (side, level));
        let book = match side {
            OrderSide::Buy => &self.buy_stops,
            OrderSide::Sell => &self.sell_stops,
        };
        book.write().entry(level).or_default().push_back(entry);
    }

    pub fn remove_stop(&self, order_id: Uuid) -> Option<StopEntry> {
        let (side, level) = self.stop_index.remove(&order_id).map(|(_, v)| v)?;
        let book = match side {
            OrderSide::Buy => &self.buy_stops,
            OrderSide::Sell => &self.sell_stops,
        };
        let mut guard = book.write();
        let entry = {
            let queue = guard.get_mut(&level)?;
            let pos = queue.iter().position(|o| o.order_id == order_id)?;
            queue.remove(pos)
        };
        if guard.get(&level).map(|q| q.is_empty()).unwrap_or(false) {
            guard.remove(&level);
        }
        entry
    }

    /// Removes and returns every stop order triggered by a last trade
    /// at `last_price`: BUY STOPs with `stop_price <= last_price`, SELL
    /// STOPs with `stop_price >= last_price`. Triggered in stop-price
    /// order (closest to the trigger first).
    pub fn activate_stops(&self, last_price: Decimal) -> Vec<StopEntry> {
        let mut activated = Vec::new();

        let triggered_levels: Vec<PriceLevel> = self
            .buy_stops
            .read()
            .range(..=PriceLevel::from_decimal(last_price))
            .map(|(level, _)| *level)
            .collect();
        {
            let mut guard = self.buy_stops.write();
            for level in triggered_levels {
                if let Some(queue) = guard.remove(&level) {
                    for entry in queue {
                        self.stop_index.remove(&entry.order_id);
                        activated.push(entry);
                    }
                }
            }
        }

        let triggered_levels: Vec<PriceLevel> = self
            .sell_stops
            .read()
            .range(PriceLevel::from_decimal(last_price)..)
            .map(|(level, _)| *level)
            .collect();
        {
            let mut guard = self.sell_stops.write();
            for level in triggered_levels {
                if let Some(queue) = guard.remove(&level) {
                    for entry in queue {
                        self.stop_index.remove(&entry.order_id);
                        activated.push(entry);
                    }
                }
            }
        }

        activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(side: OrderSide, price: Decimal, qty: Decimal) -> OrderEntry {
        OrderEntry {
            order_id: Uuid::new_v4(),
            user_id: "alice".into(),
            side,
            price,
            remaining_quantity: qty,
            created_at: 0,
        }
    }

    #[test]
    fn add_and_cancel() {
        let book = OrderBook::new("BTCUSDT");
        let e = entry(OrderSide::Buy, dec!(100), dec!(1));
        let id = e.order_id;
        book.add_resting(e);
        assert!(book.has_order(id));
        assert_eq!(book.best_bid(), Some(dec!(100)));
        book.remove(id);
        assert!(!book.has_order(id));
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn best_bid_ask_and_spread() {
        let book = OrderBook::new("BTCUSDT");
        book.add_resting(entry(OrderSide::Buy, dec!(99), dec!(1)));
        book.add_resting(entry(OrderSide::Buy, dec!(100), dec!(1)));
        book.add_resting(entry(OrderSide::Sell, dec!(101), dec!(1)));
        book.add_resting(entry(OrderSide::Sell, dec!(102), dec!(1)));
        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.best_ask(), Some(dec!(101)));
    }

    #[test]
    fn fill_top_opposite_respects_price_time_priority() {
        let book = OrderBook::new("BTCUSDT");
        let maker = entry(OrderSide::Sell, dec!(100), dec!(1));
        let maker_id = maker.order_id;
        book.add_resting(maker);
        let top = book.peek_top_opposite(OrderSide::Buy).unwrap();
        assert_eq!(top.order_id, maker_id);
        let fully_filled = book.fill_top_opposite(OrderSide::Buy, maker_id, dec!(0.4));
        assert!(!fully_filled);
        assert!(book.has_order(maker_id));
        let fully_filled = book.fill_top_opposite(OrderSide::Buy, maker_id, dec!(0.6));
        assert!(fully_filled);
        assert!(!book.has_order(maker_id));
    }

    #[test]
    fn depth_aggregates_per_level() {
        let book = OrderBook::new("BTCUSDT");
        book.add_resting(entry(OrderSide::Buy, dec!(100), dec!(1)));
        book.add_resting(entry(OrderSide::Buy, dec!(100), dec!(2)));
        book.add_resting(entry(OrderSide::Buy, dec!(99), dec!(5)));
        let (bids, _asks) = book.depth(10);
        assert_eq!(bids[0], (dec!(100), dec!(3)));
        assert_eq!(bids[1], (dec!(99), dec!(5)));
    }

    #[test]
    fn can_fill_fully_reports_insufficient_liquidity() {
        let book = OrderBook::new("BTCUSDT");
        book.add_resting(entry(OrderSide::Sell, dec!(100), dec!(1)));
        assert!(book.can_fill_fully(OrderSide::Buy, dec!(1), None));
        assert!(!book.can_fill_fully(OrderSide::Buy, dec!(2), None));
    }

    #[test]
    fn activate_stops_triggers_in_direction() {
        let book = OrderBook::new("BTCUSDT");
        book.add_stop(StopEntry {
            order_id: Uuid::new_v4(),
            user_id: "alice".into(),
            side: OrderSide::Buy,
            stop_price: dec!(105),
            limit_price: dec!(0),
            quantity: dec!(1),
            created_at: 0,
        });
        assert!(book.activate_stops(dec!(104)).is_empty());
        let activated = book.activate_stops(dec!(105));
        assert_eq!(activated.len(), 1);
    }
}
