//! The matching engine: Accept -> Validate -> Match -> Settle -> Publish,
//! one owner per symbol.

pub mod validation;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::{EngineConfig, SymbolConfig};
use crate::error::{EngineError, RejectReason};
use crate::ledger::AccountManager;
use crate::models::order::{
    ExecutionType, NewOrderRequest, Order, OrderSide, OrderStatus, OrderType, PriceMatchMode, StpMode, TimeInForce,
};
use crate::models::trade::{Trade, TradeHistoryQuery};
use crate::models::{now_millis, UserId};
use crate::notifications::NotificationFanout;
use crate::orderbook::{OrderBook, OrderEntry, StopEntry};

/// Result of `submit_order`: the terminal-or-resting state the order
/// reached by the time the call returns. Matching in this crate runs
/// synchronously inside the per-symbol critical section rather than
/// being deferred to a background task, so unlike a latency-sensitive
/// live venue, the receipt already reflects the outcome of matching -
/// a deliberate simplification in favor of deterministic, immediately
/// observable results, which matters far more for strategy back-testing
/// than shaving matching latency. See DESIGN.md.
#[derive(Debug, Clone)]
pub struct AcceptReceipt {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub reject_reason: Option<RejectReason>,
    pub filled_quantity: Decimal,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    pub orders_accepted: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub trades_executed: AtomicU64,
    pub cancels: AtomicU64,
}

struct TradeTape {
    recent: parking_lot::Mutex<VecDeque<Trade>>,
    capacity: usize,
}

impl TradeTape {
    fn new(capacity: usize) -> Self {
        TradeTape { recent: parking_lot::Mutex::new(VecDeque::new()), capacity }
    }

    fn push(&self, trade: Trade) {
        let mut guard = self.recent.lock();
        guard.push_back(trade);
        if guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    fn query(&self, query: &TradeHistoryQuery) -> Vec<Trade> {
        self.recent
            .lock()
            .iter()
            .rev()
            .filter(|t| query.matches(t))
            .take(query.get_limit())
            .cloned()
            .collect()
    }
}

pub struct MatchingEngine {
    config: EngineConfig,
    books: DashMap<String, Arc<OrderBook>>,
    symbols: DashMap<String, SymbolConfig>,
    symbol_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    orders: DashMap<Uuid, Order>,
    client_order_index: DashMap<(UserId, String), Uuid>,
    trade_tapes: DashMap<String, TradeTape>,
    depth_update_seq: DashMap<String, AtomicU64>,
    ledger: Arc<AccountManager>,
    fanout: Arc<NotificationFanout>,
    pub stats: EngineStats,
}

impl MatchingEngine {
    pub fn new(config: EngineConfig, ledger: Arc<AccountManager>, fanout: Arc<NotificationFanout>) -> Self {
        let symbols = DashMap::new();
        let books = DashMap::new();
        let trade_tapes = DashMap::new();
        let depth_update_seq = DashMap::new();
        for symbol in &config.symbols {
            books.insert(symbol.symbol.clone(), Arc::new(OrderBook::new(symbol.symbol.clone())));
            trade_tapes.insert(symbol.symbol.clone(), TradeTape::new(1000));
            depth_update_seq.insert(symbol.symbol.clone(), AtomicU64::new(0));
            symbols.insert(symbol.symbol.clone(), symbol.clone());
        }
        MatchingEngine {
            config,
            books,
            symbols,
            symbol_locks: DashMap::new(),
            orders: DashMap::new(),
            client_order_index: DashMap::new(),
            trade_tapes,
            depth_update_seq,
            ledger,
            fanout,
            stats: EngineStats::default(),
        }
    }

    pub fn register_symbol(&self, symbol: SymbolConfig) {
        self.books.insert(symbol.symbol.clone(), Arc::new(OrderBook::new(symbol.symbol.clone())));
        self.trade_tapes.insert(symbol.symbol.clone(), TradeTape::new(1000));
        self.depth_update_seq.insert(symbol.symbol.clone(), AtomicU64::new(0));
        self.symbols.insert(symbol.symbol.clone(), symbol);
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks.entry(symbol.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    pub fn order_book(&self, symbol: &str) -> Result<Arc<OrderBook>, EngineError> {
        self.books.get(symbol).map(|b| b.clone()).ok_or_else(|| EngineError::SymbolNotFound(symbol.to_string()))
    }

    pub fn query_order(&self, order_id: Uuid) -> Result<Order, EngineError> {
        self.orders.get(&order_id).map(|o| o.clone()).ok_or(EngineError::OrderNotFound(order_id))
    }

    pub fn query_order_by_client_id(&self, user_id: &str, client_order_id: &str) -> Result<Order, EngineError> {
        let order_id = self
            .client_order_index
            .get(&(user_id.to_string(), client_order_id.to_string()))
            .map(|v| *v)
            .ok_or_else(|| EngineError::OrderNotFound(Uuid::nil()))?;
        self.query_order(order_id)
    }

    pub fn trades(&self, symbol: &str, query: &TradeHistoryQuery) -> Vec<Trade> {
        self.trade_tapes.get(symbol).map(|tape| tape.query(query)).unwrap_or_default()
    }

    /// Submits a new order and runs it through the full pipeline,
    /// including any stop-order cascades it triggers, before returning.
    pub async fn submit_order(&self, req: NewOrderRequest) -> Result<AcceptReceipt, EngineError> {
        let symbol_cfg = self
            .symbols
            .get(&req.symbol)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::SymbolNotFound(req.symbol.clone()))?;

        if let Some(client_order_id) = &req.client_order_id {
            let key = (req.user_id.clone(), client_order_id.clone());
            if self.client_order_index.contains_key(&key) {
                let order_id = Uuid::new_v4();
                let mut order = Order::new(&req, order_id, now_millis());
                order.reject(RejectReason::DuplicateClientOrderId, order.created_at);
                self.orders.insert(order_id, order.clone());
                self.fanout.publish_order_update(&order, ExecutionType::Rejected, None);
                self.stats.orders_rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(receipt_of(&order));
            }
        }

        let lock = self.symbol_lock(&req.symbol);
        let _guard = lock.lock().await;

        let book = self.order_book(&req.symbol)?;
        let order_id = Uuid::new_v4();
        let mut initial = Order::new(&req, order_id, now_millis());
        if initial.self_trade_prevention == StpMode::None {
            initial.self_trade_prevention = self.config.stp_default;
        }

        let mut reentry: VecDeque<Order> = VecDeque::new();
        let final_order = self.execute_one(initial, &book, &symbol_cfg, &mut reentry);
        let receipt = receipt_of(&final_order);

        while let Some(activated) = reentry.pop_front() {
            self.execute_one(activated, &book, &symbol_cfg, &mut reentry);
        }

        Ok(receipt)
    }

    pub async fn cancel_order(&self, order_id: Uuid, requesting_user_id: &str) -> Result<(), EngineError> {
        let symbol = {
            let order = self.orders.get(&order_id).ok_or(EngineError::OrderNotFound(order_id))?;
            if order.is_terminal() {
                return Err(EngineError::AlreadyTerminal(order_id));
            }
            if order.user_id != requesting_user_id {
                return Err(EngineError::Forbidden(order_id));
            }
            order.symbol.clone()
        };
        let symbol_cfg = self.symbols.get(&symbol).map(|s| s.clone()).ok_or_else(|| EngineError::SymbolNotFound(symbol.clone()))?;
        let lock = self.symbol_lock(&symbol);
        let _guard = lock.lock().await;

        let mut order = self.orders.get_mut(&order_id).ok_or(EngineError::OrderNotFound(order_id))?;
        if order.is_terminal() {
            return Err(EngineError::AlreadyTerminal(order_id));
        }
        let book = self.order_book(&symbol)?;
        if book.remove(order_id).is_none() {
            book.remove_stop(order_id);
        }
        order.status = OrderStatus::Canceled;
        order.updated_at = now_millis();
        release_reservation(&mut order, &symbol_cfg, &self.ledger);
        let snapshot = order.clone();
        drop(order);
        self.stats.cancels.fetch_add(1, Ordering::Relaxed);
        self.fanout.publish_order_update(&snapshot, ExecutionType::Canceled, None);
        self.publish_account_update(&snapshot.user_id);
        Ok(())
    }

    fn publish_account_update(&self, user_id: &str) {
        if let Some(snapshot) = self.ledger.snapshot(user_id) {
            self.fanout.publish_account(&snapshot);
        }
    }

    fn next_depth_update_id(&self, symbol: &str) -> u64 {
        self.depth_update_seq.get(symbol).map(|c| c.fetch_add(1, Ordering::Relaxed)).unwrap_or(0)
    }

    /// Runs one order through validate -> (FOK pre-check) -> lock funds
    /// -> match -> residual handling -> publish. `reentry` collects any
    /// stop orders this order's trades trigger, to be run through this
    /// same function afterward, inside the same critical section.
    fn execute_one(&self, mut order: Order, book: &Arc<OrderBook>, symbol_cfg: &SymbolConfig, reentry: &mut VecDeque<Order>) -> Order {
        let now = now_millis();

        let req_snapshot = NewOrderRequest {
            user_id: order.user_id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
            self_trade_prevention: order.self_trade_prevention,
            price_match: order.price_match,
        };
        if let Err(reason) = validation::validate(&req_snapshot, symbol_cfg) {
            order.reject(reason, now);
            self.finalize(&mut order);
            self.fanout.publish_order_update(&order, ExecutionType::Rejected, None);
            self.stats.orders_rejected.fetch_add(1, Ordering::Relaxed);
            return order;
        }

        if order.order_type.is_stop() {
            let stop_price = order.stop_price.expect("validated: stop orders carry a stop_price");
            let limit_price = if order.order_type == OrderType::StopLimit { order.price } else { Decimal::ZERO };
            book.add_stop(StopEntry {
                order_id: order.order_id,
                user_id: order.user_id.clone(),
                side: order.side,
                stop_price,
                limit_price,
                quantity: order.quantity,
                created_at: order.created_at,
            });
            self.orders.insert(order.order_id, order.clone());
            if let Some(client_order_id) = &order.client_order_id {
                self.client_order_index.insert((order.user_id.clone(), client_order_id.clone()), order.order_id);
            }
            self.fanout.publish_order_update(&order, ExecutionType::New, None);
            self.stats.orders_accepted.fetch_add(1, Ordering::Relaxed);
            return order;
        }

        let effective_price = match resolve_price(&order, book) {
            Ok(p) => p,
            Err(reason) => {
                order.status = OrderStatus::Expired;
                order.reject_reason = Some(reason);
                order.updated_at = now;
                self.finalize(&mut order);
                self.fanout.publish_order_update(&order, ExecutionType::Expired, None);
                self.stats.orders_rejected.fetch_add(1, Ordering::Relaxed);
                return order;
            }
        };
        if order.order_type != OrderType::Market {
            if let Some(p) = effective_price {
                order.price = p;
            }
        }
        let match_limit: Option<Decimal> = if order.order_type == OrderType::Market { None } else { Some(effective_price.unwrap_or(order.price)) };

        if order.time_in_force == TimeInForce::Fok {
            let feasible = book.can_fill_fully(order.side, order.remaining(), match_limit);
            if !feasible {
                order.status = OrderStatus::Canceled;
                order.updated_at = now;
                self.finalize(&mut order);
                self.fanout.publish_order_update(&order, ExecutionType::Canceled, None);
                return order;
            }
        }

        let lock_price = match order.side {
            OrderSide::Buy => match order.order_type {
                OrderType::Market => match effective_price {
                    Some(p) => p,
                    None => {
                        let Some(best_ask) = book.best_ask() else {
                            order.status = OrderStatus::Expired;
                            order.reject_reason = Some(RejectReason::NoLiquidity);
                            order.updated_at = now;
                            self.finalize(&mut order);
                            self.fanout.publish_order_update(&order, ExecutionType::Expired, None);
                            return order;
                        };
                        let slippage = self.config.market_slippage_bps / Decimal::from(10_000);
                        best_ask * (Decimal::ONE + slippage)
                    }
                },
                _ => effective_price.unwrap_or(order.price),
            },
            OrderSide::Sell => Decimal::ZERO,
        };

        let lock_amount = match order.side {
            OrderSide::Buy => order.quantity * lock_price,
            OrderSide::Sell => order.quantity,
        };
        let lock_asset = match order.side {
            OrderSide::Buy => &symbol_cfg.quote_asset,
            OrderSide::Sell => &symbol_cfg.base_asset,
        };
        if let Err(_) = self.ledger.lock_funds(&order.user_id, lock_asset, lock_amount) {
            order.reject(RejectReason::InsufficientBalance, now);
            self.finalize(&mut order);
            self.fanout.publish_order_update(&order, ExecutionType::Rejected, None);
            self.stats.orders_rejected.fetch_add(1, Ordering::Relaxed);
            return order;
        }
        match order.side {
            OrderSide::Buy => order.reserved_quote = lock_amount,
            OrderSide::Sell => order.reserved_base = lock_amount,
        }

        self.orders.insert(order.order_id, order.clone());
        if let Some(client_order_id) = &order.client_order_id {
            self.client_order_index.insert((order.user_id.clone(), client_order_id.clone()), order.order_id);
        }
        self.fanout.publish_order_update(&order, ExecutionType::New, None);
        self.stats.orders_accepted.fetch_add(1, Ordering::Relaxed);

        let mut trades_out: Vec<Trade> = Vec::new();

        loop {
            if order.remaining().is_zero() {
                break;
            }
            let Some(maker) = book.peek_top_opposite(order.side) else { break };

            if let Some(limit) = match_limit {
                let incompatible = match order.side {
                    OrderSide::Buy => maker.price > limit,
                    OrderSide::Sell => maker.price < limit,
                };
                if incompatible {
                    break;
                }
            }

            if maker.user_id == order.user_id {
                match order.self_trade_prevention {
                    StpMode::None => {}
                    StpMode::ExpireTaker => {
                        order.status = OrderStatus::ExpiredInMatch;
                        order.updated_at = now_millis();
                        break;
                    }
                    StpMode::ExpireMaker => {
                        self.expire_stp_maker(&maker, book, symbol_cfg);
                        continue;
                    }
                    StpMode::ExpireBoth => {
                        self.expire_stp_maker(&maker, book, symbol_cfg);
                        order.status = OrderStatus::ExpiredInMatch;
                        order.updated_at = now_millis();
                        break;
                    }
                }
            }

            let fill_qty = order.remaining().min(maker.remaining_quantity);
            let trade_price = maker.price;
            let fully_filled_maker = book.fill_top_opposite(order.side, maker.order_id, fill_qty);
            let now_trade = now_millis();

            let trade = Trade {
                trade_id: book.next_trade_id(),
                symbol: order.symbol.clone(),
                price: trade_price,
                quantity: fill_qty,
                buy_order_id: if order.side == OrderSide::Buy { order.order_id } else { maker.order_id },
                sell_order_id: if order.side == OrderSide::Sell { order.order_id } else { maker.order_id },
                buyer_user_id: if order.side == OrderSide::Buy { order.user_id.clone() } else { maker.user_id.clone() },
                seller_user_id: if order.side == OrderSide::Sell { order.user_id.clone() } else { maker.user_id.clone() },
                timestamp: now_trade,
                is_buyer_maker: maker.side == OrderSide::Buy,
            };

            order.record_fill(fill_qty, trade_price, now_trade);
            decrement_reservation(&mut order, &trade);
            self.fanout.publish_order_update(&order, ExecutionType::Trade, Some((trade_price, fill_qty)));
            if let Some(mut maker_order) = self.orders.get_mut(&maker.order_id) {
                maker_order.record_fill(fill_qty, trade_price, now_trade);
                decrement_reservation(&mut maker_order, &trade);
                let snapshot = maker_order.clone();
                drop(maker_order);
                self.fanout.publish_order_update(&snapshot, ExecutionType::Trade, Some((trade_price, fill_qty)));
                self.publish_account_update(&snapshot.user_id);
            }
            let _ = fully_filled_maker;

            self.ledger.settle_trade(&trade, &symbol_cfg.base_asset, &symbol_cfg.quote_asset, &self.config.fee_config);

            book.set_last_trade_price(trade_price);
            self.trade_tapes.get(&order.symbol).map(|t| t.push(trade.clone()));
            self.stats.trades_executed.fetch_add(1, Ordering::Relaxed);
            self.fanout.publish_trade(&trade);
            let update_id = self.next_depth_update_id(&order.symbol);
            self.fanout.publish_depth(book, update_id);
            trades_out.push(trade.clone());

            self.publish_account_update(&order.user_id);

            for activated_stop in book.activate_stops(trade_price) {
                reentry.push_back(stop_to_order(&activated_stop, &order.symbol));
            }
        }

        let mut resting = false;
        if !order.is_terminal() && order.order_type.is_limit_class() && order.remaining() > Decimal::ZERO {
            match order.time_in_force {
                TimeInForce::Gtc => {
                    book.add_resting(OrderEntry {
                        order_id: order.order_id,
                        user_id: order.user_id.clone(),
                        side: order.side,
                        price: order.price,
                        remaining_quantity: order.remaining(),
                        created_at: order.created_at,
                    });
                    resting = true;
                }
                TimeInForce::Ioc | TimeInForce::Fok => {
                    order.status = OrderStatus::Canceled;
                    order.updated_at = now_millis();
                }
            }
        } else if order.order_type == OrderType::Market && !order.remaining().is_zero() && order.status != OrderStatus::ExpiredInMatch {
            order.status = OrderStatus::Expired;
            order.reject_reason = Some(RejectReason::NoLiquidity);
            order.updated_at = now_millis();
        }

        if !resting {
            release_reservation(&mut order, symbol_cfg, &self.ledger);
        }

        self.finalize(&mut order);

        // A fill already emits its own ORDER_TRADE_UPDATE from inside the
        // match loop; only publish again here if something happened
        // afterward that the last in-loop event didn't capture yet (IOC/FOK
        // residual cancellation, a market order left without liquidity). A
        // plain resting or fully-filled order with no such transition would
        // otherwise get an exact duplicate of its last in-loop event.
        let already_covered_by_loop =
            !trades_out.is_empty() && matches!(order.status, OrderStatus::Filled | OrderStatus::PartiallyFilled);
        if !already_covered_by_loop && !(order.status == OrderStatus::New && trades_out.is_empty()) {
            let execution_type = match order.status {
                OrderStatus::Filled | OrderStatus::PartiallyFilled => ExecutionType::Trade,
                OrderStatus::Canceled => ExecutionType::Canceled,
                OrderStatus::Rejected => ExecutionType::Rejected,
                OrderStatus::Expired | OrderStatus::ExpiredInMatch => ExecutionType::Expired,
                OrderStatus::New => ExecutionType::New,
            };
            self.fanout.publish_order_update(&order, execution_type, None);
        }
        if !trades_out.is_empty() {
            self.publish_account_update(&order.user_id);
        }

        order
    }

    fn expire_stp_maker(&self, maker: &OrderEntry, book: &Arc<OrderBook>, symbol_cfg: &SymbolConfig) {
        book.remove(maker.order_id);
        if let Some(mut maker_order) = self.orders.get_mut(&maker.order_id) {
            maker_order.status = OrderStatus::ExpiredInMatch;
            maker_order.updated_at = now_millis();
            release_reservation(&mut maker_order, symbol_cfg, &self.ledger);
            let snapshot = maker_order.clone();
            drop(maker_order);
            self.fanout.publish_order_update(&snapshot, ExecutionType::Expired, None);
            self.publish_account_update(&snapshot.user_id);
        }
    }

    fn finalize(&self, order: &mut Order) {
        self.orders.insert(order.order_id, order.clone());
    }
}

/// Decrements an order's live reservation by exactly what this fill just
/// consumed from the ledger, whichever side of the trade it was on.
/// Whatever remains after an order stops resting is released in full by
/// `release_reservation` - no separate delta bookkeeping needed.
fn decrement_reservation(order: &mut Order, trade: &Trade) {
    if order.order_id == trade.buy_order_id {
        order.reserved_quote -= trade.notional();
    } else if order.order_id == trade.sell_order_id {
        order.reserved_base -= trade.quantity;
    }
}

fn stop_to_order(stop: &StopEntry, symbol: &str) -> Order {
    let order_type = match stop.limit_price.is_zero() {
        true => OrderType::Market,
        false => OrderType::Limit,
    };
    let req = NewOrderRequest {
        user_id: stop.user_id.clone(),
        client_order_id: None,
        symbol: symbol.to_string(),
        side: stop.side,
        order_type,
        quantity: stop.quantity,
        price: stop.limit_price,
        stop_price: Some(stop.stop_price),
        time_in_force: TimeInForce::Gtc,
        self_trade_prevention: StpMode::None,
        price_match: PriceMatchMode::None,
    };
    Order::new(&req, stop.order_id, now_millis())
}

/// Computes the order's effective matching limit price given its
/// `price_match` hint, or `Err` if the order must be rejected for lack
/// of an opposite side to peg to (MARKET + price_match with an empty
/// book).
fn resolve_price(order: &Order, book: &OrderBook) -> Result<Option<Decimal>, RejectReason> {
    let reference = match order.price_match {
        PriceMatchMode::None => return Ok(None),
        PriceMatchMode::Opponent => match order.side {
            OrderSide::Buy => book.best_ask(),
            OrderSide::Sell => book.best_bid(),
        },
        PriceMatchMode::Queue => match order.side {
            OrderSide::Buy => book.best_bid(),
            OrderSide::Sell => book.best_ask(),
        },
    };
    match reference {
        Some(p) => Ok(Some(p)),
        None if order.order_type == OrderType::Market => Err(RejectReason::NoLiquidity),
        None => Ok(Some(order.price)),
    }
}

fn release_reservation(order: &mut Order, symbol_cfg: &SymbolConfig, ledger: &AccountManager) {
    match order.side {
        OrderSide::Buy => {
            if order.reserved_quote > Decimal::ZERO {
                let _ = ledger.unlock_funds(&order.user_id, &symbol_cfg.quote_asset, order.reserved_quote);
                order.reserved_quote = Decimal::ZERO;
            }
        }
        OrderSide::Sell => {
            if order.reserved_base > Decimal::ZERO {
                let _ = ledger.unlock_funds(&order.user_id, &symbol_cfg.base_asset, order.reserved_base);
                order.reserved_base = Decimal::ZERO;
            }
        }
    }
}

fn receipt_of(order: &Order) -> AcceptReceipt {
    AcceptReceipt {
        order_id: order.order_id,
        status: order.status,
        reject_reason: order.reject_reason,
        filled_quantity: order.filled_quantity,
    }
}
