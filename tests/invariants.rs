//! Property-based invariant checks over randomized order sequences,
//! following the pattern other retrieved order-book crates use
//! (`proptest` generating sequences of book operations, checked against
//! closed-form invariants rather than fixed expected outputs).

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use spot_exchange_core::config::{EngineConfig, FeeConfig, FeeRate, SymbolConfig};
use spot_exchange_core::eventbus::EventBus;
use spot_exchange_core::ledger::AccountManager;
use spot_exchange_core::matching::MatchingEngine;
use spot_exchange_core::models::order::{NewOrderRequest, OrderSide, OrderType, PriceMatchMode, StpMode, TimeInForce};
use spot_exchange_core::notifications::NotificationFanout;

fn symbol() -> SymbolConfig {
    SymbolConfig {
        symbol: "BTCUSDT".to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USDT".to_string(),
        tick_size: dec!(1),
        lot_size: dec!(0.01),
        min_notional: dec!(1),
        active: true,
    }
}

fn engine_with_funded_users(user_count: u32) -> (Arc<MatchingEngine>, Arc<AccountManager>) {
    let mut config = EngineConfig::default();
    config.symbols.push(symbol());
    config.fee_config = FeeConfig { default_rate: FeeRate { maker: dec!(0.001), taker: dec!(0.001) }, per_symbol: HashMap::new() };
    let bus = EventBus::new(config.event_bus.clone());
    bus.start();
    let fanout = Arc::new(NotificationFanout::new(bus));
    let ledger = Arc::new(AccountManager::new());
    for i in 0..user_count {
        let user = format!("user{i}");
        ledger.deposit(&user, "USDT", dec!(1_000_000)).unwrap();
        ledger.deposit(&user, "BTC", dec!(1000)).unwrap();
    }
    let engine = Arc::new(MatchingEngine::new(config, Arc::clone(&ledger), fanout));
    (engine, ledger)
}

#[derive(Debug, Clone)]
struct OrderOp {
    user: u32,
    side: bool,
    price_ticks: u32,
    quantity_hundredths: u32,
}

fn order_op_strategy() -> impl Strategy<Value = OrderOp> {
    (0u32..4, any::<bool>(), 90u32..110, 1u32..50)
        .prop_map(|(user, side, price_ticks, quantity_hundredths)| OrderOp { user, side, price_ticks, quantity_hundredths })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After any sequence of GTC limit orders from a small pool of
    /// funded users, the book is never crossed: best_bid < best_ask
    /// whenever both sides are non-empty.
    #[test]
    fn book_never_crosses(ops in prop::collection::vec(order_op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (engine, _ledger) = engine_with_funded_users(4);
            for op in ops {
                let side = if op.side { OrderSide::Buy } else { OrderSide::Sell };
                let price = Decimal::from(op.price_ticks);
                let quantity = Decimal::from(op.quantity_hundredths) / dec!(100);
                let req = NewOrderRequest {
                    user_id: format!("user{}", op.user),
                    client_order_id: None,
                    symbol: "BTCUSDT".to_string(),
                    side,
                    order_type: OrderType::Limit,
                    quantity,
                    price,
                    stop_price: None,
                    time_in_force: TimeInForce::Gtc,
                    self_trade_prevention: StpMode::None,
                    price_match: PriceMatchMode::None,
                };
                let _ = engine.submit_order(req).await;

                let book = engine.order_book("BTCUSDT").unwrap();
                if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                    prop_assert!(bid < ask, "book crossed: bid {bid} >= ask {ask}");
                }
            }
        });
    }

    /// No matter what sequence of deposits/locks/unlocks an account goes
    /// through, free and locked balances never go negative.
    #[test]
    fn balances_never_go_negative(amounts in prop::collection::vec(1u32..5000, 1..60)) {
        let ledger = AccountManager::new();
        ledger.deposit("trader", "USDT", dec!(100000)).unwrap();
        for (i, amount) in amounts.into_iter().enumerate() {
            let delta = Decimal::from(amount) / dec!(100);
            if i % 2 == 0 {
                let _ = ledger.lock_funds("trader", "USDT", delta);
            } else {
                let _ = ledger.unlock_funds("trader", "USDT", delta);
            }
            let snapshot = ledger.snapshot("trader").unwrap();
            let (_, balance) = snapshot.balances.iter().find(|(a, _)| a == "USDT").unwrap();
            prop_assert!(balance.free >= Decimal::ZERO);
            prop_assert!(balance.locked >= Decimal::ZERO);
        }
    }
}

/// For every order that reaches FILLED, filled_quantity equals the
/// original quantity exactly - no over- or under-fill.
#[tokio::test]
async fn filled_orders_conserve_quantity() {
    let (engine, _ledger) = engine_with_funded_users(2);

    let sell = NewOrderRequest {
        user_id: "user0".to_string(),
        client_order_id: None,
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Sell,
        order_type: OrderType::Limit,
        quantity: dec!(5),
        price: dec!(100),
        stop_price: None,
        time_in_force: TimeInForce::Gtc,
        self_trade_prevention: StpMode::None,
        price_match: PriceMatchMode::None,
    };
    engine.submit_order(sell).await.unwrap();

    let mut buy = NewOrderRequest {
        user_id: "user1".to_string(),
        client_order_id: None,
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        quantity: dec!(5),
        price: dec!(100),
        stop_price: None,
        time_in_force: TimeInForce::Gtc,
        self_trade_prevention: StpMode::None,
        price_match: PriceMatchMode::None,
    };
    buy.client_order_id = Some("co-1".to_string());
    let receipt = engine.submit_order(buy).await.unwrap();

    let order = engine.query_order(receipt.order_id).unwrap();
    assert_eq!(order.filled_quantity, order.quantity);
}
