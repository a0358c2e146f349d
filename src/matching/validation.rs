//! Static order validation: the `PRICE_FILTER` / `LOT_SIZE` /
//! `MIN_NOTIONAL` checks every order runs before it ever touches the
//! book.

use rust_decimal::Decimal;

use crate::config::SymbolConfig;
use crate::decimal::is_multiple_of;
use crate::error::RejectReason;
use crate::models::order::{NewOrderRequest, OrderType, PriceMatchMode};

pub fn validate(req: &NewOrderRequest, symbol: &SymbolConfig) -> Result<(), RejectReason> {
    if !symbol.active {
        return Err(RejectReason::SymbolNotActive);
    }
    if req.quantity <= Decimal::ZERO {
        return Err(RejectReason::LotSize);
    }
    if req.quantity < symbol.lot_size || !is_multiple_of(req.quantity, symbol.lot_size) {
        return Err(RejectReason::LotSize);
    }
    if req.order_type.is_stop() && req.stop_price.filter(|p| *p > Decimal::ZERO).is_none() {
        return Err(RejectReason::PriceFilter);
    }

    // A price_match hint resolves the limit price at match time, so the
    // submitted price is only meaningful (and only validated) for plain
    // LIMIT/STOP_LIMIT orders.
    let needs_price_filter = req.order_type.is_limit_class() && req.price_match == PriceMatchMode::None;
    if needs_price_filter {
        if req.price <= Decimal::ZERO {
            return Err(RejectReason::PriceFilter);
        }
        if !is_multiple_of(req.price, symbol.tick_size) {
            return Err(RejectReason::PriceFilter);
        }
        if req.price * req.quantity < symbol.min_notional {
            return Err(RejectReason::MinNotional);
        }
    }

    if req.order_type == OrderType::Market && req.price_match == PriceMatchMode::None {
        // Plain market orders carry no client-supplied price; nothing
        // further to check here, liquidity is checked at match time.
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn symbol() -> SymbolConfig {
        SymbolConfig {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            tick_size: dec!(0.01),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
            active: true,
        }
    }

    fn limit_request(price: Decimal, quantity: Decimal) -> NewOrderRequest {
        NewOrderRequest {
            user_id: "alice".into(),
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            side: crate::models::order::OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity,
            price,
            stop_price: None,
            time_in_force: Default::default(),
            self_trade_prevention: Default::default(),
            price_match: PriceMatchMode::None,
        }
    }

    #[test]
    fn rejects_price_off_tick() {
        let req = limit_request(dec!(50000.005), dec!(1));
        assert_eq!(validate(&req, &symbol()), Err(RejectReason::PriceFilter));
    }

    #[test]
    fn rejects_quantity_below_lot_size() {
        let req = limit_request(dec!(50000), dec!(0.0001));
        assert_eq!(validate(&req, &symbol()), Err(RejectReason::LotSize));
    }

    #[test]
    fn rejects_below_min_notional() {
        let req = limit_request(dec!(1), dec!(0.001));
        assert_eq!(validate(&req, &symbol()), Err(RejectReason::MinNotional));
    }

    #[test]
    fn accepts_valid_order() {
        let req = limit_request(dec!(50000.01), dec!(0.01));
        assert_eq!(validate(&req, &symbol()), Ok(()));
    }
}
