//! Fixed-precision money and the scaled integer key used for book levels.
//!
//! All monetary quantities (price, quantity, balances, fees) flow through
//! `rust_decimal::Decimal`, which carries a 96-bit mantissa - plenty of
//! headroom for the >=18 integer digit / 8 fractional digit precision the
//! data model requires, with no binary-float rounding on any settlement
//! path.
//!
//! `PriceLevel` is the scaled-integer key `BTreeMap` uses for book levels,
//! generalizing the matching layer's original `i64`-scaled wrapper to
//! `i128` so eighteen integer digits times an eight-digit scale factor
//! cannot overflow.

use rust_decimal::Decimal;

/// Fractional digits carried by a `PriceLevel` key.
pub const SCALE: u32 = 8;

/// A price (or stop-trigger price) scaled to a fixed-point integer so it
/// can key a `BTreeMap` with exact, total ordering - no float comparison,
/// no repeated rescaling on every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceLevel(i128);

impl PriceLevel {
    pub fn from_decimal(value: Decimal) -> Self {
        let scaled = value
            .round_dp(SCALE)
            .mantissa_with_scale(SCALE)
            .unwrap_or_else(|| {
                // Falls back to an explicit rescale if the value's native
                // scale differs from SCALE (e.g. an integer price).
                let rescaled = value.round_dp(SCALE);
                rescale_mantissa(rescaled)
            });
        PriceLevel(scaled)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0, SCALE)
    }

    pub fn raw(self) -> i128 {
        self.0
    }
}

/// Re-scales a `Decimal` already rounded to `SCALE` fractional digits into
/// its `i128` mantissa at that scale, regardless of its stored scale.
fn rescale_mantissa(value: Decimal) -> i128 {
    let mut v = value;
    v.rescale(SCALE);
    // `rescale` guarantees `v.scale() == SCALE`, so `mantissa` is exactly
    // the scaled integer we want.
    v.mantissa()
}

trait MantissaWithScale {
    fn mantissa_with_scale(self, scale: u32) -> Option<i128>;
}

impl MantissaWithScale for Decimal {
    fn mantissa_with_scale(self, scale: u32) -> Option<i128> {
        if self.scale() == scale {
            Some(self.mantissa())
        } else {
            None
        }
    }
}

/// Returns `true` if `value` is an exact integer multiple of `step`
/// (used for `PRICE_FILTER` / `LOT_SIZE` tick-size validation). `step`
/// of zero disables the check.
pub fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step.is_zero() {
        return true;
    }
    (value % step).is_zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_level_round_trips() {
        let p = dec!(50123.45670000);
        let level = PriceLevel::from_decimal(p);
        assert_eq!(level.to_decimal(), p);
    }

    #[test]
    fn price_level_orders_numerically() {
        let low = PriceLevel::from_decimal(dec!(100));
        let high = PriceLevel::from_decimal(dec!(100.00000001));
        assert!(low < high);
    }

    #[test]
    fn integer_price_rescales_cleanly() {
        let p = dec!(50000);
        let level = PriceLevel::from_decimal(p);
        assert_eq!(level.to_decimal(), dec!(50000.00000000));
    }

    #[test]
    fn multiple_of_step() {
        assert!(is_multiple_of(dec!(50000.50), dec!(0.01)));
        assert!(!is_multiple_of(dec!(50000.505), dec!(0.01)));
        assert!(is_multiple_of(dec!(1.23), Decimal::ZERO));
    }
}
