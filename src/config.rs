//! Programmatic configuration for the exchange core.
//!
//! `EngineConfig` is the primary construction path: build one in code
//! and hand it to `ExchangeCore::new`. `load()` is sugar on top - an
//! env/TOML overlay atop `EngineConfig::default()` - for harness and
//! test setups that want that instead of a literal.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::order::StpMode;

/// Static per-symbol trading rules: asset pairing and the `PRICE_FILTER`
/// / `LOT_SIZE` / `MIN_NOTIONAL` tick parameters validation checks against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_notional: Decimal,
    pub active: bool,
}

/// Maker/taker fee rates as a fraction of trade notional (e.g. `0.001`
/// for 10 bps).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRate {
    pub maker: Decimal,
    pub taker: Decimal,
}

impl Default for FeeRate {
    fn default() -> Self {
        FeeRate {
            maker: Decimal::new(1, 3),
            taker: Decimal::new(1, 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub default_rate: FeeRate,
    pub per_symbol: HashMap<String, FeeRate>,
}

impl Default for FeeConfig {
    fn default() -> Self {
        FeeConfig {
            default_rate: FeeRate::default(),
            per_symbol: HashMap::new(),
        }
    }
}

impl FeeConfig {
    pub fn rate_for(&self, symbol: &str) -> FeeRate {
        self.per_symbol.get(symbol).copied().unwrap_or(self.default_rate)
    }
}

/// Replay controller playback speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Dispatch records as fast as the consumer can keep up; no sleeping.
    Backtest,
    /// Sleep between records for the real wall-clock delta between their
    /// timestamps.
    Realtime,
    /// Like `Realtime`, but the inter-record delay is divided by `factor`.
    Accelerated(f64),
    /// Dispatch exactly one record per explicit `step()` call.
    Stepped,
}

/// Event bus overflow behavior when a stream's bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Evict the oldest event destined for a low-priority subscriber set;
    /// falls back to the literal oldest event if none qualifies.
    DropOldestLowPriority,
    /// Reject the incoming event outright, leaving the queue untouched.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Total queue capacity, divided across `dispatch_workers` shards.
    pub queue_capacity: usize,
    pub dispatch_workers: usize,
    pub backpressure_policy: BackpressurePolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig {
            queue_capacity: 4096,
            dispatch_workers: 4,
            backpressure_policy: BackpressurePolicy::DropOldestLowPriority,
        }
    }
}

/// Top-level programmatic configuration for the whole exchange core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<SymbolConfig>,
    pub fee_config: FeeConfig,
    pub event_bus: EventBusConfig,
    pub replay_mode: ReplayMode,
    pub stp_default: StpMode,
    /// Slippage envelope applied to the conservative lock bound computed
    /// for a MARKET buy with no `price_match` hint, in basis points.
    pub market_slippage_bps: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            symbols: Vec::new(),
            fee_config: FeeConfig::default(),
            event_bus: EventBusConfig::default(),
            replay_mode: ReplayMode::Backtest,
            stp_default: StpMode::None,
            market_slippage_bps: Decimal::new(500, 0),
        }
    }
}

impl EngineConfig {
    /// Loads an `EngineConfig` from environment variables (prefixed
    /// `EXCHANGE_`) and an optional `config.toml`, overlaying them on top
    /// of `EngineConfig::default()`. Most callers should just build an
    /// `EngineConfig` literal instead.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("EXCHANGE").separator("__"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_config_falls_back_to_default() {
        let cfg = FeeConfig::default();
        let rate = cfg.rate_for("BTCUSDT");
        assert_eq!(rate.maker, Decimal::new(1, 3));
    }

    #[test]
    fn fee_config_honors_per_symbol_override() {
        let mut cfg = FeeConfig::default();
        cfg.per_symbol.insert(
            "BTCUSDT".to_string(),
            FeeRate { maker: Decimal::ZERO, taker: Decimal::new(2, 3) },
        );
        assert_eq!(cfg.rate_for("BTCUSDT").maker, Decimal::ZERO);
        assert_eq!(cfg.rate_for("ETHUSDT").maker, Decimal::new(1, 3));
    }
}
