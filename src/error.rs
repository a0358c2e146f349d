//! Error taxonomy for the exchange core.
//!
//! One `thiserror` enum per subsystem. Validation/business rejections
//! are returned as typed results, never as panics; only a corrupted
//! internal index may panic, and only with a message naming the
//! invariant that broke.

use uuid::Uuid;

/// Closed set of reasons an order can be rejected or expired for.
///
/// Carried on `Order::reject_reason` and serialized as the wire `r` field
/// on `ORDER_TRADE_UPDATE` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    PriceFilter,
    LotSize,
    MinNotional,
    InsufficientBalance,
    NoLiquidity,
    SymbolNotActive,
    DuplicateClientOrderId,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Errors surfaced by the matching engine's public API.
///
/// Ordinary trading rejections (bad price, insufficient balance, no
/// liquidity) are *not* represented here - they are encoded as a
/// `REJECTED`/`EXPIRED` order plus a published event instead. This enum
/// is reserved for `NOT_FOUND` / `FORBIDDEN` / `INVARIANT` class errors:
/// ones returned to the caller with no event.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("symbol not found or not registered: {0}")]
    SymbolNotFound(String),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("order {0} does not belong to the requesting user")]
    Forbidden(Uuid),

    #[error("order {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Errors surfaced by the account ledger.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("amount must be strictly positive")]
    NonPositiveAmount,

    #[error("insufficient free balance: have {have}, need {need}")]
    InsufficientFree {
        have: rust_decimal::Decimal,
        need: rust_decimal::Decimal,
    },

    #[error("insufficient locked balance: have {have}, need {need}")]
    InsufficientLocked {
        have: rust_decimal::Decimal,
        need: rust_decimal::Decimal,
    },
}

/// Errors surfaced by the subscription / auth registry.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("request is not authenticated")]
    Unauthenticated,

    #[error("stream {0} is private and does not belong to the authenticated user")]
    Forbidden(String),

    #[error("api key is not recognized")]
    UnknownApiKey,

    #[error("not a valid stream key: {0}")]
    InvalidStreamKey(String),
}

/// Errors surfaced by the replay controller.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("no data sources configured")]
    NoSources,

    #[error("invalid transition: cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: &'static str },
}
