//! Wire/domain data model: orders, trades, and account state.

pub mod account;
pub mod order;
pub mod trade;

/// Opaque user identity. Kept as a plain string rather than a newtype,
/// since nothing in this crate needs to parse or validate its shape.
pub type UserId = String;

/// Milliseconds since the Unix epoch - the timestamp unit used on every
/// wire message and every `Order`/`Trade` record.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
