//! Error taxonomy.
//!
//! Domain errors are `thiserror` enums; the binary boundary uses
//! `anyhow::Result`. Transient exchange errors are retryable with backoff,
//! everything else either skips the current cycle or aborts startup.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Startup configuration failure. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors from the exchange boundary (live REST client or paper exchange).
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("exchange rejected order: {0}")]
    Rejected(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("unexpected exchange response: {0}")]
    Protocol(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying with backoff; rejections and
    /// protocol errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::Timeout(_))
    }
}

/// Errors from the position store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on position {id}: expected {expected}, found {found}")]
    VersionConflict {
        id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("position {0} is terminal and cannot be modified")]
    Terminal(Uuid),

    #[error("max concurrent positions reached: {current}/{max}")]
    CapExceeded { current: usize, max: usize },

    #[error("state persistence failed: {0}")]
    Persistence(String),
}

/// Top-level trading errors surfaced by the executor, lifecycle engine and
/// reconciler.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("computed quantity {quantity} below exchange minimum {minimum} for {symbol}")]
    InsufficientSize {
        symbol: String,
        quantity: Decimal,
        minimum: Decimal,
    },

    #[error("max concurrent positions reached: {current}/{max}")]
    MaxPositionsExceeded { current: usize, max: usize },

    #[error("position {id} left without catastrophe stop: {detail}")]
    UnprotectedPosition { id: Uuid, detail: String },

    #[error("fill for order {order_id} unconfirmed after {attempts} attempts")]
    FillUnconfirmed { order_id: String, attempts: u32 },

    #[error("local state diverged from exchange for position {id}: {detail}")]
    ReconciliationMismatch { id: Uuid, detail: String },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
