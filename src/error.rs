//! Engine error types
//!
//! User-facing failures (bad arguments, unknown symbols, insufficient funds)
//! are distinguished from internal ones (illegal state transitions, corrupt
//! records) so the adapter layer can map them to client vs server responses.

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No ticker exists for the requested symbol.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A reservation would drive the free balance negative.
    #[error("insufficient {asset}: need {needed:.8}, free {free:.8}")]
    InsufficientFunds {
        asset: String,
        needed: f64,
        free: f64,
    },

    /// Non-positive amount, missing limit price, malformed symbol, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Order id or asset absent where one is required.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted state transition outside the order state machine.
    /// Never user-caused directly; indicates a bug or a lost race.
    #[error("illegal transition for {oid}: {from} -> {to}")]
    IllegalTransition {
        oid: String,
        from: String,
        to: String,
    },

    /// Ticker older than the configured staleness horizon.
    #[error("ticker for {symbol} is stale ({age_secs:.1}s old)")]
    StaleTicker { symbol: String, age_secs: f64 },

    /// Corrupt record or violated invariant; surfaces as a server error.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ExchangeError {
    /// True for failures caused by the request itself rather than by
    /// engine or store state.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ExchangeError::UnknownSymbol(_)
                | ExchangeError::InsufficientFunds { .. }
                | ExchangeError::InvalidArgument(_)
                | ExchangeError::NotFound(_)
                | ExchangeError::StaleTicker { .. }
        )
    }
}
