//! Market view: read-only facade over the externally-fed ticker hashes
//!
//! An out-of-process feeder writes `sym_<SYMBOL>` hashes; the engine only
//! ever reads them. Prices are passed through untouched; any rounding
//! happens at display time.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExchangeError, Result};
use crate::store::Store;
use crate::types::{Symbol, Ticker};

pub const TICKER_PREFIX: &str = "sym_";

pub fn ticker_key(symbol: &Symbol) -> String {
    format!("{TICKER_PREFIX}{symbol}")
}

/// Bid/ask/last snapshot for one symbol.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MarketQuote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub ts: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct MarketView {
    store: Arc<dyn Store>,
}

impl MarketView {
    pub fn new(store: Arc<dyn Store>) -> Self {
        MarketView { store }
    }

    /// Full ticker row; `UnknownSymbol` when the feeder has never written
    /// this symbol.
    pub async fn ticker(&self, symbol: &Symbol) -> Result<Ticker> {
        let key = ticker_key(symbol);
        let fields = self.store.hget_all(&key).await?;
        if fields.is_empty() {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        Ticker::from_fields(&key, symbol.clone(), &fields)
    }

    /// Last traded price for `symbol`.
    pub async fn last_price(&self, symbol: &Symbol) -> Result<f64> {
        Ok(self.ticker(symbol).await?.price)
    }

    pub async fn quote(&self, symbol: &Symbol) -> Result<MarketQuote> {
        let ticker = self.ticker(symbol).await?;
        Ok(MarketQuote {
            bid: ticker.bid,
            ask: ticker.ask,
            last: ticker.price,
            ts: ticker.timestamp,
        })
    }

    /// True when the feed for `symbol` is older than `max_age`.
    pub async fn is_stale(&self, symbol: &Symbol, max_age: Duration) -> Result<bool> {
        let ticker = self.ticker(symbol).await?;
        Ok(ticker.age_secs(Utc::now()) > max_age.as_secs_f64())
    }

    /// All symbols the feeder has written. Key-space scan; background and
    /// admin use only.
    pub async fn list_symbols(&self) -> Result<Vec<Symbol>> {
        let keys = self.store.keys_with_prefix(TICKER_PREFIX).await?;
        Ok(keys
            .iter()
            .map(|k| Symbol::new(&k[TICKER_PREFIX.len()..]))
            .collect())
    }
}
