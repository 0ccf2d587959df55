//! Core data types: symbols, sides, order records, tickers, balances
//!
//! Everything the engine persists is a flat string-field hash in the store,
//! so each record type carries `to_fields` / `from_fields` converters. All
//! monetary quantities are `f64`; comparisons use [`AMOUNT_EPSILON`] and
//! rounding is applied only when formatting for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ExchangeError;

/// Tolerance for monetary comparisons. Reservation arithmetic goes through
/// the store's float fields, so exact equality is never assumed.
pub const AMOUNT_EPSILON: f64 = 1e-9;

/// Convert a timestamp to fractional epoch seconds (store representation).
pub fn epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Parse fractional epoch seconds back into a timestamp.
pub fn datetime_from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

// =============================================================================
// Symbol
// =============================================================================

/// Trading pair symbol (`BASE/QUOTE`, e.g. `BTC/USDT`) using Arc<str> for
/// cheap cloning.
///
/// Symbols are cloned on every order, index key, and log line; Arc<str>
/// keeps that O(1). Pair validity is checked once at order intake via
/// [`Symbol::pair`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(base, quote)`. Returns `None` for anything that is not
    /// a pair of two distinct non-empty assets.
    pub fn pair(&self) -> Option<(&str, &str)> {
        self.0
            .split_once('/')
            .filter(|(base, quote)| !base.is_empty() && !quote.is_empty() && base != quote)
    }

    /// Base asset, or `""` for a malformed symbol (rejected at intake).
    pub fn base(&self) -> &str {
        self.pair().map_or("", |(base, _)| base)
    }

    /// Quote asset, or `""` for a malformed symbol (rejected at intake).
    pub fn quote(&self) -> &str {
        self.pair().map_or("", |(_, quote)| quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Side / order kind
// =============================================================================

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type - determines the execution path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Executes asynchronously against the last traded price after a
    /// simulated round-trip delay.
    Market,

    /// Rests until the price feed crosses the limit price; settled by the
    /// tick loop.
    Limit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
        }
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderKind::Market),
            "limit" => Ok(OrderKind::Limit),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order status state machine
// =============================================================================

/// Order state machine. OPEN = `{new, partially_filled}`; everything else
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, funds reserved, not yet (fully) executed
    New,

    /// Partially executed with a live remainder (limit only)
    PartiallyFilled,

    /// Fully executed
    Filled,

    /// Cancelled by the user
    Canceled,

    /// Partially executed, remainder given up (market partial, or user
    /// cancel after a fill)
    PartiallyCanceled,

    /// Open past the expiry threshold; remainder released by the pruner
    Expired,

    /// Refused at intake or during execution; no reservation held
    Rejected,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::New,
        OrderStatus::PartiallyFilled,
        OrderStatus::Filled,
        OrderStatus::Canceled,
        OrderStatus::PartiallyCanceled,
        OrderStatus::Expired,
        OrderStatus::Rejected,
    ];

    pub const OPEN: [OrderStatus; 2] = [OrderStatus::New, OrderStatus::PartiallyFilled];

    pub const TERMINAL: [OrderStatus; 5] = [
        OrderStatus::Filled,
        OrderStatus::Canceled,
        OrderStatus::PartiallyCanceled,
        OrderStatus::Expired,
        OrderStatus::Rejected,
    ];

    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    /// The only permitted transition edges. Anything else must fail loudly.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (New, Filled)
                | (New, PartiallyFilled)
                | (New, PartiallyCanceled)
                | (New, Canceled)
                | (New, Expired)
                | (New, Rejected)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, PartiallyCanceled)
                | (PartiallyFilled, Canceled)
                | (PartiallyFilled, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::PartiallyCanceled => "partially_canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(OrderStatus::New),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" => Ok(OrderStatus::Canceled),
            "partially_canceled" => Ok(OrderStatus::PartiallyCanceled),
            "expired" => Ok(OrderStatus::Expired),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order record
// =============================================================================

/// Core order record, persisted as the `ord_<oid>` hash.
///
/// `oid`, `symbol`, `side`, `kind`, `amount`, `limit_price`, `reserved`,
/// `commission_rate`, `cash_asset` and `ts_create` are immutable after
/// creation; the rest mutates only through the orderbook's validated
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub oid: String,
    pub symbol: Symbol,
    pub side: Side,
    #[serde(rename = "type")]
    pub kind: OrderKind,
    /// Requested base quantity
    pub amount: f64,
    pub limit_price: Option<f64>,
    /// Amount moved `free -> used` at intake, on [`Order::reserve_asset`]
    pub reserved: f64,
    /// Fee fraction snapshot taken at intake
    pub commission_rate: f64,
    /// Cash asset snapshot taken at intake (valuation/reporting)
    pub cash_asset: String,
    pub status: OrderStatus,
    /// Base quantity filled so far
    pub filled: f64,
    /// Cumulative quote moved by fills
    pub notional: f64,
    /// Cumulative fee, charged in the quote asset
    pub fee: f64,
    pub avg_price: Option<f64>,
    pub ts_create: DateTime<Utc>,
    pub ts_update: DateTime<Utc>,
    pub ts_final: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Order {
    /// Base quantity still unfilled.
    pub fn remaining(&self) -> f64 {
        (self.amount - self.filled).max(0.0)
    }

    /// Portion of the original reservation still backing this order.
    ///
    /// Buys reserve quote and spend `notional + fee` of it; sells reserve
    /// the base amount and deliver `filled` of it.
    pub fn remaining_reservation(&self) -> f64 {
        let remaining = match self.side {
            Side::Buy => self.reserved - (self.notional + self.fee),
            Side::Sell => self.amount - self.filled,
        };
        remaining.max(0.0)
    }

    /// Asset the reservation was taken on: quote for buys, base for sells.
    pub fn reserve_asset(&self) -> &str {
        match self.side {
            Side::Buy => self.symbol.quote(),
            Side::Sell => self.symbol.base(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Whether the latest trade price makes this limit order eligible to
    /// fill. Market orders never rest, so they never cross.
    pub fn crosses(&self, last_price: f64) -> bool {
        match (self.kind, self.limit_price) {
            (OrderKind::Limit, Some(limit)) => match self.side {
                Side::Buy => last_price <= limit,
                Side::Sell => last_price >= limit,
            },
            _ => false,
        }
    }

    /// Flatten into store hash fields.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("oid", self.oid.clone()),
            ("symbol", self.symbol.as_str().to_string()),
            ("side", self.side.as_str().to_string()),
            ("type", self.kind.as_str().to_string()),
            ("amount", self.amount.to_string()),
            ("reserved", self.reserved.to_string()),
            ("commission_rate", self.commission_rate.to_string()),
            ("cash_asset", self.cash_asset.clone()),
            ("status", self.status.as_str().to_string()),
            ("filled", self.filled.to_string()),
            ("notional", self.notional.to_string()),
            ("fee", self.fee.to_string()),
            ("ts_create", epoch_secs(self.ts_create).to_string()),
            ("ts_update", epoch_secs(self.ts_update).to_string()),
        ];
        if let Some(limit) = self.limit_price {
            fields.push(("limit_price", limit.to_string()));
        }
        if let Some(avg) = self.avg_price {
            fields.push(("avg_price", avg.to_string()));
        }
        if let Some(ts) = self.ts_final {
            fields.push(("ts_final", epoch_secs(ts).to_string()));
        }
        if let Some(reason) = &self.cancel_reason {
            fields.push(("cancel_reason", reason.clone()));
        }
        fields
    }

    /// Rebuild from store hash fields. Missing or unparseable required
    /// fields surface as [`ExchangeError::Corrupt`].
    pub fn from_fields(
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, ExchangeError> {
        Ok(Order {
            oid: req_str(key, fields, "oid")?,
            symbol: Symbol::new(req_str(key, fields, "symbol")?),
            side: req_parsed(key, fields, "side")?,
            kind: req_parsed(key, fields, "type")?,
            amount: req_f64(key, fields, "amount")?,
            limit_price: opt_f64(key, fields, "limit_price")?,
            reserved: req_f64(key, fields, "reserved")?,
            commission_rate: req_f64(key, fields, "commission_rate")?,
            cash_asset: req_str(key, fields, "cash_asset")?,
            status: req_parsed(key, fields, "status")?,
            filled: req_f64(key, fields, "filled")?,
            notional: req_f64(key, fields, "notional")?,
            fee: req_f64(key, fields, "fee")?,
            avg_price: opt_f64(key, fields, "avg_price")?,
            ts_create: req_ts(key, fields, "ts_create")?,
            ts_update: req_ts(key, fields, "ts_update")?,
            ts_final: opt_ts(key, fields, "ts_final")?,
            cancel_reason: fields.get("cancel_reason").cloned(),
        })
    }
}

// =============================================================================
// Ticker
// =============================================================================

/// One ticker row as written by the external price feeder (`sym_<SYMBOL>`).
///
/// Only `price` and `timestamp` are required on the wire; `bid`/`ask`
/// default to the last price and the volumes to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
}

impl Ticker {
    pub fn new(symbol: Symbol, price: f64, timestamp: DateTime<Utc>) -> Self {
        Ticker {
            symbol,
            price,
            timestamp,
            bid: price,
            ask: price,
            bid_volume: 0.0,
            ask_volume: 0.0,
        }
    }

    /// Age of the quote relative to `now`, in seconds.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        epoch_secs(now) - epoch_secs(self.timestamp)
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("symbol", self.symbol.as_str().to_string()),
            ("price", self.price.to_string()),
            ("timestamp", epoch_secs(self.timestamp).to_string()),
            ("bid", self.bid.to_string()),
            ("ask", self.ask.to_string()),
            ("bidVolume", self.bid_volume.to_string()),
            ("askVolume", self.ask_volume.to_string()),
        ]
    }

    pub fn from_fields(
        key: &str,
        symbol: Symbol,
        fields: &HashMap<String, String>,
    ) -> Result<Self, ExchangeError> {
        let price = req_f64(key, fields, "price")?;
        let ts_secs = req_f64(key, fields, "timestamp")?;
        let timestamp =
            datetime_from_epoch_secs(ts_secs).ok_or_else(|| ExchangeError::Corrupt {
                key: key.to_string(),
                reason: format!("timestamp out of range: {ts_secs}"),
            })?;
        Ok(Ticker {
            symbol,
            price,
            timestamp,
            bid: opt_f64(key, fields, "bid")?.unwrap_or(price),
            ask: opt_f64(key, fields, "ask")?.unwrap_or(price),
            bid_volume: opt_f64(key, fields, "bidVolume")?.unwrap_or(0.0),
            ask_volume: opt_f64(key, fields, "askVolume")?.unwrap_or(0.0),
        })
    }
}

// =============================================================================
// Balance row
// =============================================================================

/// Per-asset balance: `free` is spendable, `used` backs OPEN orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub free: f64,
    pub used: f64,
}

impl BalanceRow {
    pub fn total(&self) -> f64 {
        self.free + self.used
    }

    pub fn from_fields(
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, ExchangeError> {
        Ok(BalanceRow {
            free: opt_f64(key, fields, "free")?.unwrap_or(0.0),
            used: opt_f64(key, fields, "used")?.unwrap_or(0.0),
        })
    }
}

// =============================================================================
// Field parsing helpers
// =============================================================================

fn corrupt(key: &str, reason: String) -> ExchangeError {
    ExchangeError::Corrupt {
        key: key.to_string(),
        reason,
    }
}

fn req_str(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<String, ExchangeError> {
    fields
        .get(field)
        .cloned()
        .ok_or_else(|| corrupt(key, format!("missing field: {field}")))
}

fn req_f64(key: &str, fields: &HashMap<String, String>, field: &str) -> Result<f64, ExchangeError> {
    let raw = fields
        .get(field)
        .ok_or_else(|| corrupt(key, format!("missing field: {field}")))?;
    raw.parse::<f64>()
        .map_err(|_| corrupt(key, format!("bad number in {field}: {raw}")))
}

fn opt_f64(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<Option<f64>, ExchangeError> {
    match fields.get(field) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| corrupt(key, format!("bad number in {field}: {raw}"))),
    }
}

fn req_parsed<T: FromStr<Err = String>>(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<T, ExchangeError> {
    req_str(key, fields, field)?
        .parse::<T>()
        .map_err(|e| corrupt(key, e))
}

fn req_ts(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<DateTime<Utc>, ExchangeError> {
    let secs = req_f64(key, fields, field)?;
    datetime_from_epoch_secs(secs)
        .ok_or_else(|| corrupt(key, format!("timestamp out of range in {field}: {secs}")))
}

fn opt_ts(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ExchangeError> {
    match opt_f64(key, fields, field)? {
        None => Ok(None),
        Some(secs) => datetime_from_epoch_secs(secs)
            .map(Some)
            .ok_or_else(|| corrupt(key, format!("timestamp out of range in {field}: {secs}"))),
    }
}
