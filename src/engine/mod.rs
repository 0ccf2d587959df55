//! Engine: order intake, cancellation, reconciliation, admin operations
//!
//! The engine is the only component that mutates orders or balances; the
//! HTTP/CLI adapters and the scheduler only ever call in here. It holds no
//! authoritative state of its own (everything is re-read from the store),
//! so any number of replicas can serve the same account.
//!
//! Execution paths live in the sibling modules: market orders in
//! [`execution`], tick-driven limit settlement in [`settlement`], expiry
//! and garbage collection in [`maintenance`].

pub mod execution;
pub mod maintenance;
pub mod settlement;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::error::{ExchangeError, Result};
use crate::market::{ticker_key, MarketView, TICKER_PREFIX};
use crate::orderbook::{order_lock_key, Orderbook, INDEX_PREFIX, ORDER_PREFIX, SEQUENCE_KEY};
use crate::portfolio::{Portfolio, BALANCE_PREFIX};
use crate::store::{KeyLock, Store};
use crate::types::{
    BalanceRow, Order, OrderKind, OrderStatus, Side, Symbol, Ticker, AMOUNT_EPSILON,
};

/// Tolerance for the reconciliation identity `used == Σ reservations`.
/// Wider than [`AMOUNT_EPSILON`] because both sides accumulate float
/// increments independently.
const RECONCILE_TOLERANCE: f64 = 1e-6;

/// A new order as submitted by the client.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    /// Base quantity
    pub amount: f64,
    /// Required for limit orders, forbidden for market orders
    pub limit_price: Option<f64>,
}

/// Dry-run verdict for [`Engine::can_execute`].
#[derive(Debug, Clone)]
pub struct CanExecute {
    pub ok: bool,
    pub reason: Option<String>,
}

/// One row of the reconciliation report.
#[derive(Debug, Clone)]
pub struct AssetOverview {
    pub asset: String,
    pub free: f64,
    pub used: f64,
    /// Σ remaining reservations over OPEN orders on this asset
    pub expected_used: f64,
    pub mismatch: bool,
    /// `total` valued in the cash asset via the last price, when a ticker
    /// for `<asset>/<cash>` exists
    pub value_in_cash: Option<f64>,
}

/// Output of [`Engine::overview_assets`]: the production oracle for the
/// conservation invariant.
#[derive(Debug, Clone)]
pub struct OverviewReport {
    pub cash_asset: String,
    pub rows: Vec<AssetOverview>,
    /// True iff no row has a `used` / reservation mismatch
    pub consistent: bool,
    /// Sum of `value_in_cash` over the rows that could be valued
    pub total_value: f64,
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    market: MarketView,
    portfolio: Portfolio,
    orderbook: Orderbook,
    settings: EngineSettings,
    rng: Arc<Mutex<StdRng>>,
    /// Fill-ratio distribution; `None` when sigma is zero (always fill in
    /// full)
    fill_dist: Option<Normal>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, settings: EngineSettings) -> Result<Self> {
        let fill_dist = if settings.sigma_fill_market_order > 0.0 {
            Some(
                Normal::new(1.0, settings.sigma_fill_market_order).map_err(|e| {
                    ExchangeError::InvalidArgument(format!("bad fill-ratio sigma: {e}"))
                })?,
            )
        } else {
            None
        };

        Ok(Engine {
            market: MarketView::new(Arc::clone(&store)),
            portfolio: Portfolio::new(Arc::clone(&store)),
            orderbook: Orderbook::new(Arc::clone(&store)),
            store,
            settings,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            fill_dist,
        })
    }

    /// Replace the RNG; tests pass a seeded one to pin down fill ratios
    /// and latency draws.
    pub fn with_rng(self, rng: StdRng) -> Self {
        Engine {
            rng: Arc::new(Mutex::new(rng)),
            ..self
        }
    }

    pub fn market(&self) -> &MarketView {
        &self.market
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn orderbook(&self) -> &Orderbook {
        &self.orderbook
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Order intake
    // =========================================================================

    /// Validate, reserve funds, persist, and (for market orders) dispatch
    /// execution.
    ///
    /// A reservation failure does not error: the order is persisted as
    /// `rejected` for audit and returned. Market orders come back still
    /// `new`; execution happens after a simulated delay and the client
    /// polls for the terminal state.
    pub async fn place(&self, req: OrderRequest) -> Result<Order> {
        self.validate_request(&req)?;
        let (reserve_asset, reserve_amount) = self.reservation_for(&req).await?;

        let now = Utc::now();
        let mut order = Order {
            oid: String::new(),
            symbol: req.symbol.clone(),
            side: req.side,
            kind: req.kind,
            amount: req.amount,
            limit_price: req.limit_price,
            reserved: reserve_amount,
            commission_rate: self.settings.commission_rate,
            cash_asset: self.settings.cash_asset.clone(),
            status: OrderStatus::New,
            filled: 0.0,
            notional: 0.0,
            fee: 0.0,
            avg_price: None,
            ts_create: now,
            ts_update: now,
            ts_final: None,
            cancel_reason: None,
        };

        match self.portfolio.reserve(&reserve_asset, reserve_amount).await {
            Ok(()) => {}
            Err(e @ ExchangeError::InsufficientFunds { .. }) => {
                // Persisted for audit; no funds are held.
                order.status = OrderStatus::Rejected;
                order.reserved = 0.0;
                order.cancel_reason = Some(e.to_string());
                order.ts_final = Some(now);
                let order = self.orderbook.create(order).await?;
                warn!(oid = %order.oid, symbol = %order.symbol, reason = %e, "order rejected");
                return Ok(order);
            }
            Err(e) => return Err(e),
        }

        let order = self.orderbook.create(order).await?;
        info!(
            oid = %order.oid,
            symbol = %order.symbol,
            side = %order.side,
            kind = %order.kind,
            amount = order.amount,
            reserved = order.reserved,
            "order accepted"
        );

        if order.kind == OrderKind::Market {
            let engine = self.clone();
            let oid = order.oid.clone();
            tokio::spawn(async move {
                engine.execute_market(oid).await;
            });
        }
        Ok(order)
    }

    /// Pre-trade dry run: same validation and reservation arithmetic as
    /// [`Engine::place`], without reserving or persisting anything.
    pub async fn can_execute(&self, req: &OrderRequest) -> Result<CanExecute> {
        if let Err(e) = self.validate_request(req) {
            return Ok(refusal(e));
        }
        let (asset, needed) = match self.reservation_for(req).await {
            Ok(r) => r,
            Err(e) if e.is_user_error() => return Ok(refusal(e)),
            Err(e) => return Err(e),
        };

        let row = self.portfolio.get(&asset).await?;
        if row.free + AMOUNT_EPSILON < needed {
            return Ok(refusal(ExchangeError::InsufficientFunds {
                asset,
                needed,
                free: row.free,
            }));
        }
        Ok(CanExecute {
            ok: true,
            reason: None,
        })
    }

    fn validate_request(&self, req: &OrderRequest) -> Result<()> {
        if req.symbol.pair().is_none() {
            return Err(ExchangeError::InvalidArgument(format!(
                "malformed symbol: {} (expected BASE/QUOTE)",
                req.symbol
            )));
        }
        if !req.amount.is_finite() || req.amount <= 0.0 {
            return Err(ExchangeError::InvalidArgument(format!(
                "amount must be > 0, got {}",
                req.amount
            )));
        }
        match (req.kind, req.limit_price) {
            (OrderKind::Limit, Some(price)) if price.is_finite() && price > 0.0 => Ok(()),
            (OrderKind::Limit, Some(price)) => Err(ExchangeError::InvalidArgument(format!(
                "limit_price must be > 0, got {price}"
            ))),
            (OrderKind::Limit, None) => Err(ExchangeError::InvalidArgument(
                "limit orders require a limit_price".into(),
            )),
            (OrderKind::Market, Some(_)) => Err(ExchangeError::InvalidArgument(
                "market orders do not take a limit_price".into(),
            )),
            (OrderKind::Market, None) => Ok(()),
        }
    }

    /// Which asset to reserve and how much: quote priced at the effective
    /// price (plus commission headroom) for buys, the base amount for
    /// sells. Also checks the symbol has a ticker at all and, for market
    /// orders, that the quote is fresh enough to trade against.
    async fn reservation_for(&self, req: &OrderRequest) -> Result<(String, f64)> {
        let ticker = self.market.ticker(&req.symbol).await?;
        if req.kind == OrderKind::Market {
            if let Some(err) = self.stale_ticker_error(&ticker) {
                return Err(err);
            }
        }
        match req.side {
            Side::Buy => {
                let effective_price = req.limit_price.unwrap_or(ticker.price);
                let reserve =
                    req.amount * effective_price * (1.0 + self.settings.commission_rate);
                Ok((req.symbol.quote().to_string(), reserve))
            }
            Side::Sell => Ok((req.symbol.base().to_string(), req.amount)),
        }
    }

    /// Staleness policy check: `Some(StaleTicker)` when a horizon is
    /// configured and the quote is older than it, `None` otherwise.
    /// Market paths reject on it; the tick loop defers the symbol.
    pub(crate) fn stale_ticker_error(&self, ticker: &Ticker) -> Option<ExchangeError> {
        let max_age = self.settings.stale_ticker_max_age_secs?;
        let age_secs = ticker.age_secs(Utc::now());
        if age_secs > max_age as f64 {
            Some(ExchangeError::StaleTicker {
                symbol: ticker.symbol.to_string(),
                age_secs,
            })
        } else {
            None
        }
    }

    // =========================================================================
    // Cancel
    // =========================================================================

    /// Cancel an OPEN order, releasing whatever reservation still backs
    /// it. Cancelling a terminal order is an illegal transition.
    pub async fn cancel(&self, oid: &str) -> Result<Order> {
        let lock =
            KeyLock::acquire(&self.store, &order_lock_key(oid), self.order_lock_ttl()).await?;
        let result = self.cancel_locked(oid).await;
        lock.release_or_warn().await;
        result
    }

    async fn cancel_locked(&self, oid: &str) -> Result<Order> {
        let mut order = self.orderbook.get(oid).await?;
        if !order.is_open() {
            return Err(ExchangeError::IllegalTransition {
                oid: oid.to_string(),
                from: order.status.to_string(),
                to: OrderStatus::Canceled.to_string(),
            });
        }

        let leftover = order.remaining_reservation();
        if leftover > AMOUNT_EPSILON {
            self.portfolio.release(order.reserve_asset(), leftover).await?;
        }

        order.cancel_reason = Some("canceled by user".to_string());
        let next = if order.filled > AMOUNT_EPSILON {
            OrderStatus::PartiallyCanceled
        } else {
            OrderStatus::Canceled
        };
        self.orderbook.transition(&mut order, next).await?;
        info!(oid = %order.oid, status = %order.status, released = leftover, "order canceled");
        Ok(order)
    }

    /// TTL for per-order locks: must outlive the simulated market latency
    /// the holder may sleep through.
    pub(crate) fn order_lock_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.settings.max_time_answer_order_market + 30.0)
    }

    // =========================================================================
    // Overview / reconciliation
    // =========================================================================

    /// Per-asset balances with the reservation sum they should equal.
    /// A mismatching row means a leak: funds moved without an order, or an
    /// order finalized without its balance moves.
    pub async fn overview_assets(&self) -> Result<OverviewReport> {
        let balances = self.portfolio.snapshot().await?;
        let open_orders = self.orderbook.scan_open().await?;

        let mut expected: BTreeMap<String, f64> = BTreeMap::new();
        for order in &open_orders {
            *expected.entry(order.reserve_asset().to_string()).or_default() +=
                order.remaining_reservation();
        }

        let assets: BTreeSet<String> = balances
            .keys()
            .cloned()
            .chain(expected.keys().cloned())
            .collect();

        let mut rows = Vec::with_capacity(assets.len());
        let mut consistent = true;
        let mut total_value = 0.0;

        for asset in assets {
            let row = balances.get(&asset).copied().unwrap_or_default();
            let expected_used = expected.get(&asset).copied().unwrap_or(0.0);
            let mismatch = (row.used - expected_used).abs() > RECONCILE_TOLERANCE;
            if mismatch {
                consistent = false;
                warn!(
                    asset = %asset,
                    used = row.used,
                    expected_used,
                    "reservation mismatch"
                );
            }

            let value_in_cash = self.value_in_cash(&asset, row.total()).await?;
            if let Some(value) = value_in_cash {
                total_value += value;
            }

            rows.push(AssetOverview {
                asset,
                free: row.free,
                used: row.used,
                expected_used,
                mismatch,
                value_in_cash,
            });
        }

        Ok(OverviewReport {
            cash_asset: self.settings.cash_asset.clone(),
            rows,
            consistent,
            total_value,
        })
    }

    async fn value_in_cash(&self, asset: &str, total: f64) -> Result<Option<f64>> {
        if asset == self.settings.cash_asset {
            return Ok(Some(total));
        }
        let symbol = Symbol::new(format!("{asset}/{}", self.settings.cash_asset));
        match self.market.last_price(&symbol).await {
            Ok(price) => Ok(Some(total * price)),
            Err(ExchangeError::UnknownSymbol(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Admin surface
    // =========================================================================

    /// Admin credit to an asset's free balance.
    pub async fn fund(&self, asset: &str, amount: f64) -> Result<BalanceRow> {
        let row = self.portfolio.fund(asset, amount).await?;
        info!(asset = %asset, amount, free = row.free, "funded");
        Ok(row)
    }

    /// Admin override of one balance row.
    pub async fn set_balance(&self, asset: &str, free: f64, used: f64) -> Result<BalanceRow> {
        let row = self.portfolio.set(asset, free, used).await?;
        info!(asset = %asset, free, used, "balance overridden");
        Ok(row)
    }

    /// Admin price override: writes the ticker hash the way the feeder
    /// would, with a fresh timestamp.
    pub async fn force_price(&self, symbol: &Symbol, price: f64) -> Result<Ticker> {
        if symbol.pair().is_none() {
            return Err(ExchangeError::InvalidArgument(format!(
                "malformed symbol: {symbol}"
            )));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(ExchangeError::InvalidArgument(format!(
                "price must be > 0, got {price}"
            )));
        }

        let ticker = Ticker::new(symbol.clone(), price, Utc::now());
        self.store
            .hset(&ticker_key(symbol), &ticker.to_fields())
            .await?;
        info!(symbol = %symbol, price, "price forced");
        Ok(ticker)
    }

    /// Delete every engine-owned key: tickers, balances, orders, indexes,
    /// the oid sequence, and any leftover locks. Returns how many keys
    /// went away.
    pub async fn wipe(&self) -> Result<u64> {
        let mut deleted = 0u64;
        for prefix in [
            TICKER_PREFIX,
            BALANCE_PREFIX,
            ORDER_PREFIX,
            INDEX_PREFIX,
            SEQUENCE_KEY,
            "lock_",
        ] {
            for key in self.store.keys_with_prefix(prefix).await? {
                self.store.delete(&key).await?;
                deleted += 1;
            }
        }
        warn!(deleted, "store wiped");
        Ok(deleted)
    }

    /// Liveness: can we reach the store.
    pub async fn healthz(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }
}

fn refusal(e: ExchangeError) -> CanExecute {
    CanExecute {
        ok: false,
        reason: Some(e.to_string()),
    }
}
