//! Tick-driven limit settlement
//!
//! Each sweep takes one price observation per symbol and fills every OPEN
//! limit order that observation crosses, FIFO by creation time. The
//! remainder fills in full at the limit price: the tick stands for a trade
//! that could have absorbed the order. Orders whose symbol has no (or a
//! stale) ticker are left for a later sweep.

use itertools::Itertools;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::{ExchangeError, Result};
use crate::orderbook::{order_key, order_lock_key};
use crate::portfolio::FillSettlement;
use crate::store::KeyLock;
use crate::types::{OrderKind, OrderStatus, Side, AMOUNT_EPSILON};

impl Engine {
    /// One settlement sweep over all OPEN limit orders. Returns how many
    /// orders were filled. Per-order failures are logged and skipped; the
    /// sweep itself only fails when the store does.
    pub async fn settle_open_limit_orders(&self) -> Result<usize> {
        let open = self.orderbook.scan_open().await?;
        let by_symbol = open
            .into_iter()
            .filter(|o| o.kind == OrderKind::Limit)
            .into_group_map_by(|o| o.symbol.clone());

        let mut settled = 0;
        for (symbol, mut orders) in by_symbol {
            let ticker = match self.market.ticker(&symbol).await {
                Ok(t) => t,
                Err(ExchangeError::UnknownSymbol(_)) => {
                    debug!(symbol = %symbol, "no ticker yet; settlement deferred");
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "skipping symbol this sweep");
                    continue;
                }
            };
            if let Some(err) = self.stale_ticker_error(&ticker) {
                debug!(symbol = %symbol, reason = %err, "settlement deferred");
                continue;
            }

            // FIFO among crossing orders of one symbol, ties by oid.
            orders.sort_by(|a, b| {
                a.ts_create
                    .cmp(&b.ts_create)
                    .then_with(|| a.oid.cmp(&b.oid))
            });

            for order in orders {
                if !order.crosses(ticker.price) {
                    continue;
                }
                match self.settle_crossing_order(&order.oid, ticker.price).await {
                    Ok(true) => settled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(oid = %order.oid, error = %e, "limit settlement failed")
                    }
                }
            }
        }
        Ok(settled)
    }

    async fn settle_crossing_order(&self, oid: &str, observed_price: f64) -> Result<bool> {
        let lock =
            KeyLock::acquire(&self.store, &order_lock_key(oid), self.order_lock_ttl()).await?;
        let result = self.settle_limit_locked(oid, observed_price).await;
        lock.release_or_warn().await;
        result
    }

    /// Fill the remainder of one limit order at its limit price. Re-reads
    /// under the lock: the order may have been cancelled or expired since
    /// the sweep enumerated it.
    async fn settle_limit_locked(&self, oid: &str, observed_price: f64) -> Result<bool> {
        let mut order = self.orderbook.get(oid).await?;
        if !order.is_open() || order.kind != OrderKind::Limit {
            return Ok(false);
        }
        if !order.crosses(observed_price) {
            return Ok(false);
        }
        let limit_price = order.limit_price.ok_or_else(|| ExchangeError::Corrupt {
            key: order_key(oid),
            reason: "limit order without limit_price".to_string(),
        })?;

        let remainder = order.remaining();
        if remainder <= AMOUNT_EPSILON {
            return Ok(false);
        }

        let rate = order.commission_rate;
        let notional_inc = remainder * limit_price;
        let fee_inc = notional_inc * rate;

        let settlement = match order.side {
            Side::Buy => {
                // Reservation was sized at the limit price, so spending the
                // remainder at that price consumes it exactly (modulo float
                // drift, which goes back to free).
                let spend = notional_inc + fee_inc;
                let release_back = (order.remaining_reservation() - spend).max(0.0);
                FillSettlement {
                    spend_asset: order.symbol.quote().to_string(),
                    spend,
                    release_back,
                    credit_asset: order.symbol.base().to_string(),
                    credit: remainder,
                }
            }
            Side::Sell => FillSettlement {
                spend_asset: order.symbol.base().to_string(),
                spend: remainder,
                release_back: 0.0,
                credit_asset: order.symbol.quote().to_string(),
                credit: (notional_inc - fee_inc).max(0.0),
            },
        };

        self.portfolio.apply_fill(&settlement).await?;

        order.filled += remainder;
        order.notional += notional_inc;
        order.fee += fee_inc;
        order.avg_price = Some(order.notional / order.filled);
        self.orderbook
            .transition(&mut order, OrderStatus::Filled)
            .await?;

        info!(
            oid = %order.oid,
            symbol = %order.symbol,
            side = %order.side,
            limit_price,
            filled = order.filled,
            notional = order.notional,
            fee = order.fee,
            "limit order filled"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::OrderRequest;
    use crate::store::{MemoryStore, Store};
    use crate::types::{Order, Symbol};
    use approx::assert_abs_diff_eq;
    use chrono::Utc;
    use std::sync::Arc;

    fn test_engine() -> Engine {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let settings = EngineSettings {
            min_time_answer_order_market: 0.0,
            max_time_answer_order_market: 0.0,
            sigma_fill_market_order: 0.0,
            ..Default::default()
        };
        Engine::new(store, settings).unwrap()
    }

    /// The `partially_filled -> filled` edge is not reachable through the
    /// current intake paths, but settlement must honour prior fills if a
    /// record carries them.
    #[tokio::test]
    async fn test_settles_remainder_of_partially_filled_order() {
        let engine = test_engine();
        let symbol = Symbol::new("ETH/USDT");
        engine.force_price(&symbol, 95.0).await.unwrap();

        // Prior state: 0.4 of 1.0 already filled at 100 with zero fee;
        // 60 USDT of the 100 reserved is still held.
        engine.portfolio().fund("USDT", 60.0).await.unwrap();
        engine.portfolio().reserve("USDT", 60.0).await.unwrap();

        let now = Utc::now();
        let order = engine
            .orderbook()
            .create(Order {
                oid: String::new(),
                symbol: symbol.clone(),
                side: Side::Buy,
                kind: OrderKind::Limit,
                amount: 1.0,
                limit_price: Some(100.0),
                reserved: 100.0,
                commission_rate: 0.0,
                cash_asset: "USDT".to_string(),
                status: OrderStatus::PartiallyFilled,
                filled: 0.4,
                notional: 40.0,
                fee: 0.0,
                avg_price: Some(100.0),
                ts_create: now,
                ts_update: now,
                ts_final: None,
                cancel_reason: None,
            })
            .await
            .unwrap();

        let settled = engine.settle_open_limit_orders().await.unwrap();
        assert_eq!(settled, 1);

        let order = engine.orderbook().get(&order.oid).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_abs_diff_eq!(order.filled, 1.0, epsilon = AMOUNT_EPSILON);
        assert_abs_diff_eq!(order.notional, 100.0, epsilon = 1e-6);
        assert_eq!(order.avg_price, Some(100.0));

        let usdt = engine.portfolio().get("USDT").await.unwrap();
        let eth = engine.portfolio().get("ETH").await.unwrap();
        assert_eq!(usdt.used, 0.0);
        assert_abs_diff_eq!(eth.free, 0.6, epsilon = AMOUNT_EPSILON);
    }

    #[tokio::test]
    async fn test_non_crossing_order_left_untouched() {
        let engine = test_engine();
        let symbol = Symbol::new("BTC/USDT");
        engine.force_price(&symbol, 50_000.0).await.unwrap();
        engine.portfolio().fund("USDT", 10_000.0).await.unwrap();

        let order = engine
            .place(OrderRequest {
                symbol: symbol.clone(),
                side: Side::Buy,
                kind: OrderKind::Limit,
                amount: 0.1,
                limit_price: Some(49_000.0),
            })
            .await
            .unwrap();

        assert_eq!(engine.settle_open_limit_orders().await.unwrap(), 0);
        let order = engine.orderbook().get(&order.oid).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.filled, 0.0);
    }
}
