//! Market-order execution
//!
//! Runs once per market order on a spawned task. The simulated round-trip
//! (a uniform sleep) and the randomized partial fill are the point of the
//! exercise: bots trading against this engine must cope with latency and
//! with fills smaller than they asked for. The whole path runs under the
//! per-order lock, so a concurrent cancel either wins before execution
//! starts or observes the terminal state after it.

use rand::distributions::Distribution;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::error::{ExchangeError, Result};
use crate::orderbook::{order_key, order_lock_key};
use crate::portfolio::FillSettlement;
use crate::store::KeyLock;
use crate::types::{Order, OrderKind, OrderStatus, Side, AMOUNT_EPSILON};

/// Lower clip for the fill ratio: a market order that executes at all
/// always moves a nonzero quantity.
const MIN_FILL_RATIO: f64 = 1e-3;

impl Engine {
    /// Entry point for the spawned execution task. Errors are logged, not
    /// propagated; there is nobody above us to hand them to.
    pub(crate) async fn execute_market(&self, oid: String) {
        if let Err(e) = self.run_market_order(&oid).await {
            error!(oid = %oid, error = %e, "market order execution failed");
        }
    }

    async fn run_market_order(&self, oid: &str) -> Result<()> {
        let latency = self.sample_latency();
        let lock =
            KeyLock::acquire(&self.store, &order_lock_key(oid), self.order_lock_ttl()).await?;
        let result = self.fill_market_locked(oid, latency).await;
        lock.release_or_warn().await;
        result
    }

    async fn fill_market_locked(&self, oid: &str, latency: Duration) -> Result<()> {
        tokio::time::sleep(latency).await;

        let mut order = self.orderbook.get(oid).await?;
        if order.status != OrderStatus::New {
            // A cancel or expiry won the race while we were queued on the
            // lock; nothing left to do.
            debug!(oid = %oid, status = %order.status, "market order already settled");
            return Ok(());
        }
        if order.kind != OrderKind::Market {
            return Err(ExchangeError::Corrupt {
                key: order_key(oid),
                reason: format!("market execution invoked on a {} order", order.kind),
            });
        }

        let ticker = match self.market.ticker(&order.symbol).await {
            Ok(t) => t,
            Err(ExchangeError::UnknownSymbol(_)) => {
                return self
                    .reject_locked(&mut order, "ticker unavailable at execution")
                    .await;
            }
            Err(e) => return Err(e),
        };
        if let Some(err) = self.stale_ticker_error(&ticker) {
            return self.reject_locked(&mut order, &err.to_string()).await;
        }

        let price = ticker.price;
        let ratio = self.sample_fill_ratio();
        let rate = order.commission_rate;
        let mut filled = order.amount * ratio;
        let mut notional = filled * price;
        let mut fee = notional * rate;

        let settlement = match order.side {
            Side::Buy => {
                // The price may have moved above the intake price the
                // reservation was sized for; never spend more than was
                // reserved, shrink the fill to fit instead.
                if notional + fee > order.reserved + AMOUNT_EPSILON {
                    filled = order.reserved / (price * (1.0 + rate));
                    notional = filled * price;
                    fee = notional * rate;
                    debug!(
                        oid = %order.oid,
                        filled,
                        "fill clamped to reservation after price move"
                    );
                }
                let spend = notional + fee;
                FillSettlement {
                    spend_asset: order.symbol.quote().to_string(),
                    spend,
                    release_back: (order.reserved - spend).max(0.0),
                    credit_asset: order.symbol.base().to_string(),
                    credit: filled,
                }
            }
            Side::Sell => FillSettlement {
                spend_asset: order.symbol.base().to_string(),
                spend: filled,
                release_back: (order.amount - filled).max(0.0),
                credit_asset: order.symbol.quote().to_string(),
                credit: (notional - fee).max(0.0),
            },
        };

        self.portfolio.apply_fill(&settlement).await?;

        order.filled = filled;
        order.notional = notional;
        order.fee = fee;
        order.avg_price = Some(price);

        // Market orders never rest: anything short of a full fill forfeits
        // the remainder.
        let next = if filled + AMOUNT_EPSILON >= order.amount {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyCanceled
        };
        self.orderbook.transition(&mut order, next).await?;

        info!(
            oid = %order.oid,
            symbol = %order.symbol,
            side = %order.side,
            price,
            filled,
            notional,
            fee,
            status = %order.status,
            "market order executed"
        );
        Ok(())
    }

    /// Runtime rejection: give the whole reservation back and finalize.
    async fn reject_locked(&self, order: &mut Order, reason: &str) -> Result<()> {
        let leftover = order.remaining_reservation();
        if leftover > AMOUNT_EPSILON {
            self.portfolio
                .release(order.reserve_asset(), leftover)
                .await?;
        }
        order.cancel_reason = Some(reason.to_string());
        self.orderbook
            .transition(order, OrderStatus::Rejected)
            .await?;
        warn!(oid = %order.oid, reason, "market order rejected at execution");
        Ok(())
    }

    /// Uniform draw from the configured latency window.
    pub(crate) fn sample_latency(&self) -> Duration {
        let min = self.settings.min_time_answer_order_market;
        let max = self.settings.max_time_answer_order_market;
        if max <= 0.0 {
            return Duration::ZERO;
        }
        let secs = if (max - min).abs() < f64::EPSILON {
            min
        } else {
            let mut rng = self.rng.lock().unwrap();
            rng.gen_range(min..=max)
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Fill ratio: truncated normal with mean 1 and the configured sigma,
    /// clipped to `(MIN_FILL_RATIO, 1]`. Sigma zero short-circuits to a
    /// full fill, which also keeps the zero-sigma path deterministic.
    pub(crate) fn sample_fill_ratio(&self) -> f64 {
        match &self.fill_dist {
            None => 1.0,
            Some(dist) => {
                let mut rng = self.rng.lock().unwrap();
                dist.sample(&mut *rng).clamp(MIN_FILL_RATIO, 1.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::store::{MemoryStore, Store};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn engine_with(settings: EngineSettings) -> Engine {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Engine::new(store, settings).unwrap()
    }

    #[test]
    fn test_zero_sigma_always_fills_in_full() {
        let settings = EngineSettings {
            sigma_fill_market_order: 0.0,
            ..Default::default()
        };
        let engine = engine_with(settings).with_rng(StdRng::seed_from_u64(7));
        for _ in 0..100 {
            assert_abs_diff_eq!(engine.sample_fill_ratio(), 1.0);
        }
    }

    #[test]
    fn test_fill_ratio_stays_in_unit_interval() {
        let settings = EngineSettings {
            sigma_fill_market_order: 0.4,
            ..Default::default()
        };
        let engine = engine_with(settings).with_rng(StdRng::seed_from_u64(42));
        for _ in 0..1_000 {
            let r = engine.sample_fill_ratio();
            assert!(r > 0.0 && r <= 1.0, "ratio {r} out of (0, 1]");
        }
    }

    #[test]
    fn test_seeded_fill_ratio_is_reproducible() {
        let settings = EngineSettings {
            sigma_fill_market_order: 0.2,
            ..Default::default()
        };
        let a = engine_with(settings.clone()).with_rng(StdRng::seed_from_u64(9));
        let b = engine_with(settings).with_rng(StdRng::seed_from_u64(9));
        for _ in 0..20 {
            assert_eq!(a.sample_fill_ratio(), b.sample_fill_ratio());
        }
    }

    #[test]
    fn test_latency_bounds() {
        let settings = EngineSettings {
            min_time_answer_order_market: 0.01,
            max_time_answer_order_market: 0.05,
            ..Default::default()
        };
        let engine = engine_with(settings).with_rng(StdRng::seed_from_u64(1));
        for _ in 0..200 {
            let latency = engine.sample_latency().as_secs_f64();
            assert!((0.01..=0.05).contains(&latency), "latency {latency}");
        }
    }

    #[test]
    fn test_latency_zero_window() {
        let settings = EngineSettings {
            min_time_answer_order_market: 0.0,
            max_time_answer_order_market: 0.0,
            ..Default::default()
        };
        let engine = engine_with(settings);
        assert_eq!(engine.sample_latency(), Duration::ZERO);
    }
}
