//! Prune: expiry of stale OPEN orders and deletion of old terminal ones
//!
//! Idempotent by construction: expiry re-checks state under the per-order
//! lock, deletion tolerates records already gone. Safe to re-run at any
//! time, including concurrently with trading.

use chrono::Utc;
use std::fmt;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::Result;
use crate::orderbook::order_lock_key;
use crate::store::KeyLock;
use crate::types::{OrderStatus, AMOUNT_EPSILON};

/// Outcome of one prune sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneStats {
    /// OPEN orders transitioned to `expired` (reservations released)
    pub expired: usize,
    /// Terminal orders deleted outright
    pub deleted: usize,
}

impl fmt::Display for PruneStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expired={} deleted={}", self.expired, self.deleted)
    }
}

impl Engine {
    /// One maintenance sweep: expire OPEN orders older than
    /// `expire_after_h`, delete terminal orders whose `ts_final` is older
    /// than `stale_after_h`. Per-item failures are logged and skipped.
    pub async fn prune(&self) -> Result<PruneStats> {
        let now = Utc::now();
        let mut stats = PruneStats::default();

        let expire_cutoff =
            now - chrono::Duration::milliseconds(
                (self.settings.expire_after_h * 3_600_000.0) as i64,
            );
        for order in self.orderbook.scan_open().await? {
            if order.ts_create >= expire_cutoff {
                continue;
            }
            match self.expire_order(&order.oid).await {
                Ok(true) => stats.expired += 1,
                Ok(false) => {}
                Err(e) => warn!(oid = %order.oid, error = %e, "failed to expire order"),
            }
        }

        let stale_cutoff =
            now - chrono::Duration::milliseconds(
                (self.settings.stale_after_h * 3_600_000.0) as i64,
            );
        for order in self.orderbook.scan_terminal_older_than(stale_cutoff).await? {
            match self.orderbook.delete(&order).await {
                Ok(()) => {
                    debug!(oid = %order.oid, status = %order.status, "stale order deleted");
                    stats.deleted += 1;
                }
                Err(e) => warn!(oid = %order.oid, error = %e, "failed to delete stale order"),
            }
        }

        if stats.expired > 0 || stats.deleted > 0 {
            info!(expired = stats.expired, deleted = stats.deleted, "prune sweep done");
        }
        Ok(stats)
    }

    /// Expire one order if it is still OPEN, releasing the remaining
    /// reservation. Returns false when a fill or cancel won the race.
    async fn expire_order(&self, oid: &str) -> Result<bool> {
        let lock =
            KeyLock::acquire(&self.store, &order_lock_key(oid), self.order_lock_ttl()).await?;
        let result = self.expire_locked(oid).await;
        lock.release_or_warn().await;
        result
    }

    async fn expire_locked(&self, oid: &str) -> Result<bool> {
        let mut order = self.orderbook.get(oid).await?;
        if !order.is_open() {
            return Ok(false);
        }

        let leftover = order.remaining_reservation();
        if leftover > AMOUNT_EPSILON {
            self.portfolio
                .release(order.reserve_asset(), leftover)
                .await?;
        }
        order.cancel_reason = Some("expired".to_string());
        self.orderbook
            .transition(&mut order, OrderStatus::Expired)
            .await?;
        info!(oid = %order.oid, released = leftover, "order expired");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::OrderRequest;
    use crate::store::{MemoryStore, Store};
    use crate::types::{OrderKind, Side, Symbol};
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn engine_with(settings: EngineSettings) -> Engine {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Engine::new(store, settings).unwrap()
    }

    #[tokio::test]
    async fn test_expire_releases_reservation_and_is_idempotent() {
        let engine = engine_with(EngineSettings {
            expire_after_h: 0.0, // everything expires immediately
            stale_after_h: 24.0,
            ..Default::default()
        });
        let symbol = Symbol::new("BTC/USDT");
        engine.force_price(&symbol, 50_000.0).await.unwrap();
        engine.fund("USDT", 10_000.0).await.unwrap();

        let order = engine
            .place(OrderRequest {
                symbol,
                side: Side::Buy,
                kind: OrderKind::Limit,
                amount: 0.1,
                limit_price: Some(40_000.0),
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stats = engine.prune().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.deleted, 0);

        let order = engine.orderbook().get(&order.oid).await.unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(order.cancel_reason.as_deref(), Some("expired"));

        let usdt = engine.portfolio().get("USDT").await.unwrap();
        assert_abs_diff_eq!(usdt.free, 10_000.0, epsilon = 1e-6);
        assert_eq!(usdt.used, 0.0);

        // Second sweep finds nothing new
        let stats = engine.prune().await.unwrap();
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.deleted, 0);
    }

    #[tokio::test]
    async fn test_stale_terminal_orders_are_deleted() {
        let engine = engine_with(EngineSettings {
            expire_after_h: 0.0,
            stale_after_h: 0.0, // delete terminal orders on the next sweep
            ..Default::default()
        });
        let symbol = Symbol::new("BTC/USDT");
        engine.force_price(&symbol, 50_000.0).await.unwrap();
        engine.fund("USDT", 10_000.0).await.unwrap();

        let order = engine
            .place(OrderRequest {
                symbol,
                side: Side::Buy,
                kind: OrderKind::Limit,
                amount: 0.1,
                limit_price: Some(40_000.0),
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let first = engine.prune().await.unwrap();
        assert_eq!(first.expired, 1);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = engine.prune().await.unwrap();
        assert_eq!(second.deleted, 1);

        assert!(engine.orderbook().get(&order.oid).await.is_err());
    }
}
