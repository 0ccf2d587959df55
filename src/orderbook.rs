//! Orderbook: persistence and indexing of order records
//!
//! Orders live in `ord_<oid>` hashes. Two auxiliary set families keep
//! listing O(result size): `idx_status_<status>` and `idx_sym_<symbol>`.
//! The oid sequence lives in the store (`seq_order`) so replicas never
//! collide. Status changes go through [`Orderbook::transition`], which
//! enforces the state machine; callers hold the per-order lock for the
//! whole mutation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ExchangeError, Result};
use crate::store::Store;
use crate::types::{Order, OrderStatus, Side, Symbol};

pub const ORDER_PREFIX: &str = "ord_";
pub const INDEX_PREFIX: &str = "idx_";
pub const SEQUENCE_KEY: &str = "seq_order";

pub fn order_key(oid: &str) -> String {
    format!("{ORDER_PREFIX}{oid}")
}

pub fn order_lock_key(oid: &str) -> String {
    format!("lock_{ORDER_PREFIX}{oid}")
}

fn status_index_key(status: OrderStatus) -> String {
    format!("{INDEX_PREFIX}status_{status}")
}

fn symbol_index_key(symbol: &Symbol) -> String {
    format!("{INDEX_PREFIX}sym_{symbol}")
}

/// Listing filter; all fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
}

#[derive(Clone)]
pub struct Orderbook {
    store: Arc<dyn Store>,
}

impl Orderbook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Orderbook { store }
    }

    /// Persist a freshly built order, assigning its oid from the store-side
    /// sequence. Returns the stored record.
    pub async fn create(&self, mut order: Order) -> Result<Order> {
        let seq = self.store.incr(SEQUENCE_KEY).await?;
        order.oid = format!("ord-{seq:08}");

        self.store
            .hset(&order_key(&order.oid), &order.to_fields())
            .await?;
        self.store
            .sadd(&status_index_key(order.status), &order.oid)
            .await?;
        self.store
            .sadd(&symbol_index_key(&order.symbol), &order.oid)
            .await?;
        Ok(order)
    }

    pub async fn get(&self, oid: &str) -> Result<Order> {
        let key = order_key(oid);
        let fields = self.store.hget_all(&key).await?;
        if fields.is_empty() {
            return Err(ExchangeError::NotFound(format!("order {oid}")));
        }
        Order::from_fields(&key, &fields)
    }

    /// List orders matching `filter`, most recently updated first; `tail`
    /// truncates to the N most recent.
    pub async fn list(&self, filter: &OrderFilter, tail: Option<usize>) -> Result<Vec<Order>> {
        let oids = match (&filter.status, &filter.symbol) {
            (Some(status), _) => self.store.smembers(&status_index_key(*status)).await?,
            (None, Some(symbol)) => self.store.smembers(&symbol_index_key(symbol)).await?,
            (None, None) => {
                let mut all = Vec::new();
                for status in OrderStatus::ALL {
                    all.extend(self.store.smembers(&status_index_key(status)).await?);
                }
                all
            }
        };

        let mut orders = Vec::with_capacity(oids.len());
        for order in self.resolve(&oids).await? {
            if let Some(symbol) = &filter.symbol {
                if &order.symbol != symbol {
                    continue;
                }
            }
            if let Some(side) = filter.side {
                if order.side != side {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if order.status != status {
                    continue;
                }
            }
            orders.push(order);
        }

        orders.sort_by(|a, b| b.ts_update.cmp(&a.ts_update).then(b.oid.cmp(&a.oid)));
        if let Some(n) = tail {
            orders.truncate(n);
        }
        Ok(orders)
    }

    /// Apply a status transition and persist the order's mutable fields.
    ///
    /// The caller mutates fill progress (`filled`, `notional`, `fee`,
    /// `avg_price`, `cancel_reason`) on `order` first and must hold the
    /// per-order lock. Transitions outside the state machine fail with
    /// `IllegalTransition` and leave the stored record untouched.
    pub async fn transition(&self, order: &mut Order, next: OrderStatus) -> Result<()> {
        if !order.status.can_transition_to(next) {
            return Err(ExchangeError::IllegalTransition {
                oid: order.oid.clone(),
                from: order.status.to_string(),
                to: next.to_string(),
            });
        }

        let previous = order.status;
        order.status = next;
        order.ts_update = Utc::now();
        if next.is_terminal() {
            order.ts_final = Some(order.ts_update);
        }

        self.store
            .hset(&order_key(&order.oid), &order.to_fields())
            .await?;
        self.store
            .srem(&status_index_key(previous), &order.oid)
            .await?;
        self.store.sadd(&status_index_key(next), &order.oid).await?;
        Ok(())
    }

    /// Remove an order record and its index entries.
    pub async fn delete(&self, order: &Order) -> Result<()> {
        self.store.delete(&order_key(&order.oid)).await?;
        self.store
            .srem(&status_index_key(order.status), &order.oid)
            .await?;
        self.store
            .srem(&symbol_index_key(&order.symbol), &order.oid)
            .await?;
        Ok(())
    }

    /// All OPEN orders (`new` + `partially_filled`).
    pub async fn scan_open(&self) -> Result<Vec<Order>> {
        let mut oids = Vec::new();
        for status in OrderStatus::OPEN {
            oids.extend(self.store.smembers(&status_index_key(status)).await?);
        }
        self.resolve(&oids).await
    }

    /// Terminal orders whose `ts_final` is before `cutoff`.
    pub async fn scan_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        let mut oids = Vec::new();
        for status in OrderStatus::TERMINAL {
            oids.extend(self.store.smembers(&status_index_key(status)).await?);
        }
        let orders = self.resolve(&oids).await?;
        Ok(orders
            .into_iter()
            .filter(|o| o.ts_final.is_some_and(|ts| ts < cutoff))
            .collect())
    }

    /// Fetch records for `oids`, skipping index entries whose record has
    /// already been deleted (a scan can race the pruner).
    async fn resolve(&self, oids: &[String]) -> Result<Vec<Order>> {
        let mut orders = Vec::with_capacity(oids.len());
        for oid in oids {
            let key = order_key(oid);
            let fields = self.store.hget_all(&key).await?;
            if fields.is_empty() {
                debug!(oid = %oid, "stale index entry, order record gone");
                continue;
            }
            orders.push(Order::from_fields(&key, &fields)?);
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::OrderKind;

    fn book() -> Orderbook {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Orderbook::new(store)
    }

    fn draft(symbol: &str, side: Side, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            oid: String::new(),
            symbol: Symbol::new(symbol),
            side,
            kind: OrderKind::Limit,
            amount: 1.0,
            limit_price: Some(100.0),
            reserved: 100.075,
            commission_rate: 0.00075,
            cash_asset: "USDT".to_string(),
            status,
            filled: 0.0,
            notional: 0.0,
            fee: 0.0,
            avg_price: None,
            ts_create: now,
            ts_update: now,
            ts_final: None,
            cancel_reason: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_oids() {
        let book = book();
        let a = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        let b = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();

        assert_eq!(a.oid, "ord-00000001");
        assert_eq!(b.oid, "ord-00000002");
        assert!(a.oid < b.oid);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let book = book();
        let err = book.get("ord-missing").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_moves_status_index() {
        let book = book();
        let mut order = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();

        book.transition(&mut order, OrderStatus::Filled).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.ts_final.is_some());

        let open = book
            .list(
                &OrderFilter {
                    status: Some(OrderStatus::New),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(open.is_empty());

        let filled = book
            .list(
                &OrderFilter {
                    status: Some(OrderStatus::Filled),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].oid, order.oid);
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_record_untouched() {
        let book = book();
        let mut order = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        book.transition(&mut order, OrderStatus::Filled).await.unwrap();

        let err = book
            .transition(&mut order, OrderStatus::Canceled)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::IllegalTransition { .. }));

        let stored = book.get(&order.oid).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_list_filters_and_tail() {
        let book = book();
        book.create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        book.create(draft("ETH/USDT", Side::Sell, OrderStatus::New))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newest = book
            .create(draft("BTC/USDT", Side::Sell, OrderStatus::New))
            .await
            .unwrap();

        let btc = book
            .list(
                &OrderFilter {
                    symbol: Some(Symbol::new("BTC/USDT")),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(btc.len(), 2);

        let sells = book
            .list(
                &OrderFilter {
                    side: Some(Side::Sell),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(sells.len(), 2);

        // tail=1 returns the most recently updated order
        let tail = book.list(&OrderFilter::default(), Some(1)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].oid, newest.oid);
    }

    #[tokio::test]
    async fn test_scan_open_and_terminal() {
        let book = book();
        let open = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        let mut done = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        book.transition(&mut done, OrderStatus::Canceled).await.unwrap();

        let open_orders = book.scan_open().await.unwrap();
        assert_eq!(open_orders.len(), 1);
        assert_eq!(open_orders[0].oid, open.oid);

        // Terminal scan with a future cutoff picks up the cancelled order
        let cutoff = Utc::now() + chrono::Duration::seconds(60);
        let stale = book.scan_terminal_older_than(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].oid, done.oid);

        // ...and a past cutoff does not
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert!(book.scan_terminal_older_than(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_indexes() {
        let book = book();
        let order = book
            .create(draft("BTC/USDT", Side::Buy, OrderStatus::New))
            .await
            .unwrap();
        book.delete(&order).await.unwrap();

        assert!(matches!(
            book.get(&order.oid).await.unwrap_err(),
            ExchangeError::NotFound(_)
        ));
        assert!(book.list(&OrderFilter::default(), None).await.unwrap().is_empty());
    }
}
