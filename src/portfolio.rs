//! Portfolio: per-asset balance ledger with reservations
//!
//! Each asset is a `bal_<ASSET>` hash with `free` and `used` fields. Open
//! orders move funds `free -> used` (reserve); fills consume `used`
//! (settle) and credit the counter-asset's `free`. Every operation runs
//! under the per-asset advisory lock; fills touch two assets and take both
//! locks in lexicographic order so concurrent fills cannot deadlock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExchangeError, Result};
use crate::store::{KeyLock, Store};
use crate::types::{BalanceRow, AMOUNT_EPSILON};

pub const BALANCE_PREFIX: &str = "bal_";

/// Balance operations are short (a handful of store calls), so a small TTL
/// bounds how long a crashed holder can block an asset.
const BALANCE_LOCK_TTL: Duration = Duration::from_secs(5);

/// Float drift this far below zero is clamped to zero; anything worse is a
/// corrupt ledger and fails loudly.
const NEGATIVE_DRIFT_TOLERANCE: f64 = 1e-6;

pub fn balance_key(asset: &str) -> String {
    format!("{BALANCE_PREFIX}{asset}")
}

fn balance_lock_key(asset: &str) -> String {
    format!("lock_{BALANCE_PREFIX}{asset}")
}

/// One fill's balance movement, applied atomically under both asset locks.
///
/// `spend` leaves the account from `spend_asset.used`; `release_back`
/// returns unused reservation from `used` to `free` on the same asset;
/// `credit` lands on `credit_asset.free`.
#[derive(Debug, Clone)]
pub struct FillSettlement {
    pub spend_asset: String,
    pub spend: f64,
    pub release_back: f64,
    pub credit_asset: String,
    pub credit: f64,
}

#[derive(Clone)]
pub struct Portfolio {
    store: Arc<dyn Store>,
}

impl Portfolio {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Portfolio { store }
    }

    /// Current row for `asset`; a missing key reads as zeros.
    pub async fn get(&self, asset: &str) -> Result<BalanceRow> {
        let key = balance_key(asset);
        let fields = self.store.hget_all(&key).await?;
        BalanceRow::from_fields(&key, &fields)
    }

    /// Admin override of both fields. Preserves non-negativity but not the
    /// reconciliation identity; the overview report will flag any skew
    /// against open orders.
    pub async fn set(&self, asset: &str, free: f64, used: f64) -> Result<BalanceRow> {
        ensure_asset(asset)?;
        if free < 0.0 || used < 0.0 {
            return Err(ExchangeError::InvalidArgument(format!(
                "balance fields must be >= 0 (free={free}, used={used})"
            )));
        }

        let lock = self.lock(asset).await?;
        let result = self
            .store
            .hset(
                &balance_key(asset),
                &[("free", free.to_string()), ("used", used.to_string())],
            )
            .await
            .map_err(ExchangeError::from);
        lock.release_or_warn().await;
        result?;
        Ok(BalanceRow { free, used })
    }

    /// Credit `free` (external deposit / admin funding).
    pub async fn fund(&self, asset: &str, amount: f64) -> Result<BalanceRow> {
        ensure_asset(asset)?;
        ensure_positive(amount, "fund amount")?;

        let lock = self.lock(asset).await?;
        let result = self.incr_free(asset, amount).await;
        lock.release_or_warn().await;
        result?;
        self.get(asset).await
    }

    /// Move `free -> used` to back an order. Fails with
    /// `InsufficientFunds` when `free` cannot cover `amount`.
    pub async fn reserve(&self, asset: &str, amount: f64) -> Result<()> {
        ensure_asset(asset)?;
        ensure_positive(amount, "reserve amount")?;

        let lock = self.lock(asset).await?;
        let result = self.reserve_locked(asset, amount).await;
        lock.release_or_warn().await;
        result
    }

    async fn reserve_locked(&self, asset: &str, amount: f64) -> Result<()> {
        let row = self.get(asset).await?;
        if row.free + AMOUNT_EPSILON < amount {
            return Err(ExchangeError::InsufficientFunds {
                asset: asset.to_string(),
                needed: amount,
                free: row.free,
            });
        }
        self.incr_free(asset, -amount).await?;
        self.incr_used(asset, amount).await?;
        Ok(())
    }

    /// Move `used -> free` (cancel, expiry, unused remainder of a fill).
    pub async fn release(&self, asset: &str, amount: f64) -> Result<()> {
        ensure_asset(asset)?;
        ensure_positive(amount, "release amount")?;

        let lock = self.lock(asset).await?;
        let result = self.release_locked(asset, amount).await;
        lock.release_or_warn().await;
        result
    }

    async fn release_locked(&self, asset: &str, amount: f64) -> Result<()> {
        let row = self.get(asset).await?;
        if amount > row.used + NEGATIVE_DRIFT_TOLERANCE {
            return Err(corrupt_ledger(
                asset,
                format!("release {amount} exceeds used {}", row.used),
            ));
        }
        let amount = amount.min(row.used);
        self.incr_used(asset, -amount).await?;
        self.incr_free(asset, amount).await?;
        Ok(())
    }

    /// Remove funds from `used` (spent quote on a buy, delivered base on a
    /// sell). The funds leave the account.
    pub async fn settle_out(&self, asset: &str, amount: f64) -> Result<()> {
        ensure_asset(asset)?;
        ensure_positive(amount, "settle amount")?;

        let lock = self.lock(asset).await?;
        let result = self.settle_out_locked(asset, amount).await;
        lock.release_or_warn().await;
        result
    }

    async fn settle_out_locked(&self, asset: &str, amount: f64) -> Result<()> {
        let row = self.get(asset).await?;
        if amount > row.used + NEGATIVE_DRIFT_TOLERANCE {
            return Err(corrupt_ledger(
                asset,
                format!("settle_out {amount} exceeds used {}", row.used),
            ));
        }
        let amount = amount.min(row.used);
        self.incr_used(asset, -amount).await?;
        Ok(())
    }

    /// Credit `free` with fill proceeds.
    pub async fn credit_free(&self, asset: &str, amount: f64) -> Result<()> {
        ensure_asset(asset)?;
        ensure_positive(amount, "credit amount")?;

        let lock = self.lock(asset).await?;
        let result = self.incr_free(asset, amount).await;
        lock.release_or_warn().await;
        result
    }

    /// Apply one fill's movements atomically: spend and release on the
    /// reserve asset, credit on the counter asset. Locks are taken in
    /// lexicographic asset order.
    pub async fn apply_fill(&self, settlement: &FillSettlement) -> Result<()> {
        ensure_asset(&settlement.spend_asset)?;
        ensure_asset(&settlement.credit_asset)?;
        for (label, value) in [
            ("spend", settlement.spend),
            ("release_back", settlement.release_back),
            ("credit", settlement.credit),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ExchangeError::InvalidArgument(format!(
                    "fill {label} must be finite and >= 0, got {value}"
                )));
            }
        }

        let mut assets = [
            settlement.spend_asset.as_str(),
            settlement.credit_asset.as_str(),
        ];
        assets.sort_unstable();

        let first = self.lock(assets[0]).await?;
        let second = if assets[1] != assets[0] {
            Some(self.lock(assets[1]).await?)
        } else {
            None
        };

        let result = self.apply_fill_locked(settlement).await;

        if let Some(lock) = second {
            lock.release_or_warn().await;
        }
        first.release_or_warn().await;
        result
    }

    async fn apply_fill_locked(&self, settlement: &FillSettlement) -> Result<()> {
        let out_total = settlement.spend + settlement.release_back;
        let row = self.get(&settlement.spend_asset).await?;
        if out_total > row.used + NEGATIVE_DRIFT_TOLERANCE {
            return Err(corrupt_ledger(
                &settlement.spend_asset,
                format!(
                    "fill needs {out_total} from used but only {} is reserved",
                    row.used
                ),
            ));
        }

        self.incr_used(&settlement.spend_asset, -out_total.min(row.used))
            .await?;
        if settlement.release_back > 0.0 {
            self.incr_free(&settlement.spend_asset, settlement.release_back)
                .await?;
        }
        if settlement.credit > 0.0 {
            self.incr_free(&settlement.credit_asset, settlement.credit)
                .await?;
        }
        Ok(())
    }

    /// Assets with a balance row, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let keys = self.store.keys_with_prefix(BALANCE_PREFIX).await?;
        let mut assets: Vec<String> = keys
            .iter()
            .map(|k| k[BALANCE_PREFIX.len()..].to_string())
            .collect();
        assets.sort();
        Ok(assets)
    }

    pub async fn snapshot(&self) -> Result<BTreeMap<String, BalanceRow>> {
        let mut rows = BTreeMap::new();
        for asset in self.list().await? {
            let row = self.get(&asset).await?;
            rows.insert(asset, row);
        }
        Ok(rows)
    }

    async fn lock(&self, asset: &str) -> Result<KeyLock> {
        KeyLock::acquire(&self.store, &balance_lock_key(asset), BALANCE_LOCK_TTL)
            .await
            .map_err(ExchangeError::from)
    }

    /// Increment a balance field, clamping sub-tolerance float drift back
    /// to zero so invariant 1 (`free, used >= 0`) holds exactly.
    async fn incr_field(&self, asset: &str, field: &str, delta: f64) -> Result<()> {
        let key = balance_key(asset);
        let next = self.store.hincr(&key, field, delta).await?;
        if next < 0.0 {
            if next < -NEGATIVE_DRIFT_TOLERANCE {
                return Err(corrupt_ledger(
                    asset,
                    format!("{field} went negative: {next}"),
                ));
            }
            self.store.hset(&key, &[(field, "0".to_string())]).await?;
        }
        Ok(())
    }

    async fn incr_free(&self, asset: &str, delta: f64) -> Result<()> {
        self.incr_field(asset, "free", delta).await
    }

    async fn incr_used(&self, asset: &str, delta: f64) -> Result<()> {
        self.incr_field(asset, "used", delta).await
    }
}

fn ensure_asset(asset: &str) -> Result<()> {
    if asset.is_empty() {
        return Err(ExchangeError::InvalidArgument("empty asset name".into()));
    }
    Ok(())
}

fn ensure_positive(amount: f64, what: &str) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ExchangeError::InvalidArgument(format!(
            "{what} must be > 0, got {amount}"
        )));
    }
    Ok(())
}

fn corrupt_ledger(asset: &str, reason: String) -> ExchangeError {
    ExchangeError::Corrupt {
        key: balance_key(asset),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use approx::assert_abs_diff_eq;

    fn portfolio() -> Portfolio {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Portfolio::new(store)
    }

    #[tokio::test]
    async fn test_missing_asset_reads_as_zeros() {
        let p = portfolio();
        let row = p.get("BTC").await.unwrap();
        assert_eq!(row.free, 0.0);
        assert_eq!(row.used, 0.0);
    }

    #[tokio::test]
    async fn test_fund_and_reserve() {
        let p = portfolio();
        p.fund("USDT", 1_000.0).await.unwrap();
        p.reserve("USDT", 400.0).await.unwrap();

        let row = p.get("USDT").await.unwrap();
        assert_abs_diff_eq!(row.free, 600.0, epsilon = AMOUNT_EPSILON);
        assert_abs_diff_eq!(row.used, 400.0, epsilon = AMOUNT_EPSILON);
    }

    #[tokio::test]
    async fn test_reserve_insufficient() {
        let p = portfolio();
        p.fund("USDT", 100.0).await.unwrap();

        let err = p.reserve("USDT", 100.5).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));

        // Balance untouched on failure
        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, 100.0);
        assert_eq!(row.used, 0.0);
    }

    #[tokio::test]
    async fn test_release_round_trip() {
        let p = portfolio();
        p.fund("USDT", 500.0).await.unwrap();
        p.reserve("USDT", 500.0).await.unwrap();
        p.release("USDT", 500.0).await.unwrap();

        let row = p.get("USDT").await.unwrap();
        assert_abs_diff_eq!(row.free, 500.0, epsilon = AMOUNT_EPSILON);
        assert_eq!(row.used, 0.0);
    }

    #[tokio::test]
    async fn test_release_overdraw_fails_loudly() {
        let p = portfolio();
        p.fund("USDT", 100.0).await.unwrap();
        p.reserve("USDT", 50.0).await.unwrap();

        let err = p.release("USDT", 60.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_settle_out_consumes_used() {
        let p = portfolio();
        p.fund("BTC", 2.0).await.unwrap();
        p.reserve("BTC", 1.5).await.unwrap();
        p.settle_out("BTC", 1.5).await.unwrap();

        let row = p.get("BTC").await.unwrap();
        assert_abs_diff_eq!(row.free, 0.5, epsilon = AMOUNT_EPSILON);
        assert_eq!(row.used, 0.0);
    }

    #[tokio::test]
    async fn test_apply_fill_buy_shape() {
        let p = portfolio();
        // Buy 0.05 BTC at 50k with 0.00075 commission: reserve 2501.875,
        // spend 2501.875, credit 0.05 BTC.
        p.fund("USDT", 10_000.0).await.unwrap();
        p.reserve("USDT", 2_501.875).await.unwrap();

        p.apply_fill(&FillSettlement {
            spend_asset: "USDT".to_string(),
            spend: 2_501.875,
            release_back: 0.0,
            credit_asset: "BTC".to_string(),
            credit: 0.05,
        })
        .await
        .unwrap();

        let usdt = p.get("USDT").await.unwrap();
        let btc = p.get("BTC").await.unwrap();
        assert_abs_diff_eq!(usdt.free, 7_498.125, epsilon = 1e-6);
        assert_eq!(usdt.used, 0.0);
        assert_abs_diff_eq!(btc.free, 0.05, epsilon = AMOUNT_EPSILON);
    }

    #[tokio::test]
    async fn test_apply_fill_with_release_back() {
        let p = portfolio();
        // Sell partially filled: 1.0 reserved, 0.6 delivered, 0.4 returned.
        p.fund("BTC", 1.0).await.unwrap();
        p.reserve("BTC", 1.0).await.unwrap();

        p.apply_fill(&FillSettlement {
            spend_asset: "BTC".to_string(),
            spend: 0.6,
            release_back: 0.4,
            credit_asset: "USDT".to_string(),
            credit: 29_977.5,
        })
        .await
        .unwrap();

        let btc = p.get("BTC").await.unwrap();
        let usdt = p.get("USDT").await.unwrap();
        assert_abs_diff_eq!(btc.free, 0.4, epsilon = AMOUNT_EPSILON);
        assert_eq!(btc.used, 0.0);
        assert_abs_diff_eq!(usdt.free, 29_977.5, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_set_rejects_negative() {
        let p = portfolio();
        assert!(p.set("USDT", -1.0, 0.0).await.is_err());
        assert!(p.set("USDT", 0.0, -1.0).await.is_err());
        p.set("USDT", 10.0, 5.0).await.unwrap();
        let row = p.get("USDT").await.unwrap();
        assert_eq!(row.free, 10.0);
        assert_eq!(row.used, 5.0);
    }

    #[tokio::test]
    async fn test_snapshot_lists_all_assets() {
        let p = portfolio();
        p.fund("USDT", 1.0).await.unwrap();
        p.fund("BTC", 2.0).await.unwrap();

        let snapshot = p.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["BTC"].free, 2.0);
        assert_eq!(p.list().await.unwrap(), vec!["BTC", "USDT"]);
    }
}
