//! Configuration management
//!
//! JSON config file with full defaults, so an empty file (or none at all)
//! yields a working engine. `REDIS_URL` overrides the store URL so container
//! deployments can point at their own store without a config file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file is
    /// given.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.url = url;
        }
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.commission_rate < 0.0 {
            bail!("commission_rate must be >= 0");
        }
        if engine.cash_asset.is_empty() {
            bail!("cash_asset must not be empty");
        }
        if engine.min_time_answer_order_market < 0.0
            || engine.max_time_answer_order_market < engine.min_time_answer_order_market
        {
            bail!("market latency bounds must satisfy 0 <= min <= max");
        }
        if engine.sigma_fill_market_order < 0.0 {
            bail!("sigma_fill_market_order must be >= 0");
        }
        if engine.expire_after_h < 0.0 || engine.stale_after_h < 0.0 {
            bail!("expire_after_h and stale_after_h must be >= 0");
        }
        if self.scheduler.tick_loop_sec == 0 {
            bail!("tick_loop_sec must be >= 1");
        }
        Ok(())
    }
}

/// Key-value store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis-protocol URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Retry attempts for transient store failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            url: default_store_url(),
            max_retries: default_max_retries(),
        }
    }
}

/// Engine behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Fee fraction applied to every fill, charged in the quote asset
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,

    /// Quote asset used for valuation in the overview report
    #[serde(default = "default_cash_asset")]
    pub cash_asset: String,

    /// Lower bound of the simulated market-order round trip, seconds
    #[serde(default = "default_min_answer_time")]
    pub min_time_answer_order_market: f64,

    /// Upper bound of the simulated market-order round trip, seconds
    #[serde(default = "default_max_answer_time")]
    pub max_time_answer_order_market: f64,

    /// Stddev of the market-order fill ratio; 0 always fills in full
    #[serde(default = "default_sigma_fill")]
    pub sigma_fill_market_order: f64,

    /// Hours an OPEN order may live before the pruner expires it
    #[serde(default = "default_expire_after_h")]
    pub expire_after_h: f64,

    /// Hours a terminal order is kept before the pruner deletes it
    #[serde(default = "default_stale_after_h")]
    pub stale_after_h: f64,

    /// Optional staleness horizon for tickers, seconds. When set, market
    /// orders against an older quote are rejected and limit settlement for
    /// that symbol is deferred. Off by default.
    #[serde(default)]
    pub stale_ticker_max_age_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            commission_rate: default_commission_rate(),
            cash_asset: default_cash_asset(),
            min_time_answer_order_market: default_min_answer_time(),
            max_time_answer_order_market: default_max_answer_time(),
            sigma_fill_market_order: default_sigma_fill(),
            expire_after_h: default_expire_after_h(),
            stale_after_h: default_stale_after_h(),
            stale_ticker_max_age_secs: None,
        }
    }
}

/// Background loop intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between limit-settlement sweeps
    #[serde(default = "default_tick_loop_sec")]
    pub tick_loop_sec: u64,

    /// Minutes between prune sweeps; 0 disables the prune loop
    #[serde(default = "default_prune_every_min")]
    pub prune_every_min: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_loop_sec: default_tick_loop_sec(),
            prune_every_min: default_prune_every_min(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_commission_rate() -> f64 {
    0.00075
}

fn default_cash_asset() -> String {
    "USDT".to_string()
}

fn default_min_answer_time() -> f64 {
    3.0
}

fn default_max_answer_time() -> f64 {
    5.0
}

fn default_sigma_fill() -> f64 {
    0.1
}

fn default_expire_after_h() -> f64 {
    24.0
}

fn default_stale_after_h() -> f64 {
    24.0
}

fn default_tick_loop_sec() -> u64 {
    30
}

fn default_prune_every_min() -> u64 {
    60
}
