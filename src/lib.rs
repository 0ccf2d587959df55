//! Mock spot exchange engine
//!
//! Emulates a single-user spot exchange well enough that a trading bot
//! cannot tell the difference: orders, balances, commissions, latency and
//! partial fills all behave like the real thing, but settlement happens
//! against an externally-fed price stream and no money exists anywhere.
//! All state lives in a key-value store, so the service itself is
//! stateless and horizontally replaceable.

pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod orderbook;
pub mod portfolio;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::Config;
pub use engine::{AssetOverview, CanExecute, Engine, OrderRequest, OverviewReport};
pub use error::ExchangeError;
pub use types::*;
