//! Mock exchange engine - service entry point
//!
//! Subcommands:
//! - run: tick + prune loops until Ctrl-C
//! - overview: reconciliation report (non-zero exit on mismatch)
//! - prune: one maintenance sweep
//! - fund: admin credit to a free balance
//! - set-price: admin ticker override
//! - wipe: clear all engine-owned keys

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mockexchange_engine::config::Config;
use mockexchange_engine::engine::Engine;
use mockexchange_engine::scheduler::Scheduler;
use mockexchange_engine::store::{MemoryStore, RedisStore, Store};
use mockexchange_engine::types::Symbol;

#[derive(Parser, Debug)]
#[command(name = "mockexchange-engine")]
#[command(about = "Single-user mock spot exchange engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to JSON configuration file (defaults + env when omitted)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Use the in-memory store instead of Redis (state dies with the
    /// process; handy for local experiments)
    #[arg(long, global = true)]
    memory: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the settlement and prune loops until Ctrl-C
    Run,

    /// Print the per-asset reconciliation report
    Overview,

    /// Run one prune sweep (expire + delete) and exit
    Prune,

    /// Credit an asset's free balance
    Fund {
        /// Asset to credit, e.g. USDT
        #[arg(long)]
        asset: String,

        /// Amount to add to the free balance
        #[arg(long)]
        amount: f64,
    },

    /// Force a ticker price (admin override, fresh timestamp)
    SetPrice {
        /// Symbol to write, e.g. BTC/USDT
        #[arg(long)]
        symbol: String,

        /// Last trade price to publish
        #[arg(long)]
        price: f64,
    },

    /// Delete every engine-owned key from the store
    Wipe {
        /// Required confirmation flag
        #[arg(long)]
        yes: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn load_config(path: &Option<String>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("Failed to load config from {path}"))
        }
        None => Config::from_env(),
    }
}

fn build_store(config: &Config, memory: bool) -> Result<Arc<dyn Store>> {
    if memory {
        info!("Using in-memory store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        info!("Using redis store at {}", config.store.url);
        let store = RedisStore::connect(&config.store.url, config.store.max_retries)?;
        Ok(Arc::new(store))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let command_name = match &cli.command {
        Commands::Run => "run",
        Commands::Overview => "overview",
        Commands::Prune => "prune",
        Commands::Fund { .. } => "fund",
        Commands::SetPrice { .. } => "set-price",
        Commands::Wipe { .. } => "wipe",
    };
    setup_logging(cli.verbose, command_name)?;

    let config = load_config(&cli.config)?;
    let store = build_store(&config, cli.memory)?;
    let engine = Engine::new(store, config.engine.clone())
        .context("Failed to build engine")?;

    match cli.command {
        Commands::Run => run(engine, &config).await,
        Commands::Overview => overview(engine).await,
        Commands::Prune => {
            let stats = engine.prune().await?;
            println!("prune: {stats}");
            Ok(())
        }
        Commands::Fund { asset, amount } => {
            let row = engine.fund(&asset, amount).await?;
            println!(
                "{asset}: free={:.8} used={:.8}",
                row.free, row.used
            );
            Ok(())
        }
        Commands::SetPrice { symbol, price } => {
            let symbol = parse_symbol(&symbol)?;
            let ticker = engine.force_price(&symbol, price).await?;
            println!("{}: price={:.8}", ticker.symbol, ticker.price);
            Ok(())
        }
        Commands::Wipe { yes } => {
            if !yes {
                bail!("refusing to wipe without --yes");
            }
            let deleted = engine.wipe().await?;
            println!("wiped {deleted} keys");
            Ok(())
        }
    }
}

async fn run(engine: Engine, config: &Config) -> Result<()> {
    engine
        .healthz()
        .await
        .context("Store is not reachable")?;

    info!(
        "Engine up: cash={} commission={} tick={}s prune={}min",
        config.engine.cash_asset,
        config.engine.commission_rate,
        config.scheduler.tick_loop_sec,
        config.scheduler.prune_every_min,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Error setting up signal handler: {e}"),
        }
    });

    let handle = Scheduler::start(engine, &config.scheduler, shutdown_rx);
    handle.join().await;

    info!("Engine stopped.");
    Ok(())
}

async fn overview(engine: Engine) -> Result<()> {
    let report = engine.overview_assets().await?;

    println!(
        "{:<10} {:>18} {:>18} {:>18}  {}",
        "ASSET", "FREE", "USED", "EXPECTED_USED", "STATUS"
    );
    for row in &report.rows {
        println!(
            "{:<10} {:>18.8} {:>18.8} {:>18.8}  {}",
            row.asset,
            row.free,
            row.used,
            row.expected_used,
            if row.mismatch { "MISMATCH" } else { "ok" }
        );
    }
    println!(
        "total value: {:.8} {} (unpriced assets excluded)",
        report.total_value, report.cash_asset
    );

    if !report.consistent {
        bail!("reconciliation mismatch detected");
    }
    Ok(())
}

fn parse_symbol(raw: &str) -> Result<Symbol> {
    let symbol = Symbol::new(raw);
    if symbol.pair().is_none() {
        bail!("malformed symbol {raw} (expected BASE/QUOTE)");
    }
    Ok(symbol)
}
