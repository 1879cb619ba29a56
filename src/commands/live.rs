//! Live Trading Command
//!
//! Paper and real-money trading on KuCoin:
//! - Async event loop on a tokio interval with graceful Ctrl-C shutdown
//! - Each tick runs on the blocking pool (the exchange client is blocking)
//! - Crash recovery from the SQLite journal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dip_trader::execution::{ExecutionAdapter, SimulatedExecution};
use dip_trader::journal::Journal;
use dip_trader::kucoin::KuCoinClient;
use dip_trader::live::{LiveTrader, TickOutcome};
use dip_trader::predictor::SupportLevelPredictor;
use dip_trader::Config;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{load_config, Overrides};

pub fn run(
    config_path: String,
    overrides: Overrides,
    paper: bool,
    live: bool,
    interval_secs: Option<u64>,
    journal_path: String,
) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }
    if live && paper {
        anyhow::bail!("Cannot specify both --paper and --live modes");
    }

    let mut config = load_config(&config_path, &overrides)?;
    if let Some(secs) = interval_secs {
        config.trading.poll_interval_secs = secs;
    }
    if config.trading.poll_interval_secs == 0 {
        anyhow::bail!("Poll interval must be at least one second");
    }

    // the blocking HTTP client must be created and dropped outside the runtime
    let client = Arc::new(KuCoinClient::new(&config.exchange, &config.trading.quote_currency)?);
    if live && !client.has_credentials() {
        anyhow::bail!(
            "Live mode needs KUCOIN_API_KEY, KUCOIN_API_SECRET and KUCOIN_API_PASSPHRASE"
        );
    }

    let execution: Arc<dyn ExecutionAdapter> = if paper {
        Arc::new(SimulatedExecution::from_config(&config.strategy))
    } else {
        client.clone()
    };
    let journal = Journal::open(&journal_path)
        .with_context(|| format!("Failed to open journal at {}", journal_path))?;

    let trader = LiveTrader::new(
        &config,
        Arc::new(SupportLevelPredictor::default()),
        client,
        execution,
        Some(journal),
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let trader = runtime.block_on(run_async(config, trader, paper))?;
    drop(runtime);
    drop(trader);
    Ok(())
}

async fn run_async(config: Config, mut trader: LiveTrader, paper_mode: bool) -> Result<LiveTrader> {
    let mode_str = if paper_mode { "PAPER" } else { "LIVE" };

    info!("{}", "=".repeat(64));
    info!("DIP TRADER - {} MODE", mode_str);
    info!("{}", "=".repeat(64));
    info!("Symbols: {}", config.trading.symbols.join(", "));
    info!("Timeframe: {}", config.trading.timeframe);
    info!("Initial Capital: ${:.2}", config.trading.initial_capital);
    info!("Poll Interval: {} seconds", config.trading.poll_interval_secs);
    info!("{}", "=".repeat(64));

    if !paper_mode {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");

        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    trader = tokio::task::spawn_blocking(move || {
        trader.recover(Utc::now()).map(|_| trader)
    })
    .await
    .context("Recovery task panicked")??;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut poll = interval(Duration::from_secs(config.trading.poll_interval_secs));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick_count: u64 = 0;

    info!("Starting trading loop...");

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }

                tick_count += 1;
                let (returned, outcomes) = tokio::task::spawn_blocking(move || {
                    let outcomes = trader.tick(Utc::now());
                    (trader, outcomes)
                })
                .await
                .context("Trading tick panicked")?;
                trader = returned;

                for (symbol, outcome) in &outcomes {
                    match outcome {
                        TickOutcome::Closed(trade) => info!(
                            "{} closed: pnl {:.2} ({:.2}%)",
                            symbol, trade.pnl, trade.pnl_pct
                        ),
                        TickOutcome::FillFailed { side, reason } => {
                            warn!("{} {} not filled: {}", symbol, side, reason)
                        }
                        other => debug!("{}: {:?}", symbol, other),
                    }
                }
                debug!(
                    "Tick {} done, available capital {:.2}",
                    tick_count,
                    trader.capital().available()
                );
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    trader.shutdown();
    info!("Live trading session ended after {} ticks.", tick_count);
    Ok(trader)
}
