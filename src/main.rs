//! Dip trader - main entry point
//!
//! This binary provides four subcommands:
//! - backtest: Run strategy backtests on CSV data
//! - optimize: Grid-search strategy parameters
//! - live: Run live trading (paper or real) on KuCoin
//! - download: Download historical candles from KuCoin

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::optimize::GridOverrides;
use commands::Overrides;

#[derive(Parser, Debug)]
#[command(name = "dip-trader")]
#[command(about = "Buy-the-dip crypto strategy with backtesting, optimization, and live trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Save per-symbol results as JSON under the results dir
        #[arg(long)]
        save: bool,
    },

    /// Optimize strategy parameters
    Optimize {
        /// Path to base configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Optimization mode (quick, full, or custom)
        #[arg(short, long, default_value = "quick")]
        mode: String,

        /// Sort results by metric (sharpe, return, win_rate, drawdown)
        #[arg(long, default_value = "sharpe")]
        sort_by: String,

        /// Number of top results to show
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Entry level counts to test (comma-separated). E.g., "2,3,4"
        #[arg(long)]
        levels: Option<String>,

        /// Trailing gaps in percent to test. E.g., "0.25,0.5,1.0"
        #[arg(long)]
        gaps: Option<String>,

        /// Activation margins without DCA to test. E.g., "3,5,7.5"
        #[arg(long)]
        pm_no_dca: Option<String>,

        /// Activation margins after DCA to test. E.g., "1.5,2.5"
        #[arg(long)]
        pm_with_dca: Option<String>,
    },

    /// Run live trading
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        #[command(flatten)]
        overrides: Overrides,

        /// Paper trading mode (safe, no real money)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Poll interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// Journal database path
        #[arg(long, default_value = "state/journal.db")]
        journal: String,
    },

    /// Download historical data from KuCoin
    Download {
        /// Configuration file for exchange settings
        #[arg(short, long)]
        config: Option<String>,

        /// Symbols to download (comma-separated). E.g., "BTC,ETH,XRP"
        #[arg(short, long, default_value = "BTC,ETH,XRP,BNB,DOGE")]
        symbols: String,

        /// Timeframes (comma-separated). E.g., "1hour,4hour,1day"
        #[arg(short, long, default_value = "1hour")]
        timeframes: String,

        /// Number of days of history to fetch
        #[arg(short, long, default_value = "365")]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        output: String,
    },
}

fn setup_logging(verbose: bool, json: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    fn make_file_layer<S>(
        file_appender: tracing_appender::rolling::RollingFileAppender,
    ) -> impl tracing_subscriber::Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
    }

    if file_only {
        // keep the console clean for the progress bar
        tracing_subscriber::registry()
            .with(env_filter)
            .with(make_file_layer(file_appender))
            .init();
    } else if json {
        let console_layer = tracing_subscriber::fmt::layer().json().with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(make_file_layer(file_appender))
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(make_file_layer(file_appender))
            .init();
    }

    if !file_only {
        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", true),
        Commands::Live { .. } => ("live", false),
        Commands::Download { .. } => ("download", false),
    };

    setup_logging(cli.verbose, cli.json_logs, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            overrides,
            start,
            end,
            save,
        } => commands::backtest::run(config, overrides, start, end, save),

        Commands::Optimize {
            config,
            overrides,
            mode,
            sort_by,
            top,
            levels,
            gaps,
            pm_no_dca,
            pm_with_dca,
        } => commands::optimize::run(
            config,
            overrides,
            mode,
            sort_by,
            top,
            GridOverrides {
                levels,
                gaps,
                pm_no_dca,
                pm_with_dca,
            },
        ),

        Commands::Live {
            config,
            overrides,
            paper,
            live,
            interval,
            journal,
        } => commands::live::run(config, overrides, paper, live, interval, journal),

        Commands::Download {
            config,
            symbols,
            timeframes,
            days,
            output,
        } => commands::download::run(config, symbols, timeframes, days, output),
    }
}
