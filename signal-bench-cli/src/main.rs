//! # sb - signal-bench CLI
//!
//! Command-line backtest runner for the signal-bench core.
//!
//! ```bash
//! # One backtest over persisted history signals
//! sb backtest --config strategies/default.crypto.json
//!
//! # Synthetic replay over a fixed window
//! sb backtest --config strategies/default.crypto.json \
//!     --mode offline_replay --start "2026-01-01 00:00:00" --end "2026-03-01 00:00:00"
//!
//! # Rolling walk-forward with auto fallback
//! sb backtest --config strategies/default.crypto.json --walk-forward
//!
//! # History vs rule-replay comparison
//! sb backtest --config strategies/default.crypto.json --mode compare_history_rule
//! ```
//!
//! Exit codes: 0 on success, 2 when the input-coverage precheck blocks the
//! run, 1 for any other failure.

mod backtest;
mod stores;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sb",
    version,
    about = "Deterministic trading-signal backtests",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest, walk-forward, or mode comparison
    Backtest(backtest::BacktestArgs),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Backtest(args) => match backtest::run(args).await {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(err) => {
                // One structured diagnostic line; details were logged upstream.
                eprintln!("error: {err}");
                std::process::ExitCode::from(err.exit_code() as u8)
            }
        },
    }
}
