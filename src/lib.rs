//! # signal-bench
//!
//! Deterministic backtesting and signal-evaluation core for trading-signal
//! platforms.
//!
//! The crate is built around a closed loop: a signal source produces a
//! directional event stream, the aggregator folds it into per-minute net
//! scores, the execution engine simulates next-bar-open fills against OHLCV
//! bars, and the reporter derives metrics and artifacts. Walk-forward and
//! mode-comparison orchestration wrap that loop.
//!
//! ## Signal sources
//!
//! Three interchangeable sources produce the same ordered
//! [`SignalEvent`](models::SignalEvent) stream:
//!
//! - **history** — replay of persisted signals ([`sources::history`])
//! - **synthetic** — deterministic pseudo-signals derived from bars
//!   ([`sources::synthetic`])
//! - **rule replay** — the declarative rule set evaluated over historical
//!   indicator rows ([`sources::rule_replay`])
//!
//! ## Quick start
//!
//! ```no_run
//! use signal_bench::config::BacktestConfig;
//! use signal_bench::runner::{run_backtest, RunnerEnv};
//! use signal_bench::RunMode;
//!
//! # async fn example(env: RunnerEnv) -> anyhow::Result<()> {
//! let config = BacktestConfig::default();
//! let result = run_backtest(&env, &config, RunMode::HistorySignal, None, None).await?;
//! println!("return: {:+.2}%", result.metrics.total_return_pct);
//! # Ok(())
//! # }
//! ```
//!
//! ## External collaborators
//!
//! Storage and clocks are traits in [`store`]: [`store::CandleStore`],
//! [`store::SignalStore`], [`store::IndicatorStore`],
//! [`store::ArtifactSink`], [`store::RunStateSink`], [`store::Clock`].
//! The crate never opens a database or a socket itself.

#![recursion_limit = "256"]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Signal score aggregation (per-minute net scores with forward fill)
pub mod aggregator;
/// Artifact writers (trades/equity/metrics/report) and the filesystem sink
pub mod artifacts;
/// History vs rule-replay comparison
pub mod comparison;
/// Backtest configuration, loading, and CLI overrides
pub mod config;
/// Persistent cooldown ledger for rule firings
pub mod cooldown;
/// Error types and result definitions
pub mod error;
/// Event-driven position simulator
pub mod execution;
/// Performance metric derivation
pub mod metrics;
/// Core data model (bars, events, positions, trades, metrics)
pub mod models;
/// Input coverage precheck
pub mod precheck;
/// Old-run retention and the `latest` pointer
pub mod retention;
/// Single-backtest orchestration
pub mod runner;
/// Declarative signal rules and their evaluator
pub mod rules;
/// Signal sources (history, synthetic replay, rule replay)
pub mod sources;
/// Run-state persistence for external observers
pub mod state;
/// External storage interfaces, retry policy, and rate limiting
pub mod store;
/// Time parsing, bucketing, and timeframe utilities
pub mod time;
/// Walk-forward fold driver
pub mod walk_forward;

pub use config::BacktestConfig;
pub use error::{BacktestError, Result};
pub use models::{Bar, Direction, EquityPoint, Metrics, SignalEvent, Side, Trade, TradeReason};
pub use runner::{RunMode, RunnerResult};
