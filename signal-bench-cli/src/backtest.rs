//! The `sb backtest` command: config resolution, precheck gate, and
//! dispatch to the runner, walk-forward driver, or comparator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{error, info, warn};

use signal_bench::artifacts::FsArtifactSink;
use signal_bench::comparison::run_comparison;
use signal_bench::config::{BacktestConfig, CliOverrides, load_config};
use signal_bench::cooldown::CooldownLedger;
use signal_bench::error::{BacktestError, Result};
use signal_bench::precheck::{
    PrecheckThresholds, collect_precheck_failures, compute_coverage_report, format_coverage_lines,
};
use signal_bench::runner::{RunMode, RunnerEnv, run_backtest};
use signal_bench::rules::{SignalRule, builtin_rules};
use signal_bench::state::{FsRunStateSink, done_state, error_state, running_state};
use signal_bench::store::{Clock, RunContext, RunStateSink, SystemClock};
use signal_bench::time::{format_utc, resolve_range};
use signal_bench::walk_forward::{WalkForwardOptions, run_walk_forward};

use crate::stores::{
    SqliteCandleStore, SqliteCooldownStore, SqliteIndicatorStore, SqliteSignalStore,
};

/// Arguments for `sb backtest`.
#[derive(Debug, Args)]
pub struct BacktestArgs {
    /// Strategy config file (JSON; `_moved_to` redirects are followed)
    #[arg(long)]
    pub config: PathBuf,

    /// Override window start, e.g. "2026-01-01 00:00:00"
    #[arg(long, default_value = "")]
    pub start: String,

    /// Override window end
    #[arg(long, default_value = "")]
    pub end: String,

    /// Override symbols, comma-separated
    #[arg(long, default_value = "")]
    pub symbols: String,

    /// Run mode
    #[arg(
        long,
        default_value = "history_signal",
        value_parser = [
            "history_signal",
            "offline_replay",
            "offline_rule_replay",
            "rule_replay",
            "compare_history_rule",
        ]
    )]
    pub mode: String,

    /// Optional run id (defaults to a UTC stamp)
    #[arg(long = "run-id", default_value = "")]
    pub run_id: String,

    /// Override execution.fee_bps
    #[arg(long = "fee-bps")]
    pub fee_bps: Option<f64>,

    /// Override execution.slippage_bps
    #[arg(long = "slippage-bps")]
    pub slippage_bps: Option<f64>,

    /// Enable long entries
    #[arg(long = "allow-long", overrides_with = "no_allow_long")]
    pub allow_long: bool,

    /// Disable long entries
    #[arg(long = "no-allow-long")]
    pub no_allow_long: bool,

    /// Enable short entries
    #[arg(long = "allow-short", overrides_with = "no_allow_short")]
    pub allow_short: bool,

    /// Disable short entries
    #[arg(long = "no-allow-short")]
    pub no_allow_short: bool,

    /// Override execution.min_hold_minutes
    #[arg(long = "min-hold-minutes")]
    pub min_hold_minutes: Option<u32>,

    /// Override execution.neutral_confirm_minutes (>= 1)
    #[arg(long = "neutral-confirm-minutes")]
    pub neutral_confirm_minutes: Option<u32>,

    /// Override risk.initial_equity
    #[arg(long = "initial-equity")]
    pub initial_equity: Option<f64>,

    /// Override risk.leverage
    #[arg(long)]
    pub leverage: Option<f64>,

    /// Override risk.position_size_pct
    #[arg(long = "position-size-pct")]
    pub position_size_pct: Option<f64>,

    /// Override walk_forward.train_days
    #[arg(long = "wf-train-days")]
    pub wf_train_days: Option<u32>,

    /// Override walk_forward.test_days
    #[arg(long = "wf-test-days")]
    pub wf_test_days: Option<u32>,

    /// Override walk_forward.step_days
    #[arg(long = "wf-step-days")]
    pub wf_step_days: Option<u32>,

    /// Override aggregation.long_open_threshold
    #[arg(long = "long-threshold")]
    pub long_threshold: Option<i32>,

    /// Override aggregation.short_open_threshold
    #[arg(long = "short-threshold")]
    pub short_threshold: Option<i32>,

    /// Override aggregation.close_threshold
    #[arg(long = "close-threshold")]
    pub close_threshold: Option<i32>,

    /// Run rolling walk-forward folds and write a summary
    #[arg(long = "walk-forward")]
    pub walk_forward: bool,

    /// Cap walk-forward folds (0 = no cap)
    #[arg(long = "walk-forward-max-folds", default_value_t = 0)]
    pub walk_forward_max_folds: u32,

    /// Auto-fallback thin history folds to offline replay
    #[arg(
        long = "walk-forward-auto-fallback",
        overrides_with = "no_walk_forward_auto_fallback"
    )]
    pub walk_forward_auto_fallback: bool,

    /// Disable walk-forward auto fallback
    #[arg(long = "no-walk-forward-auto-fallback")]
    pub no_walk_forward_auto_fallback: bool,

    /// Precheck guard for history_signal mode; 0 disables
    #[arg(long = "min-signal-days", default_value_t = 7)]
    pub min_signal_days: usize,

    /// Precheck guard for history_signal mode; 0 disables
    #[arg(long = "min-signal-count", default_value_t = 200)]
    pub min_signal_count: usize,

    /// Minimum candle coverage percentage required by precheck
    #[arg(long = "min-candle-coverage-pct", default_value_t = 95.0)]
    pub min_candle_coverage_pct: f64,

    /// Bypass precheck guard failures and continue
    #[arg(long)]
    pub force: bool,

    /// Only run the data coverage precheck and exit
    #[arg(long = "check-only")]
    pub check_only: bool,

    /// Signal-history SQLite database
    #[arg(long = "history-db", default_value = "data/signal_history.db")]
    pub history_db: PathBuf,

    /// Market-data SQLite database (candles + indicator tables)
    #[arg(long = "market-db", default_value = "data/market_data.db")]
    pub market_db: PathBuf,

    /// Artifact root directory
    #[arg(long = "artifacts-root", default_value = "artifacts/backtest")]
    pub artifacts_root: PathBuf,

    /// Rule-set JSON file (defaults to the built-in catalog)
    #[arg(long = "rules")]
    pub rules: Option<PathBuf>,
}

fn tri_state(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn load_rules(path: Option<&PathBuf>) -> Result<Vec<SignalRule>> {
    match path {
        None => Ok(builtin_rules()),
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let rules: Vec<SignalRule> = serde_json::from_str(&text)?;
            Ok(rules)
        }
    }
}

fn build_env(args: &BacktestArgs, config: &BacktestConfig) -> Result<RunnerEnv> {
    let cooldown_store =
        SqliteCooldownStore::open(&args.artifacts_root.join("cooldown_state.db"))?;
    Ok(RunnerEnv {
        candle_store: Arc::new(SqliteCandleStore::open(&args.market_db)?),
        signal_store: Arc::new(SqliteSignalStore::open(&args.history_db)?),
        indicator_store: Arc::new(SqliteIndicatorStore::open(
            &args.market_db,
            &config.timeframe,
        )?),
        artifact_sink: Arc::new(FsArtifactSink::new(&args.artifacts_root)),
        state_sink: Arc::new(FsRunStateSink::new(args.artifacts_root.join("run_state.json"))),
        clock: Arc::new(SystemClock),
        rules: load_rules(args.rules.as_ref())?,
        cooldown: Arc::new(CooldownLedger::new(Box::new(cooldown_store))?),
        ctx: RunContext::unbounded(),
        artifact_root: Some(args.artifacts_root.clone()),
    })
}

/// Execute `sb backtest`.
pub async fn run(args: BacktestArgs) -> Result<()> {
    let overrides = CliOverrides {
        start: Some(args.start.clone()).filter(|s| !s.is_empty()),
        end: Some(args.end.clone()).filter(|s| !s.is_empty()),
        symbols: Some(args.symbols.clone()).filter(|s| !s.is_empty()),
        fee_bps: args.fee_bps,
        slippage_bps: args.slippage_bps,
        allow_long: tri_state(args.allow_long, args.no_allow_long),
        allow_short: tri_state(args.allow_short, args.no_allow_short),
        min_hold_minutes: args.min_hold_minutes,
        neutral_confirm_minutes: args.neutral_confirm_minutes,
        initial_equity: args.initial_equity,
        leverage: args.leverage,
        position_size_pct: args.position_size_pct,
        wf_train_days: args.wf_train_days,
        wf_test_days: args.wf_test_days,
        wf_step_days: args.wf_step_days,
        long_open_threshold: args.long_threshold,
        short_open_threshold: args.short_threshold,
        close_threshold: args.close_threshold,
    };
    let config = load_config(Some(&args.config), &overrides)?;
    let mode = RunMode::parse(&args.mode)?;

    if args.walk_forward && mode == RunMode::CompareHistoryRule {
        return Err(BacktestError::invalid_param(
            "walk_forward",
            "--walk-forward cannot be combined with --mode compare_history_rule",
        ));
    }

    let env = build_env(&args, &config)?;
    let (start, end) = resolve_range(&config.date_range, 90, env.clock.now())?;

    // Precheck before any run: measure coverage, apply the guards.
    let coverage = compute_coverage_report(
        &env.ctx,
        &config,
        env.signal_store.as_ref(),
        env.candle_store.as_ref(),
        start,
        end,
    )
    .await?;
    for line in format_coverage_lines(&coverage) {
        info!("precheck: {line}");
    }

    let thresholds = PrecheckThresholds {
        min_signal_days: args.min_signal_days,
        min_signal_count: args.min_signal_count,
        min_candle_coverage_pct: args.min_candle_coverage_pct,
    };
    let failures = collect_precheck_failures(&coverage, mode.as_str(), &thresholds);

    if mode == RunMode::HistorySignal && coverage.signal_count == 0 {
        warn!("precheck: no signal rows in selected window; consider --mode offline_replay");
    }
    if mode == RunMode::OfflineRuleReplay {
        info!("precheck: offline_rule_replay replays indicator tables instead of signal history");
    }

    if !failures.is_empty() {
        for failure in &failures {
            error!("precheck guard: {failure}");
        }
        if !args.force {
            return Err(BacktestError::precheck(failures));
        }
        warn!(
            "--force enabled: continuing despite {} precheck guard failures",
            failures.len()
        );
    }

    if args.check_only {
        info!("check-only done");
        return Ok(());
    }

    let run_id = Some(args.run_id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let session_id = env.clock.now().format("%Y%m%d-%H%M%S").to_string();

    if mode == RunMode::CompareHistoryRule {
        let base_run_id =
            run_id.unwrap_or_else(|| env.clock.now().format("cmp-%Y%m%d-%H%M%S").to_string());
        return run_compare(&env, &config, &base_run_id, &session_id).await;
    }

    if args.walk_forward {
        let wf_run_id = run_id.unwrap_or_else(|| format!("wf-{mode}"));
        let options = WalkForwardOptions {
            max_folds: args.walk_forward_max_folds,
            auto_fallback: tri_state(
                args.walk_forward_auto_fallback,
                args.no_walk_forward_auto_fallback,
            )
            .unwrap_or(true),
            min_signal_days: args.min_signal_days,
            min_signal_count: args.min_signal_count,
        };
        return run_walk(&env, &config, mode, &wf_run_id, &session_id, &options).await;
    }

    let rid = run_id.unwrap_or_else(|| session_id.clone());
    let result = run_backtest(
        &env,
        &config,
        mode,
        Some(&rid),
        Some(&format!("{session_id}/{rid}")),
    )
    .await?;

    info!("run_id={}", result.run_id);
    info!("output={}", result.run_dir);
    info!(
        "return={:+.2}% max_dd={:.2}% sharpe={:.2} trades={}",
        result.metrics.total_return_pct,
        result.metrics.max_drawdown_pct,
        result.metrics.sharpe,
        result.metrics.trade_count,
    );
    Ok(())
}

async fn run_compare(
    env: &RunnerEnv,
    config: &BacktestConfig,
    base_run_id: &str,
    session_id: &str,
) -> Result<()> {
    let mode = RunMode::CompareHistoryRule;
    write_state(env, |prev, now| {
        running_state(
            prev,
            base_run_id,
            mode.as_str(),
            "compare_modes",
            "running history and rule replay backtests",
            now,
        )
    })
    .await;

    let outcome = match run_comparison(env, config, base_run_id, session_id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = err.to_string();
            write_state(env, |prev, now| {
                error_state(
                    prev,
                    base_run_id,
                    mode.as_str(),
                    "compare_modes",
                    &message,
                    "compare mode failed",
                    now,
                )
            })
            .await;
            return Err(err);
        }
    };

    write_state(env, |prev, now| {
        done_state(
            prev,
            base_run_id,
            mode.as_str(),
            &outcome.rule_replay.run_id,
            &format!(
                "compare done history={:+.2}% rule={:+.2}%",
                outcome.summary.history_return_pct, outcome.summary.rule_return_pct
            ),
            now,
        )
    })
    .await;

    info!("compare run_id={base_run_id}");
    info!(
        "history run={} return={:+.2}%",
        outcome.history.run_id, outcome.summary.history_return_pct
    );
    info!(
        "rule run={} return={:+.2}%",
        outcome.rule_replay.run_id, outcome.summary.rule_return_pct
    );
    info!("comparison output={}", outcome.compare_dir);
    Ok(())
}

async fn run_walk(
    env: &RunnerEnv,
    config: &BacktestConfig,
    mode: RunMode,
    wf_run_id: &str,
    session_id: &str,
    options: &WalkForwardOptions,
) -> Result<()> {
    write_state(env, |prev, now| {
        running_state(
            prev,
            wf_run_id,
            mode.as_str(),
            "walk_forward",
            "walk-forward executing folds",
            now,
        )
    })
    .await;

    let summary = match run_walk_forward(env, config, mode, wf_run_id, session_id, options).await {
        Ok(summary) => summary,
        Err(err) => {
            let message = err.to_string();
            write_state(env, |prev, now| {
                error_state(
                    prev,
                    wf_run_id,
                    mode.as_str(),
                    "walk_forward",
                    &message,
                    "walk-forward failed",
                    now,
                )
            })
            .await;
            return Err(err);
        }
    };

    write_state(env, |prev, now| {
        done_state(
            prev,
            wf_run_id,
            mode.as_str(),
            wf_run_id,
            &format!(
                "walk-forward done folds={} avg={:+.2}% excess={:+.2}%",
                summary.fold_count, summary.avg_return_pct, summary.avg_excess_return_pct
            ),
            now,
        )
    })
    .await;

    info!("walk-forward run_id={}", summary.run_id);
    info!("walk-forward output={}", summary.output_dir);
    info!(
        "walk-forward folds={} avg_return={:+.2}% median={:+.2}% positive_rate={:.2}% \
         avg_excess={:+.2}% history={} replay={} fallback={}",
        summary.fold_count,
        summary.avg_return_pct,
        summary.median_return_pct,
        summary.positive_fold_rate_pct,
        summary.avg_excess_return_pct,
        summary.history_fold_count,
        summary.replay_fold_count,
        summary.fallback_fold_count,
    );
    Ok(())
}

async fn write_state<F>(env: &RunnerEnv, build: F)
where
    F: FnOnce(&signal_bench::state::RunState, &str) -> signal_bench::state::RunState,
{
    let prev = env.state_sink.read().await;
    let now_txt = format_utc(env.clock.now());
    let state = build(&prev, &now_txt);
    if let Err(err) = env.state_sink.write(&state).await {
        warn!("run-state update failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_state() {
        assert_eq!(tri_state(true, false), Some(true));
        assert_eq!(tri_state(false, true), Some(false));
        assert_eq!(tri_state(false, false), None);
    }

    #[test]
    fn test_load_rules_default_catalog() {
        let rules = load_rules(None).unwrap();
        assert!(!rules.is_empty());
    }

    #[test]
    fn test_load_rules_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"[{
                "name": "RSI_dip",
                "table": "momentum_indicators",
                "direction": "BUY",
                "strength": 70,
                "condition": {"kind": "threshold_cross_up", "field": "rsi", "threshold": 30.0}
            }]"#,
        )
        .unwrap();
        let rules = load_rules(Some(&path)).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "RSI_dip");
        assert_eq!(rules[0].cooldown_s, 3600); // defaulted
    }
}
