//! Single-backtest orchestration.
//!
//! The runner wires one pipeline pass: load signals and bars for the mode,
//! aggregate scores, execute, derive metrics, persist artifacts, update the
//! `latest` pointer, and prune old runs. Run-state transitions are written
//! at every stage so an external dashboard can follow along; those writes
//! are best-effort and never mask the error that actually failed the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregator::aggregate_signal_scores;
use crate::artifacts::{self, names};
use crate::config::{BacktestConfig, normalize_symbols};
use crate::cooldown::CooldownLedger;
use crate::error::{BacktestError, Result};
use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::metrics::{MetricsInputs, build_metrics};
use crate::models::{Bar, Metrics, SignalEvent};
use crate::retention::{cleanup_old_runs, update_latest};
use crate::rules::SignalRule;
use crate::sources::history::load_history_signals;
use crate::sources::rule_replay::{RuleReplayStats, replay_signals_from_rules};
use crate::sources::synthetic::{DEFAULT_MIN_SIGNAL_GAP_BARS, replay_signals_from_bars};
use crate::state::{RunState, done_state, error_state, running_state};
use crate::store::{
    ArtifactFile, ArtifactSink, CandleStore, Clock, IndicatorStore, RunContext, RunStateSink,
    SignalStore,
};
use crate::time::{format_utc, resolve_range};

/// Backtest run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Replay persisted history signals
    HistorySignal,
    /// Synthesize signals from bars
    OfflineReplay,
    /// Replay the rule set over indicator tables
    OfflineRuleReplay,
    /// Run history and rule replay side by side (comparator only)
    CompareHistoryRule,
}

impl RunMode {
    /// Parse a mode label, resolving legacy aliases.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "history_signal" => Ok(Self::HistorySignal),
            "offline_replay" => Ok(Self::OfflineReplay),
            "offline_rule_replay" | "rule_replay" => Ok(Self::OfflineRuleReplay),
            "compare_history_rule" => Ok(Self::CompareHistoryRule),
            other => Err(BacktestError::invalid_param(
                "mode",
                format!("unsupported mode: {other}"),
            )),
        }
    }

    /// Canonical label used in artifacts and state files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HistorySignal => "history_signal",
            Self::OfflineReplay => "offline_replay",
            Self::OfflineRuleReplay => "offline_rule_replay",
            Self::CompareHistoryRule => "compare_history_rule",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators one runner invocation needs.
///
/// Everything is behind a trait so embedding services and tests supply their
/// own storage; `artifact_root` is only set when the sink is
/// filesystem-backed and enables the `latest` pointer plus retention.
pub struct RunnerEnv {
    /// Bar storage
    pub candle_store: Arc<dyn CandleStore>,
    /// Signal-history storage
    pub signal_store: Arc<dyn SignalStore>,
    /// Indicator-table storage for rule replay
    pub indicator_store: Arc<dyn IndicatorStore>,
    /// Artifact destination
    pub artifact_sink: Arc<dyn ArtifactSink>,
    /// Run-state destination
    pub state_sink: Arc<dyn RunStateSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Rule set for rule replay
    pub rules: Vec<SignalRule>,
    /// Shared cooldown ledger
    pub cooldown: Arc<CooldownLedger>,
    /// Deadline/cancellation scope for this invocation
    pub ctx: RunContext,
    /// Filesystem root for `latest` + retention (None disables both)
    pub artifact_root: Option<PathBuf>,
}

/// Output of a completed run.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct RunnerResult {
    /// Run identifier
    pub run_id: String,
    /// Artifact directory, relative to the sink root
    pub run_dir: String,
    /// Derived metrics
    pub metrics: Metrics,
    /// Rule-replay diagnostics (rule-replay mode only)
    pub rule_replay_stats: Option<RuleReplayStats>,
}

fn initial_stage(mode: RunMode) -> &'static str {
    match mode {
        RunMode::HistorySignal => "loading_signals",
        RunMode::OfflineRuleReplay => "loading_indicator_tables",
        _ => "loading_candles",
    }
}

fn initial_message(mode: RunMode) -> &'static str {
    match mode {
        RunMode::HistorySignal => "loading signals from history",
        RunMode::OfflineRuleReplay => "loading indicator tables for rule replay",
        _ => "loading candles for offline replay",
    }
}

async fn safe_state_write(env: &RunnerEnv, state: RunState) {
    if let Err(err) = env.state_sink.write(&state).await {
        warn!("run-state update failed ({}): {err}", state.stage);
    }
}

async fn mark_running(env: &RunnerEnv, run_id: &str, mode: RunMode, stage: &str, message: &str) {
    let prev = env.state_sink.read().await;
    let now_txt = format_utc(env.clock.now());
    safe_state_write(
        env,
        running_state(&prev, run_id, mode.as_str(), stage, message, &now_txt),
    )
    .await;
}

struct LoadedInputs {
    signals: Vec<SignalEvent>,
    bars_by_symbol: HashMap<String, Vec<Bar>>,
    bar_count: usize,
    replay_stats: Option<RuleReplayStats>,
}

async fn load_inputs(
    env: &RunnerEnv,
    config: &BacktestConfig,
    mode: RunMode,
    run_id: &str,
    stage: &mut String,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    symbols: &[String],
) -> Result<LoadedInputs> {
    match mode {
        RunMode::HistorySignal => {
            let signals = load_history_signals(
                &env.ctx,
                env.signal_store.as_ref(),
                symbols,
                start,
                end,
                &config.timeframe,
            )
            .await?;

            *stage = "loading_candles".to_string();
            mark_running(
                env,
                run_id,
                mode,
                stage,
                &format!("loading candles symbols={}", symbols.len()),
            )
            .await;
            let bars_by_symbol = env
                .candle_store
                .load_bars(&env.ctx, symbols, start, end, &config.timeframe)
                .await?;
            let bar_count = bars_by_symbol.values().map(Vec::len).sum();
            Ok(LoadedInputs {
                signals,
                bars_by_symbol,
                bar_count,
                replay_stats: None,
            })
        }
        RunMode::OfflineRuleReplay => {
            let (signals, stats) = replay_signals_from_rules(
                &env.ctx,
                env.indicator_store.as_ref(),
                &env.rules,
                &env.cooldown,
                symbols,
                start,
                end,
                &config.timeframe,
                1,
            )
            .await?;

            *stage = "loading_candles".to_string();
            mark_running(
                env,
                run_id,
                mode,
                stage,
                &format!(
                    "rule replay done tables={} rows={} signals={}; loading candles",
                    stats.table_count, stats.row_count, stats.signal_count
                ),
            )
            .await;
            let bars_by_symbol = env
                .candle_store
                .load_bars(&env.ctx, symbols, start, end, &config.timeframe)
                .await?;
            let bar_count = bars_by_symbol.values().map(Vec::len).sum();
            Ok(LoadedInputs {
                signals,
                bars_by_symbol,
                bar_count,
                replay_stats: Some(stats),
            })
        }
        RunMode::OfflineReplay => {
            let bars_by_symbol = env
                .candle_store
                .load_bars(&env.ctx, symbols, start, end, &config.timeframe)
                .await?;
            let bar_count = bars_by_symbol.values().map(Vec::len).sum();

            *stage = "replaying_signals".to_string();
            mark_running(
                env,
                run_id,
                mode,
                stage,
                &format!("replaying signals from bars={bar_count}"),
            )
            .await;
            let signals = replay_signals_from_bars(
                &bars_by_symbol,
                &config.timeframe,
                1,
                DEFAULT_MIN_SIGNAL_GAP_BARS,
            );
            Ok(LoadedInputs {
                signals,
                bars_by_symbol,
                bar_count,
                replay_stats: None,
            })
        }
        RunMode::CompareHistoryRule => Err(BacktestError::invalid_param(
            "mode",
            "compare_history_rule is driven by the comparator, not the runner",
        )),
    }
}

async fn run_stages(
    env: &RunnerEnv,
    config: &BacktestConfig,
    mode: RunMode,
    run_id: &str,
    run_dir: &str,
    stage: &mut String,
) -> Result<RunnerResult> {
    config.validate()?;
    let (start, end) = resolve_range(&config.date_range, 90, env.clock.now())?;
    let symbols = normalize_symbols(&config.symbols);
    if symbols.is_empty() {
        return Err(BacktestError::invalid_param(
            "symbols",
            "no symbols configured for backtest",
        ));
    }

    env.ctx.check(stage)?;
    let inputs = load_inputs(env, config, mode, run_id, stage, start, end, &symbols).await?;
    if inputs.bar_count == 0 {
        return Err(BacktestError::store_fatal(
            "load_bars",
            "no candle rows in selected window",
        ));
    }
    for bars in inputs.bars_by_symbol.values() {
        for bar in bars {
            bar.validate()?;
        }
    }

    let score_map = aggregate_signal_scores(&inputs.signals, &config.timeframe);

    *stage = "executing".to_string();
    env.ctx.check(stage)?;
    mark_running(
        env,
        run_id,
        mode,
        stage,
        &format!(
            "executing with bars={} signals={}",
            inputs.bar_count,
            inputs.signals.len()
        ),
    )
    .await;

    let engine = ExecutionEngine::new(&config.execution, &config.risk, &config.aggregation);
    let ExecutionResult {
        trades,
        equity_curve,
        final_equity,
    } = engine.run(&inputs.bars_by_symbol, &score_map);

    *stage = "writing".to_string();
    env.ctx.check(stage)?;
    mark_running(
        env,
        run_id,
        mode,
        stage,
        &format!("writing artifacts trades={}", trades.len()),
    )
    .await;

    let metrics = build_metrics(
        &MetricsInputs {
            run_id,
            mode: mode.as_str(),
            start,
            end,
            symbols: &symbols,
            timeframe: &config.timeframe,
            initial_equity: config.risk.initial_equity,
            final_equity,
            bars_by_symbol: &inputs.bars_by_symbol,
            signals: &inputs.signals,
            bar_count: inputs.bar_count,
            strategy_label: &config.strategy_label,
            strategy_config_path: &config.strategy_config_path,
            strategy_summary: &config.strategy_summary(),
        },
        &trades,
        &equity_curve,
    );

    let generated_at = format_utc(env.clock.now());
    let mut files = artifacts::standard_bundle(&metrics, &trades, &equity_curve, &generated_at)?;
    if let Some(stats) = &inputs.replay_stats {
        files.push(ArtifactFile {
            name: names::RULE_REPLAY_DIAGNOSTICS_JSON.to_string(),
            contents: artifacts::render_rule_replay_diagnostics(stats)?,
        });
    }
    env.artifact_sink
        .write_run_artifacts(&env.ctx, run_dir, &files)
        .await?;

    *stage = "retention".to_string();
    env.ctx.check(stage)?;
    mark_running(env, run_id, mode, stage, "updating latest pointer and retention").await;
    if let Some(root) = &env.artifact_root {
        let run_path = root.join(run_dir);
        update_latest(root, &run_path)?;
        let removed = cleanup_old_runs(root, config.retention.keep_runs)?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "retention removed old runs");
        }
    }

    Ok(RunnerResult {
        run_id: run_id.to_string(),
        run_dir: run_dir.to_string(),
        metrics,
        rule_replay_stats: inputs.replay_stats,
    })
}

/// Run one backtest and write its artifacts.
///
/// `run_id` defaults to a UTC stamp from the environment clock; `output_dir`
/// defaults to the run id (relative to the sink root). On failure the error
/// state records the stage that was executing, then the error propagates
/// unchanged.
pub async fn run_backtest(
    env: &RunnerEnv,
    config: &BacktestConfig,
    mode: RunMode,
    run_id: Option<&str>,
    output_dir: Option<&str>,
) -> Result<RunnerResult> {
    let rid = match run_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => env.clock.now().format("%Y%m%d-%H%M%S").to_string(),
    };
    let run_dir = output_dir
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| rid.clone());

    let mut stage = initial_stage(mode).to_string();
    mark_running(env, &rid, mode, &stage, initial_message(mode)).await;

    match run_stages(env, config, mode, &rid, &run_dir, &mut stage).await {
        Ok(result) => {
            let prev = env.state_sink.read().await;
            let now_txt = format_utc(env.clock.now());
            safe_state_write(
                env,
                done_state(
                    &prev,
                    &rid,
                    mode.as_str(),
                    &rid,
                    &format!(
                        "completed trades={} return={:+.2}%",
                        result.metrics.trade_count, result.metrics.total_return_pct
                    ),
                    &now_txt,
                ),
            )
            .await;
            info!(
                run_id = %rid,
                trades = result.metrics.trade_count,
                final_equity = result.metrics.final_equity,
                "backtest completed"
            );
            Ok(result)
        }
        Err(err) => {
            let prev = env.state_sink.read().await;
            let now_txt = format_utc(env.clock.now());
            safe_state_write(
                env,
                error_state(
                    &prev,
                    &rid,
                    mode.as_str(),
                    &stage,
                    &err.to_string(),
                    "backtest failed",
                    &now_txt,
                ),
            )
            .await;
            Err(err)
        }
    }
}
