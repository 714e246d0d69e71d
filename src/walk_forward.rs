//! Walk-forward fold driver: rolling train/test windows over one config.
//!
//! Each fold reserves a train region (future parameter tuning) and executes
//! its test region as a normal backtest. For `history_signal` runs with
//! auto-fallback enabled, folds whose history coverage is too thin switch to
//! synthetic replay with softened thresholds instead of producing an
//! all-flat result. Fold failures are fatal; there is no partial summary.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::{AggregationConfig, BacktestConfig, DateRange};
use crate::error::Result;
use crate::precheck::compute_coverage_report;
use crate::retention::{cleanup_old_runs, update_latest};
use crate::runner::{RunMode, RunnerEnv, run_backtest};
use crate::store::{ArtifactFile, Clock};
use crate::time::{format_utc, resolve_range};

// ── Windows ──────────────────────────────────────────────────────────────────

/// One rolling train/test window pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkForwardWindow {
    /// 1-based fold number
    pub fold: u32,
    /// Train region start (reserved; not executed)
    pub train_start: DateTime<Utc>,
    /// Train region end
    pub train_end: DateTime<Utc>,
    /// Test region start
    pub test_start: DateTime<Utc>,
    /// Test region end (clamped to the overall window)
    pub test_end: DateTime<Utc>,
}

/// Build rolling train/test windows by sliding `step_days`.
///
/// A window is skipped when its test interval would be empty; `max_folds`
/// of 0 means no cap.
pub fn build_walk_forward_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    train_days: u32,
    test_days: u32,
    step_days: u32,
    max_folds: u32,
) -> Vec<WalkForwardWindow> {
    let train_span = Duration::days(train_days.max(1) as i64);
    let test_span = Duration::days(test_days.max(1) as i64);
    let step_span = Duration::days(step_days.max(1) as i64);

    let mut windows = Vec::new();
    let mut cursor = start;
    let mut fold = 1u32;

    loop {
        let train_start = cursor;
        let train_end = train_start + train_span;
        let test_start = train_end;
        let mut test_end = test_start + test_span;

        if test_start >= end {
            break;
        }
        if test_end > end {
            test_end = end;
        }
        if test_end <= test_start {
            break;
        }

        windows.push(WalkForwardWindow {
            fold,
            train_start,
            train_end,
            test_start,
            test_end,
        });

        if max_folds > 0 && windows.len() as u32 >= max_folds {
            break;
        }
        cursor += step_span;
        fold += 1;
    }

    windows
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Per-fold result row.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardFoldResult {
    /// 1-based fold number
    pub fold: u32,
    /// Fold run id (`{base}-wfNN`)
    pub run_id: String,
    /// Mode the fold actually ran in
    pub mode: String,
    /// Train region start, canonical UTC text
    pub train_start: String,
    /// Train region end
    pub train_end: String,
    /// Test region start
    pub test_start: String,
    /// Test region end
    pub test_end: String,
    /// Fold return percentage
    pub total_return_pct: f64,
    /// Fold max drawdown percentage
    pub max_drawdown_pct: f64,
    /// Fold Sharpe
    pub sharpe: f64,
    /// Fold trade count
    pub trade_count: usize,
    /// Fold win rate percentage
    pub win_rate_pct: f64,
    /// Fold excess return vs buy-and-hold
    pub excess_return_pct: f64,
    /// Signal rows seen by the fallback precheck (0 when skipped)
    pub signal_count: usize,
    /// Signal days seen by the fallback precheck (0 when skipped)
    pub signal_days: usize,
    /// Why the fold fell back, empty when it did not
    pub fallback_reason: String,
}

/// Aggregate summary across folds.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    /// Walk-forward run id
    pub run_id: String,
    /// Requested mode
    pub mode: String,
    /// Number of executed folds
    pub fold_count: usize,
    /// Mean fold return
    pub avg_return_pct: f64,
    /// Median fold return
    pub median_return_pct: f64,
    /// Worst fold return
    pub min_return_pct: f64,
    /// Best fold return
    pub max_return_pct: f64,
    /// Fraction of folds with positive return, as a percentage
    pub positive_fold_rate_pct: f64,
    /// Mean fold drawdown
    pub avg_max_drawdown_pct: f64,
    /// Mean fold excess return
    pub avg_excess_return_pct: f64,
    /// Folds that ran as history_signal
    pub history_fold_count: usize,
    /// Folds that ran as offline_replay
    pub replay_fold_count: usize,
    /// Folds with a non-empty fallback reason
    pub fallback_fold_count: usize,
    /// Session directory (relative to the artifact root)
    pub output_dir: String,
}

/// Driver options beyond the config's window spans.
#[derive(Debug, Clone, Copy)]
pub struct WalkForwardOptions {
    /// Cap on executed folds (0 = no cap)
    pub max_folds: u32,
    /// Fall back to synthetic replay when history coverage is thin
    pub auto_fallback: bool,
    /// Minimum distinct signal days for a history fold
    pub min_signal_days: usize,
    /// Minimum signal rows for a history fold
    pub min_signal_count: usize,
}

impl Default for WalkForwardOptions {
    fn default() -> Self {
        Self {
            max_folds: 0,
            auto_fallback: true,
            min_signal_days: 0,
            min_signal_count: 0,
        }
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn clone_config_for_window(
    config: &BacktestConfig,
    test_start: DateTime<Utc>,
    test_end: DateTime<Utc>,
) -> BacktestConfig {
    BacktestConfig {
        date_range: DateRange {
            start: format_utc(test_start),
            end: format_utc(test_end),
        },
        ..config.clone()
    }
}

/// Soften thresholds for a replay-fallback fold.
///
/// Open thresholds drop to 70% of the configured value with a floor of 70
/// (synthetic strengths cap at 95, so history-tuned thresholds would leave
/// the fold flat); the close threshold widens to at least 15.
pub fn adapt_config_for_offline_replay(config: &BacktestConfig) -> BacktestConfig {
    let ag = &config.aggregation;
    BacktestConfig {
        aggregation: AggregationConfig {
            long_open_threshold: ((ag.long_open_threshold as f64 * 0.7) as i32).max(70),
            short_open_threshold: ((ag.short_open_threshold as f64 * 0.7) as i32).max(70),
            close_threshold: ag.close_threshold.max(15),
        },
        ..config.clone()
    }
}

struct FoldModeSelection {
    mode: RunMode,
    signal_count: usize,
    signal_days: usize,
    fallback_reason: String,
}

async fn select_fold_mode(
    env: &RunnerEnv,
    fold_cfg: &BacktestConfig,
    requested: RunMode,
    options: &WalkForwardOptions,
) -> Result<FoldModeSelection> {
    let guards_disabled = options.min_signal_days == 0 && options.min_signal_count == 0;
    if requested != RunMode::HistorySignal || !options.auto_fallback || guards_disabled {
        return Ok(FoldModeSelection {
            mode: requested,
            signal_count: 0,
            signal_days: 0,
            fallback_reason: String::new(),
        });
    }

    let (start, end) = resolve_range(&fold_cfg.date_range, 90, env.clock.now())?;
    let coverage = compute_coverage_report(
        &env.ctx,
        fold_cfg,
        env.signal_store.as_ref(),
        env.candle_store.as_ref(),
        start,
        end,
    )
    .await?;

    let fail_days =
        options.min_signal_days > 0 && coverage.signal_days < options.min_signal_days;
    let fail_count =
        options.min_signal_count > 0 && coverage.signal_count < options.min_signal_count;
    if fail_days || fail_count {
        let mut parts = Vec::new();
        if fail_days {
            parts.push(format!(
                "signal_days {}<{}",
                coverage.signal_days, options.min_signal_days
            ));
        }
        if fail_count {
            parts.push(format!(
                "signal_count {}<{}",
                coverage.signal_count, options.min_signal_count
            ));
        }
        return Ok(FoldModeSelection {
            mode: RunMode::OfflineReplay,
            signal_count: coverage.signal_count,
            signal_days: coverage.signal_days,
            fallback_reason: parts.join("; "),
        });
    }

    Ok(FoldModeSelection {
        mode: RunMode::HistorySignal,
        signal_count: coverage.signal_count,
        signal_days: coverage.signal_days,
        fallback_reason: String::new(),
    })
}

fn summary_from_folds(
    run_id: &str,
    mode: RunMode,
    output_dir: &str,
    rows: &[WalkForwardFoldResult],
) -> WalkForwardSummary {
    if rows.is_empty() {
        return WalkForwardSummary {
            run_id: run_id.to_string(),
            mode: mode.as_str().to_string(),
            fold_count: 0,
            avg_return_pct: 0.0,
            median_return_pct: 0.0,
            min_return_pct: 0.0,
            max_return_pct: 0.0,
            positive_fold_rate_pct: 0.0,
            avg_max_drawdown_pct: 0.0,
            avg_excess_return_pct: 0.0,
            history_fold_count: 0,
            replay_fold_count: 0,
            fallback_fold_count: 0,
            output_dir: output_dir.to_string(),
        };
    }

    let returns: Vec<f64> = rows.iter().map(|r| r.total_return_pct).collect();
    let n = rows.len() as f64;
    let positive = returns.iter().filter(|v| **v > 0.0).count();

    WalkForwardSummary {
        run_id: run_id.to_string(),
        mode: mode.as_str().to_string(),
        fold_count: rows.len(),
        avg_return_pct: returns.iter().sum::<f64>() / n,
        median_return_pct: median(&returns),
        min_return_pct: returns.iter().cloned().fold(f64::INFINITY, f64::min),
        max_return_pct: returns.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        positive_fold_rate_pct: positive as f64 / n * 100.0,
        avg_max_drawdown_pct: rows.iter().map(|r| r.max_drawdown_pct).sum::<f64>() / n,
        avg_excess_return_pct: rows.iter().map(|r| r.excess_return_pct).sum::<f64>() / n,
        history_fold_count: rows.iter().filter(|r| r.mode == "history_signal").count(),
        replay_fold_count: rows.iter().filter(|r| r.mode == "offline_replay").count(),
        fallback_fold_count: rows.iter().filter(|r| !r.fallback_reason.is_empty()).count(),
        output_dir: output_dir.to_string(),
    }
}

fn render_fold_csv(rows: &[WalkForwardFoldResult]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "fold",
        "run_id",
        "mode",
        "train_start",
        "train_end",
        "test_start",
        "test_end",
        "total_return_pct",
        "max_drawdown_pct",
        "sharpe",
        "trade_count",
        "win_rate_pct",
        "excess_return_pct",
        "signal_count",
        "signal_days",
        "fallback_reason",
    ])?;
    for row in rows {
        writer.write_record([
            row.fold.to_string(),
            row.run_id.clone(),
            row.mode.clone(),
            row.train_start.clone(),
            row.train_end.clone(),
            row.test_start.clone(),
            row.test_end.clone(),
            format!("{:.8}", row.total_return_pct),
            format!("{:.8}", row.max_drawdown_pct),
            format!("{:.8}", row.sharpe),
            row.trade_count.to_string(),
            format!("{:.8}", row.win_rate_pct),
            format!("{:.8}", row.excess_return_pct),
            row.signal_count.to_string(),
            row.signal_days.to_string(),
            row.fallback_reason.clone(),
        ])?;
    }
    let bytes = writer.into_inner().map_err(|err| {
        crate::error::BacktestError::store_fatal("render_fold_csv", err.to_string())
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn render_summary_json(
    summary: &WalkForwardSummary,
    rows: &[WalkForwardFoldResult],
) -> Result<String> {
    let mut payload = serde_json::to_value(summary)?;
    if let Some(map) = payload.as_object_mut() {
        map.remove("output_dir");
        map.insert("folds".to_string(), serde_json::to_value(rows)?);
    }
    Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?))
}

/// Synthetic `metrics.json` so downstream viewers treat the session like a
/// regular run: aggregate fields plus the embedded fold summary.
fn render_summary_metrics_json(
    config: &BacktestConfig,
    summary: &WalkForwardSummary,
    rows: &[WalkForwardFoldResult],
) -> Result<String> {
    let (start_txt, end_txt) = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) => (first.test_start.clone(), last.test_end.clone()),
        _ => (String::new(), String::new()),
    };
    let n = rows.len().max(1) as f64;
    let avg_sharpe = rows.iter().map(|r| r.sharpe).sum::<f64>() / n;
    let avg_win_rate = rows.iter().map(|r| r.win_rate_pct).sum::<f64>() / n;
    let avg_buy_hold = rows
        .iter()
        .map(|r| r.total_return_pct - r.excess_return_pct)
        .sum::<f64>()
        / n;
    let trade_count: usize = rows.iter().map(|r| r.trade_count).sum();
    let signal_count: usize = rows.iter().map(|r| r.signal_count).sum();
    let initial = config.risk.initial_equity;
    let final_equity = initial * (1.0 + summary.avg_return_pct / 100.0);
    let buy_hold_final = initial * (1.0 + avg_buy_hold / 100.0);

    let payload = json!({
        "run_id": &summary.run_id,
        "mode": "walk_forward",
        "start": start_txt,
        "end": end_txt,
        "symbols": &config.symbols,
        "timeframe": &config.timeframe,
        "initial_equity": initial,
        "final_equity": final_equity,
        "total_return_pct": summary.avg_return_pct,
        "max_drawdown_pct": summary.avg_max_drawdown_pct,
        "sharpe": avg_sharpe,
        "trade_count": trade_count,
        "win_rate_pct": avg_win_rate,
        "profit_factor": 0.0,
        "avg_holding_minutes": 0.0,
        "signal_count": signal_count,
        "bar_count": 0,
        "strategy_label": &config.strategy_label,
        "strategy_config_path": &config.strategy_config_path,
        "strategy_summary": config.strategy_summary(),
        "buy_hold_final_equity": buy_hold_final,
        "buy_hold_return_pct": avg_buy_hold,
        "excess_return_pct": summary.avg_excess_return_pct,
        "symbol_contributions": [],
        "walk_forward_summary": {
            "fold_count": summary.fold_count,
            "history_fold_count": summary.history_fold_count,
            "replay_fold_count": summary.replay_fold_count,
            "fallback_fold_count": summary.fallback_fold_count,
            "avg_return_pct": summary.avg_return_pct,
            "avg_max_drawdown_pct": summary.avg_max_drawdown_pct,
            "avg_excess_return_pct": summary.avg_excess_return_pct,
            "positive_fold_rate_pct": summary.positive_fold_rate_pct,
            "folds": rows.iter().map(|row| json!({
                "fold": row.fold,
                "run_id": &row.run_id,
                "mode": &row.mode,
                "test_start": &row.test_start,
                "test_end": &row.test_end,
                "total_return_pct": row.total_return_pct,
                "max_drawdown_pct": row.max_drawdown_pct,
                "trade_count": row.trade_count,
            })).collect::<Vec<_>>(),
        },
    });
    Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?))
}

/// Combined equity curve composing fold returns multiplicatively from the
/// configured initial equity.
fn render_summary_equity_curve(
    config: &BacktestConfig,
    rows: &[WalkForwardFoldResult],
) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["timestamp", "equity"])?;
    if let Some(first) = rows.first() {
        let mut equity = config.risk.initial_equity.max(0.0);
        writer.write_record([first.test_start.clone(), format!("{equity:.8}")])?;
        for row in rows {
            equity *= 1.0 + row.total_return_pct / 100.0;
            writer.write_record([row.test_end.clone(), format!("{equity:.8}")])?;
        }
    }
    let bytes = writer.into_inner().map_err(|err| {
        crate::error::BacktestError::store_fatal("render_summary_curve", err.to_string())
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Run walk-forward folds and write session artifacts.
///
/// Fold run directories live under `session_dir`; the session itself gets
/// `walk_forward_folds.csv`, `walk_forward_summary.json`, plus synthetic
/// `metrics.json` and `equity_curve.csv`. Any fold failure aborts the whole
/// walk-forward.
pub async fn run_walk_forward(
    env: &RunnerEnv,
    config: &BacktestConfig,
    mode: RunMode,
    run_id: &str,
    session_dir: &str,
    options: &WalkForwardOptions,
) -> Result<WalkForwardSummary> {
    let (start, end) = resolve_range(&config.date_range, 90, env.clock.now())?;
    let wf = &config.walk_forward;
    let windows = build_walk_forward_windows(
        start,
        end,
        wf.train_days,
        wf.test_days,
        wf.step_days,
        options.max_folds,
    );

    let mut rows: Vec<WalkForwardFoldResult> = Vec::new();
    for window in &windows {
        env.ctx.check("walk_forward")?;

        let fold_cfg = clone_config_for_window(config, window.test_start, window.test_end);
        let selection = select_fold_mode(env, &fold_cfg, mode, options).await?;

        let fold_run_id = format!("{run_id}-wf{:02}", window.fold);
        let mut run_cfg = fold_cfg;
        let mut fallback_reason = selection.fallback_reason;
        if selection.mode == RunMode::OfflineReplay && !fallback_reason.is_empty() {
            run_cfg = adapt_config_for_offline_replay(&run_cfg);
            fallback_reason = format!("{fallback_reason}; replay_threshold=70%");
        }

        let result = run_backtest(
            env,
            &run_cfg,
            selection.mode,
            Some(&fold_run_id),
            Some(&format!("{session_dir}/{fold_run_id}")),
        )
        .await?;

        rows.push(WalkForwardFoldResult {
            fold: window.fold,
            run_id: result.run_id.clone(),
            mode: result.metrics.mode.clone(),
            train_start: format_utc(window.train_start),
            train_end: format_utc(window.train_end),
            test_start: format_utc(window.test_start),
            test_end: format_utc(window.test_end),
            total_return_pct: result.metrics.total_return_pct,
            max_drawdown_pct: result.metrics.max_drawdown_pct,
            sharpe: result.metrics.sharpe,
            trade_count: result.metrics.trade_count,
            win_rate_pct: result.metrics.win_rate_pct,
            excess_return_pct: result.metrics.excess_return_pct,
            signal_count: selection.signal_count,
            signal_days: selection.signal_days,
            fallback_reason,
        });
    }

    let summary = summary_from_folds(run_id, mode, session_dir, &rows);
    let files = vec![
        ArtifactFile {
            name: "walk_forward_folds.csv".to_string(),
            contents: render_fold_csv(&rows)?,
        },
        ArtifactFile {
            name: "walk_forward_summary.json".to_string(),
            contents: render_summary_json(&summary, &rows)?,
        },
        ArtifactFile {
            name: "metrics.json".to_string(),
            contents: render_summary_metrics_json(config, &summary, &rows)?,
        },
        ArtifactFile {
            name: "equity_curve.csv".to_string(),
            contents: render_summary_equity_curve(config, &rows)?,
        },
    ];
    env.artifact_sink
        .write_run_artifacts(&env.ctx, session_dir, &files)
        .await?;

    if let Some(root) = &env.artifact_root {
        update_latest(root, &root.join(session_dir))?;
        cleanup_old_runs(root, config.retention.keep_runs)?;
    }

    info!(
        folds = summary.fold_count,
        avg_return = summary.avg_return_pct,
        fallbacks = summary.fallback_fold_count,
        "walk-forward completed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    #[test]
    fn test_window_builder_spans() {
        // 90-day window with 45/15/15: folds at test [45,60), [60,75), [75,90)
        let windows = build_walk_forward_windows(day(0), day(90), 45, 15, 15, 0);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].fold, 1);
        assert_eq!(windows[0].train_start, day(0));
        assert_eq!(windows[0].train_end, day(45));
        assert_eq!(windows[0].test_start, day(45));
        assert_eq!(windows[0].test_end, day(60));
        assert_eq!(windows[2].test_start, day(75));
        assert_eq!(windows[2].test_end, day(90));
    }

    #[test]
    fn test_window_builder_clamps_last_fold() {
        // 70-day window: second fold's test region is clamped at the end
        let windows = build_walk_forward_windows(day(0), day(70), 45, 15, 15, 0);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].test_start, day(60));
        assert_eq!(windows[1].test_end, day(70));
    }

    #[test]
    fn test_window_builder_skips_empty_test() {
        // Train region swallows the whole window: nothing to test
        let windows = build_walk_forward_windows(day(0), day(40), 45, 15, 15, 0);
        assert!(windows.is_empty());
    }

    #[test]
    fn test_window_builder_max_folds_cap() {
        let windows = build_walk_forward_windows(day(0), day(365), 45, 15, 15, 2);
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_adapt_config_thresholds() {
        let mut config = BacktestConfig::default();
        config.aggregation.long_open_threshold = 120;
        config.aggregation.short_open_threshold = 90;
        config.aggregation.close_threshold = 10;

        let adapted = adapt_config_for_offline_replay(&config);
        // 120*0.7=84, 90*0.7=63 → floor 70, close widened to 15
        assert_eq!(adapted.aggregation.long_open_threshold, 84);
        assert_eq!(adapted.aggregation.short_open_threshold, 70);
        assert_eq!(adapted.aggregation.close_threshold, 15);

        // Already-wide close threshold is kept
        config.aggregation.close_threshold = 25;
        let adapted = adapt_config_for_offline_replay(&config);
        assert_eq!(adapted.aggregation.close_threshold, 25);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[3.0]), 3.0);
        assert_eq!(median(&[1.0, 3.0]), 2.0);
        assert_eq!(median(&[5.0, 1.0, 3.0]), 3.0);
    }

    #[test]
    fn test_summary_from_folds() {
        let row = |fold: u32, mode: &str, ret: f64, fallback: &str| WalkForwardFoldResult {
            fold,
            run_id: format!("wf-{fold:02}"),
            mode: mode.to_string(),
            train_start: String::new(),
            train_end: String::new(),
            test_start: String::new(),
            test_end: String::new(),
            total_return_pct: ret,
            max_drawdown_pct: 2.0,
            sharpe: 1.0,
            trade_count: 4,
            win_rate_pct: 50.0,
            excess_return_pct: ret - 0.5,
            signal_count: 10,
            signal_days: 3,
            fallback_reason: fallback.to_string(),
        };
        let rows = vec![
            row(1, "history_signal", 2.0, ""),
            row(2, "offline_replay", -1.0, "signal_count 3<200; replay_threshold=70%"),
            row(3, "history_signal", 5.0, ""),
        ];
        let summary = summary_from_folds("wf", RunMode::HistorySignal, "sess", &rows);

        assert_eq!(summary.fold_count, 3);
        assert!((summary.avg_return_pct - 2.0).abs() < 1e-9);
        assert_eq!(summary.median_return_pct, 2.0);
        assert_eq!(summary.min_return_pct, -1.0);
        assert_eq!(summary.max_return_pct, 5.0);
        assert!((summary.positive_fold_rate_pct - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.history_fold_count, 2);
        assert_eq!(summary.replay_fold_count, 1);
        assert_eq!(summary.fallback_fold_count, 1);
    }

    #[test]
    fn test_fold_csv_and_summary_json_render() {
        let rows = vec![WalkForwardFoldResult {
            fold: 1,
            run_id: "wf-wf01".into(),
            mode: "history_signal".into(),
            train_start: "2026-01-01 00:00:00".into(),
            train_end: "2026-02-15 00:00:00".into(),
            test_start: "2026-02-15 00:00:00".into(),
            test_end: "2026-03-02 00:00:00".into(),
            total_return_pct: 1.5,
            max_drawdown_pct: 0.5,
            sharpe: 1.1,
            trade_count: 7,
            win_rate_pct: 57.14,
            excess_return_pct: 0.4,
            signal_count: 300,
            signal_days: 12,
            fallback_reason: String::new(),
        }];
        let csv_text = render_fold_csv(&rows).unwrap();
        assert!(csv_text.starts_with("fold,run_id,mode,train_start"));
        assert!(csv_text.contains("wf-wf01"));
        assert!(csv_text.contains("1.50000000"));

        let summary = summary_from_folds("wf", RunMode::HistorySignal, "sess", &rows);
        let json_text = render_summary_json(&summary, &rows).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json_text).unwrap();
        assert_eq!(value["fold_count"], 1);
        assert_eq!(value["folds"][0]["run_id"], "wf-wf01");
        assert!(value.get("output_dir").is_none());
    }

    #[test]
    fn test_summary_equity_curve_composes_multiplicatively() {
        let row = |fold: u32, start: &str, end: &str, ret: f64| WalkForwardFoldResult {
            fold,
            run_id: format!("wf-wf{fold:02}"),
            mode: "history_signal".into(),
            train_start: String::new(),
            train_end: String::new(),
            test_start: start.to_string(),
            test_end: end.to_string(),
            total_return_pct: ret,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            trade_count: 0,
            win_rate_pct: 0.0,
            excess_return_pct: 0.0,
            signal_count: 0,
            signal_days: 0,
            fallback_reason: String::new(),
        };
        let rows = vec![
            row(1, "2026-02-15 00:00:00", "2026-03-02 00:00:00", 10.0),
            row(2, "2026-03-02 00:00:00", "2026-03-17 00:00:00", -50.0),
        ];
        let config = BacktestConfig::default();
        let text = render_summary_equity_curve(&config, &rows).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with("10000.00000000"));
        assert!(lines[2].ends_with("11000.00000000"));
        assert!(lines[3].ends_with("5500.00000000"));
    }

    #[test]
    fn test_summary_metrics_json_shape() {
        let rows = vec![WalkForwardFoldResult {
            fold: 1,
            run_id: "wf-wf01".into(),
            mode: "offline_replay".into(),
            train_start: String::new(),
            train_end: String::new(),
            test_start: "2026-02-15 00:00:00".into(),
            test_end: "2026-03-02 00:00:00".into(),
            total_return_pct: 2.0,
            max_drawdown_pct: 1.0,
            sharpe: 0.8,
            trade_count: 3,
            win_rate_pct: 66.67,
            excess_return_pct: 1.0,
            signal_count: 40,
            signal_days: 5,
            fallback_reason: "signal_count 40<200; replay_threshold=70%".into(),
        }];
        let config = BacktestConfig::default();
        let summary = summary_from_folds("wf", RunMode::HistorySignal, "sess", &rows);
        let text = render_summary_metrics_json(&config, &summary, &rows).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["mode"], "walk_forward");
        assert_eq!(value["walk_forward_summary"]["fold_count"], 1);
        assert_eq!(value["walk_forward_summary"]["fallback_fold_count"], 1);
        assert_eq!(value["total_return_pct"], 2.0);
        // final = 10000 * 1.02
        let final_equity = value["final_equity"].as_f64().unwrap();
        assert!((final_equity - 10_200.0).abs() < 1e-6);
    }
}
