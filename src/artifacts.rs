//! Artifact rendering and the filesystem sink.
//!
//! Rendering is pure (structs in, strings out) so every artifact can be
//! unit-tested byte-for-byte; the sink only persists named files. Floats in
//! CSVs print with 8 decimal places and timestamps use the canonical UTC
//! form, which makes re-parsing and re-rendering a fixpoint.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;

use crate::error::Result;
use crate::models::{Direction, EquityPoint, Metrics, SignalEvent, Trade};
use crate::sources::rule_replay::RuleReplayStats;
use crate::store::{ArtifactFile, ArtifactSink, RunContext};
use crate::time::{format_utc, parse_timestamp};

/// Standard artifact file names.
pub mod names {
    /// Closed trade log
    pub const TRADES_CSV: &str = "trades.csv";
    /// Mark-to-market curve
    pub const EQUITY_CURVE_CSV: &str = "equity_curve.csv";
    /// Summary metrics
    pub const METRICS_JSON: &str = "metrics.json";
    /// Human-readable report
    pub const REPORT_MD: &str = "report.md";
    /// Rule-replay diagnostics (rule-replay mode only)
    pub const RULE_REPLAY_DIAGNOSTICS_JSON: &str = "rule_replay_diagnostics.json";
}

/// Render the trade log CSV.
pub fn render_trades_csv(trades: &[Trade]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "symbol",
        "side",
        "entry_ts",
        "exit_ts",
        "entry_price",
        "exit_price",
        "qty",
        "entry_fee",
        "exit_fee",
        "pnl_gross",
        "pnl_net",
        "entry_score",
        "exit_score",
        "reason",
    ])?;
    for trade in trades {
        writer.write_record([
            trade.symbol.clone(),
            trade.side.as_str().to_string(),
            format_utc(trade.entry_ts),
            format_utc(trade.exit_ts),
            format!("{:.8}", trade.entry_price),
            format!("{:.8}", trade.exit_price),
            format!("{:.8}", trade.qty),
            format!("{:.8}", trade.entry_fee),
            format!("{:.8}", trade.exit_fee),
            format!("{:.8}", trade.pnl_gross),
            format!("{:.8}", trade.pnl_net),
            trade.entry_score.to_string(),
            trade.exit_score.to_string(),
            trade.reason.as_str().to_string(),
        ])?;
    }
    finish_csv(writer)
}

/// Render the equity curve CSV (`timestamp,equity`).
pub fn render_equity_curve_csv(curve: &[EquityPoint]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["timestamp", "equity"])?;
    for point in curve {
        writer.write_record([
            format_utc(point.ts),
            format!("{:.8}", point.equity),
        ])?;
    }
    finish_csv(writer)
}

/// Render `metrics.json` with a generation stamp.
pub fn render_metrics_json(metrics: &Metrics, generated_at: &str) -> Result<String> {
    let mut payload = serde_json::to_value(metrics)?;
    if let Some(map) = payload.as_object_mut() {
        map.insert("generated_at".to_string(), json!(generated_at));
    }
    Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?))
}

/// Render the human-readable run report.
pub fn render_report_md(metrics: &Metrics, trades: &[Trade]) -> String {
    let mut recent: Vec<&Trade> = trades.iter().collect();
    recent.sort_by(|a, b| b.exit_ts.cmp(&a.exit_ts));
    recent.truncate(10);

    let mut lines: Vec<String> = vec![
        "# Backtest Report".into(),
        String::new(),
        format!("- run_id: `{}`", metrics.run_id),
        format!("- mode: `{}`", metrics.mode),
        format!("- range: `{}` -> `{}`", metrics.start, metrics.end),
        format!("- symbols: `{}`", metrics.symbols.join(", ")),
        format!("- timeframe: `{}`", metrics.timeframe),
        String::new(),
        "## Metrics".into(),
        String::new(),
        format!("- Initial Equity: `{:.2}`", metrics.initial_equity),
        format!("- Final Equity: `{:.2}`", metrics.final_equity),
        format!("- Total Return: `{:+.2}%`", metrics.total_return_pct),
        format!("- Max Drawdown: `{:.2}%`", metrics.max_drawdown_pct),
        format!("- Sharpe: `{:.2}`", metrics.sharpe),
        format!("- Trade Count: `{}`", metrics.trade_count),
        format!("- Win Rate: `{:.2}%`", metrics.win_rate_pct),
        format!("- Profit Factor: `{:.2}`", metrics.profit_factor),
        format!("- Avg Holding: `{:.2} min`", metrics.avg_holding_minutes),
        format!("- Signal Count: `{}`", metrics.signal_count),
        format!("- Bar Count: `{}`", metrics.bar_count),
        format!("- Buy & Hold Return: `{:+.2}%`", metrics.buy_hold_return_pct),
        format!(
            "- Excess Return vs Buy & Hold: `{:+.2}%`",
            metrics.excess_return_pct
        ),
        String::new(),
        "## Signal Profile".into(),
        String::new(),
        format!(
            "- Direction Mix: `{}`",
            counter_line(&metrics.direction_counts)
        ),
        format!(
            "- Timeframe Mix: `{}`",
            counter_line(&metrics.timeframe_counts)
        ),
        String::new(),
        "## Symbol Contributions".into(),
        String::new(),
        "| symbol | pnl_net | trades | win_rate | avg_hold_min |".into(),
        "|---|---:|---:|---:|---:|".into(),
    ];

    if metrics.symbol_contributions.is_empty() {
        lines.push("| -- | -- | -- | -- | -- |".into());
    } else {
        for row in &metrics.symbol_contributions {
            lines.push(format!(
                "| {} | {:+.4} | {} | {:.2}% | {:.2} |",
                row.symbol, row.pnl_net, row.trade_count, row.win_rate_pct, row.avg_holding_minutes
            ));
        }
    }

    lines.extend([
        String::new(),
        "## Recent Trades".into(),
        String::new(),
        "| exit_ts | symbol | side | pnl_net | reason |".into(),
        "|---|---|---:|---:|---|".into(),
    ]);

    if recent.is_empty() {
        lines.push("| -- | -- | -- | -- | -- |".into());
    } else {
        for trade in &recent {
            lines.push(format!(
                "| {} | {} | {} | {:+.4} | {} |",
                format_utc(trade.exit_ts),
                trade.symbol,
                trade.side,
                trade.pnl_net,
                trade.reason
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

fn counter_line(counter: &indexmap::IndexMap<String, usize>) -> String {
    if counter.is_empty() {
        return "--".to_string();
    }
    counter
        .iter()
        .map(|(key, count)| format!("{key}={count}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the rule-replay diagnostics JSON.
pub fn render_rule_replay_diagnostics(stats: &RuleReplayStats) -> Result<String> {
    let mut counters = serde_json::Map::new();
    for (name, counter) in &stats.rule_counters {
        let trigger_rate_pct = if counter.evaluated > 0 {
            counter.triggered as f64 / counter.evaluated as f64 * 100.0
        } else {
            0.0
        };
        counters.insert(
            name.clone(),
            json!({
                "evaluated": counter.evaluated,
                "timeframe_filtered": counter.timeframe_filtered,
                "volume_filtered": counter.volume_filtered,
                "condition_failed": counter.condition_failed,
                "cooldown_blocked": counter.cooldown_blocked,
                "triggered": counter.triggered,
                "trigger_rate_pct": trigger_rate_pct,
            }),
        );
    }

    let mut profiles = serde_json::Map::new();
    for (name, profile) in &stats.rule_timeframe_profiles {
        profiles.insert(
            name.clone(),
            json!({
                "configured_timeframes": &profile.configured_timeframes,
                "observed_timeframes": &profile.observed_timeframes,
                "overlap_timeframes": &profile.overlap_timeframes,
                "has_overlap": !profile.overlap_timeframes.is_empty(),
            }),
        );
    }

    let payload = json!({
        "table_count": stats.table_count,
        "row_count": stats.row_count,
        "signal_count": stats.signal_count,
        "rule_counters": counters,
        "rule_timeframe_profiles": profiles,
    });
    Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?))
}

/// Render a signal event stream as CSV with canonical timestamps.
pub fn render_signal_events_csv(events: &[SignalEvent]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "event_id",
        "timestamp",
        "symbol",
        "direction",
        "strength",
        "signal_type",
        "timeframe",
        "source",
        "price",
    ])?;
    for event in events {
        writer.write_record([
            event.event_id.to_string(),
            format_utc(event.ts),
            event.symbol.clone(),
            event.direction.as_str().to_string(),
            event.strength.to_string(),
            event.signal_type.clone(),
            event.timeframe.clone(),
            event.source.clone(),
            event.price.map(|p| format!("{p:.8}")).unwrap_or_default(),
        ])?;
    }
    finish_csv(writer)
}

/// Parse a signal event CSV produced by [`render_signal_events_csv`].
///
/// Rows that fail to parse are dropped, mirroring ingestion from history.
pub fn parse_signal_events_csv(text: &str) -> Result<Vec<SignalEvent>> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(ts) = record.get(1).and_then(parse_timestamp) else {
            continue;
        };
        let Some(direction) = record.get(3).and_then(Direction::parse) else {
            continue;
        };
        let (Some(event_id), Some(strength)) = (
            record.get(0).and_then(|v| v.parse::<i64>().ok()),
            record.get(4).and_then(|v| v.parse::<i32>().ok()),
        ) else {
            continue;
        };
        events.push(SignalEvent {
            event_id,
            ts,
            symbol: record.get(2).unwrap_or_default().to_string(),
            direction,
            strength,
            signal_type: record.get(5).unwrap_or_default().to_string(),
            timeframe: record.get(6).unwrap_or_default().to_string(),
            source: record.get(7).unwrap_or_default().to_string(),
            price: record.get(8).and_then(|v| v.parse::<f64>().ok()),
        });
    }
    Ok(events)
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|err| crate::error::BacktestError::store_fatal("render_csv", err.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Assemble the standard artifact bundle for one run.
pub fn standard_bundle(
    metrics: &Metrics,
    trades: &[Trade],
    curve: &[EquityPoint],
    generated_at: &str,
) -> Result<Vec<ArtifactFile>> {
    Ok(vec![
        ArtifactFile {
            name: names::TRADES_CSV.to_string(),
            contents: render_trades_csv(trades)?,
        },
        ArtifactFile {
            name: names::EQUITY_CURVE_CSV.to_string(),
            contents: render_equity_curve_csv(curve)?,
        },
        ArtifactFile {
            name: names::METRICS_JSON.to_string(),
            contents: render_metrics_json(metrics, generated_at)?,
        },
        ArtifactFile {
            name: names::REPORT_MD.to_string(),
            contents: render_report_md(metrics, trades),
        },
    ])
}

/// Filesystem sink rooted at the backtest artifact directory.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    /// Sink writing under `root` (conventionally `artifacts/backtest`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute path of a run directory under this sink.
    pub fn run_path(&self, run_dir: &str) -> PathBuf {
        self.root.join(run_dir)
    }

    /// The sink root.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn write_run_artifacts(
        &self,
        ctx: &RunContext,
        run_dir: &str,
        files: &[ArtifactFile],
    ) -> Result<()> {
        ctx.check("writing")?;
        let dir = self.root.join(run_dir);
        std::fs::create_dir_all(&dir)?;
        for file in files {
            std::fs::write(dir.join(&file.name), &file.contents)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TradeReason};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn sample_trade() -> Trade {
        Trade {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_ts: ts(6),
            exit_ts: ts(61),
            entry_price: 100.03,
            exit_price: 109.967,
            qty: 49.985,
            entry_fee: 2.0,
            exit_fee: 2.198,
            pnl_gross: 496.75,
            pnl_net: 492.55,
            entry_score: 80,
            exit_score: -80,
            reason: TradeReason::ExitOnOpposite,
        }
    }

    fn sample_event(id: i64) -> SignalEvent {
        SignalEvent {
            event_id: id,
            ts: ts(id),
            symbol: "BTCUSDT".into(),
            direction: Direction::Buy,
            strength: 80,
            signal_type: "MACD_golden_cross".into(),
            timeframe: "1m".into(),
            source: "history".into(),
            price: Some(100.5),
        }
    }

    #[test]
    fn test_trades_csv_layout() {
        let text = render_trades_csv(&[sample_trade()]).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "symbol,side,entry_ts,exit_ts,entry_price,exit_price,qty,entry_fee,exit_fee,pnl_gross,pnl_net,entry_score,exit_score,reason"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("BTCUSDT,LONG,2026-01-01 00:06:00,2026-01-01 01:01:00,"));
        assert!(row.ends_with(",80,-80,exit_on_opposite"));
        assert!(row.contains("100.03000000"));
    }

    #[test]
    fn test_equity_curve_csv() {
        let curve = vec![
            EquityPoint {
                ts: ts(0),
                equity: 10_000.0,
            },
            EquityPoint {
                ts: ts(1),
                equity: 10_001.5,
            },
        ];
        let text = render_equity_curve_csv(&curve).unwrap();
        assert_eq!(
            text,
            "timestamp,equity\n2026-01-01 00:00:00,10000.00000000\n2026-01-01 00:01:00,10001.50000000\n"
        );
    }

    #[test]
    fn test_metrics_json_parses_and_has_stamp() {
        let metrics = Metrics {
            run_id: "r1".into(),
            mode: "history_signal".into(),
            start: "2026-01-01 00:00:00".into(),
            end: "2026-01-02 00:00:00".into(),
            symbols: vec!["BTCUSDT".into()],
            timeframe: "1m".into(),
            initial_equity: 10_000.0,
            final_equity: 10_100.0,
            total_return_pct: 1.0,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            trade_count: 0,
            win_rate_pct: 0.0,
            profit_factor: 0.0,
            avg_holding_minutes: 0.0,
            signal_count: 0,
            bar_count: 0,
            buy_hold_final_equity: 10_000.0,
            buy_hold_return_pct: 0.0,
            excess_return_pct: 1.0,
            symbol_contributions: vec![],
            signal_type_counts: Default::default(),
            direction_counts: Default::default(),
            timeframe_counts: Default::default(),
            strategy_label: String::new(),
            strategy_config_path: String::new(),
            strategy_summary: String::new(),
        };
        let text = render_metrics_json(&metrics, "2026-01-02 00:00:01").unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["generated_at"], "2026-01-02 00:00:01");
        assert_eq!(value["total_return_pct"], 1.0);
    }

    #[test]
    fn test_report_contains_sections() {
        let metrics = {
            let mut metrics = Metrics {
                run_id: "r1".into(),
                mode: "offline_rule_replay".into(),
                start: "2026-01-01 00:00:00".into(),
                end: "2026-01-02 00:00:00".into(),
                symbols: vec!["BTCUSDT".into()],
                timeframe: "1m".into(),
                initial_equity: 10_000.0,
                final_equity: 10_492.55,
                total_return_pct: 4.9255,
                max_drawdown_pct: 1.2,
                sharpe: 2.1,
                trade_count: 1,
                win_rate_pct: 100.0,
                profit_factor: 999.0,
                avg_holding_minutes: 55.0,
                signal_count: 2,
                bar_count: 120,
                buy_hold_final_equity: 11_000.0,
                buy_hold_return_pct: 10.0,
                excess_return_pct: -5.0745,
                symbol_contributions: vec![],
                signal_type_counts: Default::default(),
                direction_counts: Default::default(),
                timeframe_counts: Default::default(),
                strategy_label: String::new(),
                strategy_config_path: String::new(),
                strategy_summary: String::new(),
            };
            metrics
                .symbol_contributions
                .push(crate::models::SymbolContribution {
                    symbol: "BTCUSDT".into(),
                    pnl_net: 492.55,
                    trade_count: 1,
                    win_rate_pct: 100.0,
                    avg_holding_minutes: 55.0,
                });
            metrics
        };
        let report = render_report_md(&metrics, &[sample_trade()]);

        assert!(report.contains("# Backtest Report"));
        assert!(report.contains("## Metrics"));
        assert!(report.contains("## Signal Profile"));
        assert!(report.contains("## Symbol Contributions"));
        assert!(report.contains("## Recent Trades"));
        assert!(report.contains("| BTCUSDT | +492.5500 | 1 | 100.00% | 55.00 |"));
        assert!(report.contains("exit_on_opposite"));
    }

    #[test]
    fn test_signal_event_csv_round_trip_is_fixpoint() {
        let events = vec![sample_event(1), sample_event(2)];
        let first = render_signal_events_csv(&events).unwrap();
        let parsed = parse_signal_events_csv(&first).unwrap();
        let second = render_signal_events_csv(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], events[0]);
    }

    #[test]
    fn test_diagnostics_render() {
        use crate::sources::rule_replay::{RuleReplayCounter, RuleTimeframeProfile};
        let mut stats = RuleReplayStats {
            table_count: 1,
            row_count: 12,
            signal_count: 0,
            ..Default::default()
        };
        stats.rule_counters.insert(
            "MACD_dead_cross".into(),
            RuleReplayCounter {
                evaluated: 12,
                condition_failed: 12,
                ..Default::default()
            },
        );
        stats.rule_timeframe_profiles.insert(
            "MACD_dead_cross".into(),
            RuleTimeframeProfile {
                configured_timeframes: vec!["1m".into()],
                observed_timeframes: vec!["1m".into()],
                overlap_timeframes: vec!["1m".into()],
            },
        );

        let text = render_rule_replay_diagnostics(&stats).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["row_count"], 12);
        assert_eq!(value["rule_counters"]["MACD_dead_cross"]["condition_failed"], 12);
        assert_eq!(value["rule_counters"]["MACD_dead_cross"]["trigger_rate_pct"], 0.0);
        assert_eq!(
            value["rule_timeframe_profiles"]["MACD_dead_cross"]["has_overlap"],
            true
        );
    }

    #[tokio::test]
    async fn test_fs_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());
        let files = vec![
            ArtifactFile {
                name: "metrics.json".into(),
                contents: "{}\n".into(),
            },
            ArtifactFile {
                name: "report.md".into(),
                contents: "# Report\n".into(),
            },
        ];
        sink.write_run_artifacts(&RunContext::unbounded(), "20260101-000000/run-1", &files)
            .await
            .unwrap();

        let run_dir = dir.path().join("20260101-000000/run-1");
        assert!(run_dir.join("metrics.json").exists());
        assert_eq!(
            std::fs::read_to_string(run_dir.join("report.md")).unwrap(),
            "# Report\n"
        );
    }

    #[test]
    fn test_artifact_completeness_of_standard_bundle() {
        let metrics = Metrics {
            run_id: "r1".into(),
            mode: "history_signal".into(),
            start: String::new(),
            end: String::new(),
            symbols: vec![],
            timeframe: "1m".into(),
            initial_equity: 10_000.0,
            final_equity: 10_000.0,
            total_return_pct: 0.0,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            trade_count: 0,
            win_rate_pct: 0.0,
            profit_factor: 0.0,
            avg_holding_minutes: 0.0,
            signal_count: 0,
            bar_count: 0,
            buy_hold_final_equity: 10_000.0,
            buy_hold_return_pct: 0.0,
            excess_return_pct: 0.0,
            symbol_contributions: vec![],
            signal_type_counts: Default::default(),
            direction_counts: Default::default(),
            timeframe_counts: Default::default(),
            strategy_label: String::new(),
            strategy_config_path: String::new(),
            strategy_summary: String::new(),
        };
        let files = standard_bundle(&metrics, &[], &[], "2026-01-01 00:00:00").unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["trades.csv", "equity_curve.csv", "metrics.json", "report.md"]
        );
        // Every artifact parses in its own format
        serde_json::from_str::<serde_json::Value>(&files[2].contents).unwrap();
        assert!(files[0].contents.starts_with("symbol,side,"));
        assert!(files[1].contents.starts_with("timestamp,equity"));
        assert!(files[3].contents.starts_with("# Backtest Report"));
    }
}
