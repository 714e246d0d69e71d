//! Input coverage precheck.
//!
//! Before spending minutes on a backtest, measure what the window actually
//! contains: how many signal rows and distinct signal days, how many candles
//! versus the expected minute grid. The guards block thin runs unless
//! forced, and walk-forward uses the same report to decide per-fold
//! fallback.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BacktestConfig;
use crate::error::Result;
use crate::store::{CandleStore, RunContext, SignalStore};
use crate::time::{format_utc, parse_timestamp};

/// Window coverage summary per symbol.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolCoverage {
    /// Trading symbol
    pub symbol: String,
    /// Signal rows in the window
    pub signal_count: usize,
    /// Earliest signal timestamp text
    pub signal_min_ts: String,
    /// Latest signal timestamp text
    pub signal_max_ts: String,
    /// Candles in the window
    pub candle_count: usize,
    /// Earliest candle timestamp text
    pub candle_min_ts: String,
    /// Latest candle timestamp text
    pub candle_max_ts: String,
}

/// Merged coverage summary for the configured window.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Window start, canonical UTC text
    pub start: String,
    /// Window end, canonical UTC text
    pub end: String,
    /// Base timeframe
    pub timeframe: String,
    /// Symbols in scope
    pub symbols: Vec<String>,
    /// Total signal rows
    pub signal_count: usize,
    /// Distinct UTC days with at least one signal
    pub signal_days: usize,
    /// Earliest signal timestamp text
    pub signal_min_ts: String,
    /// Latest signal timestamp text
    pub signal_max_ts: String,
    /// Total candles
    pub candle_count: usize,
    /// Earliest candle timestamp text
    pub candle_min_ts: String,
    /// Latest candle timestamp text
    pub candle_max_ts: String,
    /// Window minutes × symbols
    pub expected_candle_count: usize,
    /// `candle_count / expected_candle_count`, as a percentage
    pub candle_coverage_pct: f64,
    /// Per-symbol rows
    pub symbol_rows: Vec<SymbolCoverage>,
}

/// Thresholds the coverage report is checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecheckThresholds {
    /// Minimum distinct signal days (history mode only; 0 disables)
    pub min_signal_days: usize,
    /// Minimum signal rows (history mode only; 0 disables)
    pub min_signal_count: usize,
    /// Minimum candle coverage percentage
    pub min_candle_coverage_pct: f64,
}

impl Default for PrecheckThresholds {
    fn default() -> Self {
        Self {
            min_signal_days: 7,
            min_signal_count: 200,
            min_candle_coverage_pct: 95.0,
        }
    }
}

/// Compute the coverage report for the configured window.
pub async fn compute_coverage_report(
    ctx: &RunContext,
    config: &BacktestConfig,
    signal_store: &dyn SignalStore,
    candle_store: &dyn CandleStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<CoverageReport> {
    let symbols = crate::config::normalize_symbols(&config.symbols);

    // The two stores are independent; overlap their I/O.
    let (records, bars) = futures::try_join!(
        signal_store.load_signals(ctx, &symbols, start, end, &config.timeframe),
        candle_store.load_bars(ctx, &symbols, start, end, &config.timeframe),
    )?;

    let mut signal_days: BTreeSet<String> = BTreeSet::new();
    let mut signal_min: Option<DateTime<Utc>> = None;
    let mut signal_max: Option<DateTime<Utc>> = None;
    let mut per_symbol: Vec<SymbolCoverage> = symbols
        .iter()
        .map(|symbol| SymbolCoverage {
            symbol: symbol.clone(),
            ..SymbolCoverage::default()
        })
        .collect();

    let mut signal_total = 0usize;
    for record in &records {
        let symbol = record.symbol.trim().to_uppercase();
        let Some(row) = per_symbol.iter_mut().find(|row| row.symbol == symbol) else {
            continue;
        };
        let Some(ts) = parse_timestamp(&record.timestamp) else {
            continue;
        };
        signal_total += 1;
        signal_days.insert(ts.format("%Y-%m-%d").to_string());
        signal_min = Some(signal_min.map_or(ts, |cur| cur.min(ts)));
        signal_max = Some(signal_max.map_or(ts, |cur| cur.max(ts)));

        row.signal_count += 1;
        if row.signal_min_ts.is_empty() || format_utc(ts) < row.signal_min_ts {
            row.signal_min_ts = format_utc(ts);
        }
        if format_utc(ts) > row.signal_max_ts {
            row.signal_max_ts = format_utc(ts);
        }
    }

    let mut candle_total = 0usize;
    let mut candle_min: Option<DateTime<Utc>> = None;
    let mut candle_max: Option<DateTime<Utc>> = None;
    for (symbol, symbol_bars) in &bars {
        let Some(row) = per_symbol.iter_mut().find(|row| &row.symbol == symbol) else {
            continue;
        };
        row.candle_count = symbol_bars.len();
        candle_total += symbol_bars.len();
        if let Some(first) = symbol_bars.iter().map(|b| b.ts).min() {
            row.candle_min_ts = format_utc(first);
            candle_min = Some(candle_min.map_or(first, |cur| cur.min(first)));
        }
        if let Some(last) = symbol_bars.iter().map(|b| b.ts).max() {
            row.candle_max_ts = format_utc(last);
            candle_max = Some(candle_max.map_or(last, |cur| cur.max(last)));
        }
    }

    let minutes = ((end - start).num_seconds().max(0) / 60 + 1) as usize;
    let expected_candle_count = minutes * symbols.len();
    let candle_coverage_pct = if expected_candle_count > 0 {
        candle_total as f64 / expected_candle_count as f64 * 100.0
    } else {
        0.0
    };

    Ok(CoverageReport {
        start: format_utc(start),
        end: format_utc(end),
        timeframe: config.timeframe.trim().to_string(),
        symbols,
        signal_count: signal_total,
        signal_days: signal_days.len(),
        signal_min_ts: signal_min.map(format_utc).unwrap_or_default(),
        signal_max_ts: signal_max.map(format_utc).unwrap_or_default(),
        candle_count: candle_total,
        candle_min_ts: candle_min.map(format_utc).unwrap_or_default(),
        candle_max_ts: candle_max.map(format_utc).unwrap_or_default(),
        expected_candle_count,
        candle_coverage_pct,
        symbol_rows: per_symbol,
    })
}

/// Collect guard failures for `mode` against the thresholds.
///
/// Signal-coverage guards only apply to `history_signal`; the replay modes
/// synthesize their own streams. An empty vector means the run may proceed.
pub fn collect_precheck_failures(
    report: &CoverageReport,
    mode: &str,
    thresholds: &PrecheckThresholds,
) -> Vec<String> {
    let mut failures = Vec::new();

    if report.candle_count == 0 {
        failures.push("no candle rows in selected window".to_string());
    }

    let pct_threshold = thresholds.min_candle_coverage_pct.max(0.0);
    if report.expected_candle_count > 0 && report.candle_coverage_pct < pct_threshold {
        failures.push(format!(
            "candle coverage too low: {:.2}% < {:.2}%",
            report.candle_coverage_pct, pct_threshold
        ));
    }

    if mode == "history_signal" {
        if thresholds.min_signal_days > 0 && report.signal_days < thresholds.min_signal_days {
            failures.push(format!(
                "signal day coverage too low: {} < {}",
                report.signal_days, thresholds.min_signal_days
            ));
        }
        if thresholds.min_signal_count > 0 && report.signal_count < thresholds.min_signal_count {
            failures.push(format!(
                "signal count too low: {} < {}",
                report.signal_count, thresholds.min_signal_count
            ));
        }
    }

    failures
}

/// Human-readable precheck lines for CLI logging.
pub fn format_coverage_lines(report: &CoverageReport) -> Vec<String> {
    let dash = |text: &str| {
        if text.is_empty() {
            "--".to_string()
        } else {
            text.to_string()
        }
    };

    let mut lines = vec![
        format!(
            "window={} -> {} tf={} symbols={}",
            report.start,
            report.end,
            report.timeframe,
            report.symbols.len()
        ),
        format!(
            "signals={} days={} range={} -> {}",
            report.signal_count,
            report.signal_days,
            dash(&report.signal_min_ts),
            dash(&report.signal_max_ts)
        ),
        format!(
            "candles={} expected~={} coverage={:.2}% range={} -> {}",
            report.candle_count,
            report.expected_candle_count,
            report.candle_coverage_pct,
            dash(&report.candle_min_ts),
            dash(&report.candle_max_ts)
        ),
    ];

    for row in &report.symbol_rows {
        lines.push(format!(
            "{}: signals={} candles={} sig_range={} -> {}",
            row.symbol,
            row.signal_count,
            row.candle_count,
            dash(&row.signal_min_ts),
            dash(&row.signal_max_ts)
        ));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bar, SignalRecord};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    struct FixtureStores {
        records: Vec<SignalRecord>,
        bars: HashMap<String, Vec<Bar>>,
    }

    #[async_trait]
    impl SignalStore for FixtureStores {
        async fn load_signals(
            &self,
            _ctx: &RunContext,
            _symbols: &[String],
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _timeframe: &str,
        ) -> Result<Vec<SignalRecord>> {
            Ok(self.records.clone())
        }
    }

    #[async_trait]
    impl CandleStore for FixtureStores {
        async fn load_bars(
            &self,
            _ctx: &RunContext,
            _symbols: &[String],
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _timeframe: &str,
        ) -> Result<HashMap<String, Vec<Bar>>> {
            Ok(self.bars.clone())
        }
    }

    fn record(id: i64, min: i64, symbol: &str) -> SignalRecord {
        SignalRecord {
            id,
            timestamp: format_utc(ts(min)),
            symbol: symbol.to_string(),
            direction: "BUY".into(),
            strength: "70".into(),
            signal_type: "t".into(),
            timeframe: "1m".into(),
            source: "engine".into(),
            price: None,
        }
    }

    fn bar(symbol: &str, min: i64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            ts: ts(min),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1.0,
        }
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            symbols: vec!["BTCUSDT".into()],
            ..BacktestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_coverage_counts() {
        let stores = FixtureStores {
            records: vec![
                record(1, 0, "BTCUSDT"),
                record(2, 1, "BTCUSDT"),
                record(3, 1, "DOGEUSDT"), // out of scope
            ],
            bars: HashMap::from([(
                "BTCUSDT".to_string(),
                (0..5).map(|i| bar("BTCUSDT", i)).collect::<Vec<_>>(),
            )]),
        };
        let report = compute_coverage_report(
            &RunContext::unbounded(),
            &config(),
            &stores,
            &stores,
            ts(0),
            ts(9),
        )
        .await
        .unwrap();

        assert_eq!(report.signal_count, 2);
        assert_eq!(report.signal_days, 1);
        assert_eq!(report.candle_count, 5);
        // Window is 10 minutes inclusive × 1 symbol
        assert_eq!(report.expected_candle_count, 10);
        assert!((report.candle_coverage_pct - 50.0).abs() < 1e-9);
        assert_eq!(report.symbol_rows.len(), 1);
        assert_eq!(report.symbol_rows[0].signal_count, 2);
    }

    #[test]
    fn test_guards_history_mode() {
        let report = CoverageReport {
            signal_count: 50,
            signal_days: 3,
            candle_count: 100,
            expected_candle_count: 100,
            candle_coverage_pct: 100.0,
            ..CoverageReport::default()
        };
        let thresholds = PrecheckThresholds::default();

        let failures = collect_precheck_failures(&report, "history_signal", &thresholds);
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("signal day coverage too low"));
        assert!(failures[1].contains("signal count too low"));

        // Replay modes skip the signal guards
        let failures = collect_precheck_failures(&report, "offline_replay", &thresholds);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_guards_candles() {
        let report = CoverageReport {
            candle_count: 0,
            expected_candle_count: 100,
            candle_coverage_pct: 0.0,
            ..CoverageReport::default()
        };
        let thresholds = PrecheckThresholds {
            min_signal_days: 0,
            min_signal_count: 0,
            min_candle_coverage_pct: 95.0,
        };
        let failures = collect_precheck_failures(&report, "offline_replay", &thresholds);
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("no candle rows"));
        assert!(failures[1].contains("candle coverage too low"));
    }

    #[test]
    fn test_disabled_guards() {
        let report = CoverageReport {
            signal_count: 0,
            signal_days: 0,
            candle_count: 10,
            expected_candle_count: 100,
            candle_coverage_pct: 10.0,
            ..CoverageReport::default()
        };
        let thresholds = PrecheckThresholds {
            min_signal_days: 0,
            min_signal_count: 0,
            min_candle_coverage_pct: 0.0,
        };
        assert!(collect_precheck_failures(&report, "history_signal", &thresholds).is_empty());
    }

    #[test]
    fn test_format_lines() {
        let report = CoverageReport {
            start: "2026-01-01 00:00:00".into(),
            end: "2026-01-02 00:00:00".into(),
            timeframe: "1m".into(),
            symbols: vec!["BTCUSDT".into()],
            symbol_rows: vec![SymbolCoverage {
                symbol: "BTCUSDT".into(),
                ..SymbolCoverage::default()
            }],
            ..CoverageReport::default()
        };
        let lines = format_coverage_lines(&report);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("tf=1m"));
        assert!(lines[1].contains("range=-- -> --"));
        assert!(lines[3].starts_with("BTCUSDT:"));
    }
}
