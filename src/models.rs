//! Core data model: bars, signal events, positions, trades, and metrics.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// Single OHLCV bar at a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Trading symbol (uppercase)
    pub symbol: String,
    /// Bar open timestamp, aligned to the timeframe boundary
    pub ts: DateTime<Utc>,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Traded volume (>= 0)
    pub volume: f64,
}

impl Bar {
    /// Validate OHLCV invariants at ingress.
    ///
    /// `low <= min(open, close)`, `max(open, close) <= high`, all prices
    /// finite and positive, `volume >= 0`. Bars are externally supplied and
    /// read-only afterwards, so this is the only gate.
    pub fn validate(&self) -> Result<()> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(BacktestError::invalid_param(
                "bar",
                format!("{} {}: non-positive or non-finite price", self.symbol, self.ts),
            ));
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(BacktestError::invalid_param(
                "bar",
                format!("{} {}: low/high do not bound open/close", self.symbol, self.ts),
            ));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(BacktestError::invalid_param(
                "bar",
                format!("{} {}: negative volume", self.symbol, self.ts),
            ));
        }
        Ok(())
    }
}

/// Directional intent of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Long intent
    Buy,
    /// Short intent
    Sell,
}

impl Direction {
    /// Parse a direction label; anything other than BUY/SELL is `None`.
    ///
    /// History tables also contain ALERT and free-form labels; those rows
    /// carry no directional intent and are dropped at the source.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    /// Canonical uppercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic directional trading signal.
///
/// Streams are sorted by `(ts, symbol, event_id)` and `event_id` increases
/// strictly within one source stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Unique, monotonically increasing id within the source stream
    pub event_id: i64,
    /// Event timestamp (UTC)
    pub ts: DateTime<Utc>,
    /// Trading symbol (uppercase)
    pub symbol: String,
    /// BUY or SELL
    pub direction: Direction,
    /// Strength in `[1..100]`
    pub strength: i32,
    /// Producer label (rule name, replay kind, …)
    pub signal_type: String,
    /// Timeframe label of the producing row (`1m`, `1h`, …)
    pub timeframe: String,
    /// Source stream tag (`history`, `offline_replay`, `offline_rule_replay`)
    pub source: String,
    /// Price at signal time when the producer knows it
    pub price: Option<f64>,
}

/// Raw persisted signal row, before coercion into a [`SignalEvent`].
///
/// History tables accumulate rows from years of heterogeneous writers:
/// direction and strength arrive as text and may not parse. The history
/// source owns the coercion rules; stores just hand rows through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// Persisted row id; becomes `event_id`
    pub id: i64,
    /// Timestamp text as stored
    pub timestamp: String,
    /// Symbol as stored
    pub symbol: String,
    /// Direction label as stored (`BUY`/`SELL`/`ALERT`/…)
    pub direction: String,
    /// Strength as stored; non-integer text drops the row
    pub strength: String,
    /// Producer label
    pub signal_type: String,
    /// Timeframe label as stored
    pub timeframe: String,
    /// Source tag as stored
    pub source: String,
    /// Price at signal time, when recorded
    pub price: Option<f64>,
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Profits when price rises
    Long,
    /// Profits when price falls
    Short,
}

impl Side {
    /// Canonical uppercase label used in trades.csv
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeReason {
    /// Strong opposite score closed a long and opened a short
    ReverseToShort,
    /// Strong opposite score closed a short and opened a long
    ReverseToLong,
    /// Strong opposite score closed the position; reversal side disabled
    ExitOnOpposite,
    /// Confirmed neutral score decay
    NeutralClose,
    /// Force-close at the end of the timeline
    EodClose,
}

impl TradeReason {
    /// Snake-case label used in trades.csv
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReverseToShort => "reverse_to_short",
            Self::ReverseToLong => "reverse_to_long",
            Self::ExitOnOpposite => "exit_on_opposite",
            Self::NeutralClose => "neutral_close",
            Self::EodClose => "eod_close",
        }
    }
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position state. At most one open position exists per symbol.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Trading symbol
    pub symbol: String,
    /// LONG or SHORT
    pub side: Side,
    /// Quantity in base units
    pub qty: f64,
    /// Entry fill timestamp
    pub entry_ts: DateTime<Utc>,
    /// Entry price after slippage
    pub entry_price: f64,
    /// Entry fee charged at open
    pub entry_fee: f64,
    /// Aggregated score that triggered the entry
    pub entry_score: i32,
}

impl Position {
    /// Unrealized P&L at a mark price (gross, before fees).
    pub fn unrealized(&self, mark_price: f64) -> f64 {
        match self.side {
            Side::Long => (mark_price - self.entry_price) * self.qty,
            Side::Short => (self.entry_price - mark_price) * self.qty,
        }
    }

    /// Minutes held as of `now`
    pub fn held_minutes(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.entry_ts).num_seconds() as f64 / 60.0).max(0.0)
    }
}

/// Immutable closed position.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Trading symbol
    pub symbol: String,
    /// LONG or SHORT
    pub side: Side,
    /// Entry fill timestamp
    pub entry_ts: DateTime<Utc>,
    /// Exit fill timestamp
    pub exit_ts: DateTime<Utc>,
    /// Entry price after slippage
    pub entry_price: f64,
    /// Exit price after slippage
    pub exit_price: f64,
    /// Quantity in base units
    pub qty: f64,
    /// Fee charged at entry
    pub entry_fee: f64,
    /// Fee charged at exit
    pub exit_fee: f64,
    /// P&L before fees
    pub pnl_gross: f64,
    /// P&L after entry and exit fees
    pub pnl_net: f64,
    /// Score at entry
    pub entry_score: i32,
    /// Score at exit (0 for forced closes)
    pub exit_score: i32,
    /// Close reason
    pub reason: TradeReason,
}

impl Trade {
    /// Holding time in minutes
    pub fn holding_minutes(&self) -> f64 {
        ((self.exit_ts - self.entry_ts).num_seconds() as f64 / 60.0).max(0.0)
    }
}

/// Mark-to-market equity snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    /// Snapshot timestamp
    pub ts: DateTime<Utc>,
    /// Cash plus unrealized P&L across open positions
    pub equity: f64,
}

/// Per-symbol contribution to the run result.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolContribution {
    /// Trading symbol
    pub symbol: String,
    /// Net P&L summed over the symbol's trades
    pub pnl_net: f64,
    /// Number of closed trades
    pub trade_count: usize,
    /// Winning-trade percentage
    pub win_rate_pct: f64,
    /// Mean holding time in minutes
    pub avg_holding_minutes: f64,
}

/// Backtest metrics persisted to `metrics.json`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Run identifier
    pub run_id: String,
    /// Run mode label
    pub mode: String,
    /// Window start, canonical UTC text
    pub start: String,
    /// Window end, canonical UTC text
    pub end: String,
    /// Symbols in scope
    pub symbols: Vec<String>,
    /// Base timeframe label
    pub timeframe: String,
    /// Starting equity
    pub initial_equity: f64,
    /// Ending equity after all closes
    pub final_equity: f64,
    /// `(final/initial - 1) * 100`
    pub total_return_pct: f64,
    /// Peak-to-trough drawdown percentage
    pub max_drawdown_pct: f64,
    /// Sharpe ratio on minute returns, annualized
    pub sharpe: f64,
    /// Closed trade count
    pub trade_count: usize,
    /// Winning-trade percentage
    pub win_rate_pct: f64,
    /// Gross gain / gross loss (999 when loss-free and profitable)
    pub profit_factor: f64,
    /// Mean holding time in minutes
    pub avg_holding_minutes: f64,
    /// Signals consumed by the run
    pub signal_count: usize,
    /// Bars consumed by the run
    pub bar_count: usize,
    /// Equal-weight buy-and-hold final equity
    pub buy_hold_final_equity: f64,
    /// Equal-weight buy-and-hold return percentage
    pub buy_hold_return_pct: f64,
    /// Strategy return minus buy-and-hold return
    pub excess_return_pct: f64,
    /// Per-symbol contributions sorted by `(-pnl_net, symbol)`
    #[serde(default)]
    pub symbol_contributions: Vec<SymbolContribution>,
    /// Event counts by signal type, sorted `(-count, key)`
    #[serde(default)]
    pub signal_type_counts: IndexMap<String, usize>,
    /// Event counts by direction, sorted `(-count, key)`
    #[serde(default)]
    pub direction_counts: IndexMap<String, usize>,
    /// Event counts by timeframe, sorted `(-count, key)`
    #[serde(default)]
    pub timeframe_counts: IndexMap<String, usize>,
    /// Optional strategy label for reporting
    #[serde(default)]
    pub strategy_label: String,
    /// Optional path of the strategy config used
    #[serde(default)]
    pub strategy_config_path: String,
    /// One-line strategy summary (sides, thresholds, costs)
    #[serde(default)]
    pub strategy_summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(min)
    }

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            ts: ts(0),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn test_bar_validate_ok() {
        assert!(bar(100.0, 101.0, 99.0, 100.5, 12.0).validate().is_ok());
        // Degenerate but legal: flat bar
        assert!(bar(100.0, 100.0, 100.0, 100.0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_bar_validate_rejects_bad_bounds() {
        assert!(bar(100.0, 100.2, 99.9, 100.5, 1.0).validate().is_err()); // close > high
        assert!(bar(100.0, 101.0, 100.1, 100.5, 1.0).validate().is_err()); // low > open
    }

    #[test]
    fn test_bar_validate_rejects_bad_numbers() {
        assert!(bar(0.0, 101.0, 99.0, 100.0, 1.0).validate().is_err());
        assert!(bar(f64::NAN, 101.0, 99.0, 100.0, 1.0).validate().is_err());
        assert!(bar(100.0, 101.0, 99.0, 100.0, -1.0).validate().is_err());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse(" buy "), Some(Direction::Buy));
        assert_eq!(Direction::parse("SELL"), Some(Direction::Sell));
        assert_eq!(Direction::parse("ALERT"), None);
        assert_eq!(Direction::parse(""), None);
    }

    #[test]
    fn test_position_unrealized() {
        let pos = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: 2.0,
            entry_ts: ts(0),
            entry_price: 100.0,
            entry_fee: 0.1,
            entry_score: 80,
        };
        assert!((pos.unrealized(105.0) - 10.0).abs() < 1e-9);

        let short = Position { side: Side::Short, ..pos };
        assert!((short.unrealized(95.0) - 10.0).abs() < 1e-9);
        assert!((short.held_minutes(ts(30)) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_reason_labels() {
        assert_eq!(TradeReason::ReverseToShort.as_str(), "reverse_to_short");
        assert_eq!(TradeReason::EodClose.to_string(), "eod_close");
    }

    #[test]
    fn test_metrics_json_round_trip() {
        let metrics = Metrics {
            run_id: "20260101-000000".into(),
            mode: "history_signal".into(),
            start: "2026-01-01 00:00:00".into(),
            end: "2026-02-01 00:00:00".into(),
            symbols: vec!["BTCUSDT".into()],
            timeframe: "1m".into(),
            initial_equity: 10_000.0,
            final_equity: 10_100.0,
            total_return_pct: 1.0,
            max_drawdown_pct: 0.5,
            sharpe: 1.2,
            trade_count: 3,
            win_rate_pct: 66.67,
            profit_factor: 2.5,
            avg_holding_minutes: 42.0,
            signal_count: 10,
            bar_count: 1000,
            buy_hold_final_equity: 10_050.0,
            buy_hold_return_pct: 0.5,
            excess_return_pct: 0.5,
            symbol_contributions: vec![],
            signal_type_counts: IndexMap::from([("MACD_golden_cross".to_string(), 4)]),
            direction_counts: IndexMap::from([
                ("BUY".to_string(), 7),
                ("SELL".to_string(), 3),
            ]),
            timeframe_counts: IndexMap::from([("1m".to_string(), 10)]),
            strategy_label: String::new(),
            strategy_config_path: String::new(),
            strategy_summary: String::new(),
        };
        let text = serde_json::to_string(&metrics).unwrap();
        let back: Metrics = serde_json::from_str(&text).unwrap();
        assert_eq!(back, metrics);
    }
}
