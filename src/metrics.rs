//! Performance metric derivation from trades, equity curve, and inputs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::models::{Bar, EquityPoint, Metrics, SignalEvent, SymbolContribution, Trade};
use crate::time::format_utc;

/// Annualization factor for minute returns: √(365·24·60).
fn minute_annual_factor() -> f64 {
    (365.0_f64 * 24.0 * 60.0).sqrt()
}

/// Peak-to-trough drawdown over the curve, as a percentage.
pub fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let Some(first) = curve.first() else {
        return 0.0;
    };
    let mut peak = first.equity;
    let mut max_dd = 0.0f64;
    for point in curve {
        peak = peak.max(point.equity);
        if peak <= 0.0 {
            continue;
        }
        max_dd = max_dd.max((peak - point.equity) / peak);
    }
    max_dd * 100.0
}

/// Sharpe ratio over minute returns of the curve, annualized.
///
/// Zero when the curve has fewer than 3 points or the return deviation is
/// below 1e-12 (a flat curve has no risk-adjusted return to speak of).
pub fn sharpe_ratio(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 3 {
        return 0.0;
    }

    let mut returns: Vec<f64> = Vec::with_capacity(curve.len() - 1);
    let mut prev = curve[0].equity;
    for point in &curve[1..] {
        if prev > 0.0 {
            returns.push((point.equity - prev) / prev);
        }
        prev = point.equity;
    }
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    // Sample variance (n-1)
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.max(0.0).sqrt();
    if std_dev <= 1e-12 {
        return 0.0;
    }

    (mean / std_dev) * minute_annual_factor()
}

fn avg_holding_minutes(trades: &[Trade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().map(Trade::holding_minutes).sum::<f64>() / trades.len() as f64
}

/// Per-symbol contributions, sorted best P&L first then symbol.
pub fn symbol_contributions(trades: &[Trade]) -> Vec<SymbolContribution> {
    struct Acc {
        pnl_net: f64,
        trade_count: usize,
        wins: usize,
        holding_minutes: f64,
    }

    let mut by_symbol: HashMap<String, Acc> = HashMap::new();
    for trade in trades {
        let symbol = trade.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let acc = by_symbol.entry(symbol).or_insert(Acc {
            pnl_net: 0.0,
            trade_count: 0,
            wins: 0,
            holding_minutes: 0.0,
        });
        acc.pnl_net += trade.pnl_net;
        acc.trade_count += 1;
        if trade.pnl_net > 0.0 {
            acc.wins += 1;
        }
        acc.holding_minutes += trade.holding_minutes();
    }

    let mut rows: Vec<SymbolContribution> = by_symbol
        .into_iter()
        .map(|(symbol, acc)| SymbolContribution {
            symbol,
            pnl_net: acc.pnl_net,
            trade_count: acc.trade_count,
            win_rate_pct: if acc.trade_count > 0 {
                acc.wins as f64 / acc.trade_count as f64 * 100.0
            } else {
                0.0
            },
            avg_holding_minutes: if acc.trade_count > 0 {
                acc.holding_minutes / acc.trade_count as f64
            } else {
                0.0
            },
        })
        .collect();

    rows.sort_by(|a, b| {
        b.pnl_net
            .partial_cmp(&a.pnl_net)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    rows
}

fn sorted_counter(counter: HashMap<String, usize>) -> IndexMap<String, usize> {
    let mut rows: Vec<(String, usize)> = counter.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.into_iter().collect()
}

/// Event counters by signal type, direction, and timeframe, each sorted
/// `(-count, key)`.
pub fn signal_profile(
    signals: &[SignalEvent],
) -> (
    IndexMap<String, usize>,
    IndexMap<String, usize>,
    IndexMap<String, usize>,
) {
    let mut by_type: HashMap<String, usize> = HashMap::new();
    let mut by_direction: HashMap<String, usize> = HashMap::new();
    let mut by_timeframe: HashMap<String, usize> = HashMap::new();

    for event in signals {
        let signal_type = {
            let trimmed = event.signal_type.trim();
            if trimmed.is_empty() { "UNKNOWN" } else { trimmed }
        };
        let timeframe = {
            let trimmed = event.timeframe.trim();
            if trimmed.is_empty() { "UNKNOWN" } else { trimmed }
        };
        *by_type.entry(signal_type.to_string()).or_insert(0) += 1;
        *by_direction.entry(event.direction.as_str().to_string()).or_insert(0) += 1;
        *by_timeframe.entry(timeframe.to_string()).or_insert(0) += 1;
    }

    (
        sorted_counter(by_type),
        sorted_counter(by_direction),
        sorted_counter(by_timeframe),
    )
}

/// Equal-weight buy-and-hold baseline: `(final_equity, return_pct)`.
///
/// Each symbol contributes its first-to-last close return; symbols without
/// bars are skipped.
pub fn buy_hold_baseline(
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    initial_equity: f64,
) -> (f64, f64) {
    if initial_equity <= 0.0 {
        return (0.0, 0.0);
    }

    let mut symbol_returns: Vec<f64> = Vec::new();
    for bars in bars_by_symbol.values() {
        let mut sorted: Vec<&Bar> = bars.iter().collect();
        sorted.sort_by_key(|bar| bar.ts);
        let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
            continue;
        };
        if first.close <= 0.0 {
            continue;
        }
        symbol_returns.push((last.close - first.close) / first.close);
    }

    if symbol_returns.is_empty() {
        return (initial_equity, 0.0);
    }
    let avg_return = symbol_returns.iter().sum::<f64>() / symbol_returns.len() as f64;
    (initial_equity * (1.0 + avg_return), avg_return * 100.0)
}

/// Inputs to [`build_metrics`] beyond the execution result itself.
pub struct MetricsInputs<'a> {
    /// Run identifier
    pub run_id: &'a str,
    /// Run mode label
    pub mode: &'a str,
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end
    pub end: DateTime<Utc>,
    /// Symbols in scope
    pub symbols: &'a [String],
    /// Base timeframe label
    pub timeframe: &'a str,
    /// Starting equity
    pub initial_equity: f64,
    /// Ending equity
    pub final_equity: f64,
    /// Bars the run consumed, for the buy-hold baseline
    pub bars_by_symbol: &'a HashMap<String, Vec<Bar>>,
    /// Signals the run consumed, for the profile counters
    pub signals: &'a [SignalEvent],
    /// Total bar count
    pub bar_count: usize,
    /// Strategy label for reporting
    pub strategy_label: &'a str,
    /// Strategy config path for reporting
    pub strategy_config_path: &'a str,
    /// One-line strategy summary
    pub strategy_summary: &'a str,
}

/// Build summarized metrics from raw run outputs.
pub fn build_metrics(
    inputs: &MetricsInputs<'_>,
    trades: &[Trade],
    curve: &[EquityPoint],
) -> Metrics {
    let total_return_pct = if inputs.initial_equity > 0.0 {
        (inputs.final_equity / inputs.initial_equity - 1.0) * 100.0
    } else {
        0.0
    };

    let wins = trades.iter().filter(|t| t.pnl_net > 0.0).count();
    let win_rate_pct = if trades.is_empty() {
        0.0
    } else {
        wins as f64 / trades.len() as f64 * 100.0
    };

    let gain: f64 = trades.iter().filter(|t| t.pnl_net > 0.0).map(|t| t.pnl_net).sum();
    let loss: f64 = -trades.iter().filter(|t| t.pnl_net < 0.0).map(|t| t.pnl_net).sum::<f64>();
    let profit_factor = if loss > 0.0 {
        gain / loss
    } else if gain > 0.0 {
        999.0
    } else {
        0.0
    };

    let (signal_type_counts, direction_counts, timeframe_counts) =
        signal_profile(inputs.signals);
    let (buy_hold_final_equity, buy_hold_return_pct) =
        buy_hold_baseline(inputs.bars_by_symbol, inputs.initial_equity);

    Metrics {
        run_id: inputs.run_id.to_string(),
        mode: inputs.mode.to_string(),
        start: format_utc(inputs.start),
        end: format_utc(inputs.end),
        symbols: inputs.symbols.to_vec(),
        timeframe: inputs.timeframe.to_string(),
        initial_equity: inputs.initial_equity,
        final_equity: inputs.final_equity,
        total_return_pct,
        max_drawdown_pct: max_drawdown_pct(curve),
        sharpe: sharpe_ratio(curve),
        trade_count: trades.len(),
        win_rate_pct,
        profit_factor,
        avg_holding_minutes: avg_holding_minutes(trades),
        signal_count: inputs.signals.len(),
        bar_count: inputs.bar_count,
        buy_hold_final_equity,
        buy_hold_return_pct,
        excess_return_pct: total_return_pct - buy_hold_return_pct,
        symbol_contributions: symbol_contributions(trades),
        signal_type_counts,
        direction_counts,
        timeframe_counts,
        strategy_label: inputs.strategy_label.to_string(),
        strategy_config_path: inputs.strategy_config_path.to_string(),
        strategy_summary: inputs.strategy_summary.to_string(),
    }
}
