//! Event-driven position simulator with next-bar-open fills.
//!
//! The engine walks the sorted union of all bar timestamps. At each
//! `(ts, symbol)` with a bar it reads the aggregated score for that minute
//! (if any) and reacts: open on a strong score, reverse or exit on a strong
//! opposite score, close on confirmed neutrality. Fills happen at the next
//! bar's open with slippage; fees are charged per side. Equity is marked to
//! market after every timestamp and any position left at the end is
//! force-closed at its symbol's last close.
//!
//! The engine is synchronous: inputs are fully materialized before it runs.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::aggregator::ScoreMap;
use crate::config::{AggregationConfig, ExecutionConfig, RiskConfig};
use crate::models::{Bar, Direction, EquityPoint, Position, Side, Trade, TradeReason};

/// Output of one simulation run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Closed trades in close order
    pub trades: Vec<Trade>,
    /// Mark-to-market curve, deduplicated and sorted
    pub equity_curve: Vec<EquityPoint>,
    /// Cash after the final close
    pub final_equity: f64,
}

/// Position simulator configured once and run over materialized inputs.
pub struct ExecutionEngine<'a> {
    execution: &'a ExecutionConfig,
    risk: &'a RiskConfig,
    aggregation: &'a AggregationConfig,
}

struct SimState {
    cash: f64,
    positions: HashMap<String, Position>,
    neutral_streak: HashMap<String, u32>,
    last_close: HashMap<String, f64>,
    trades: Vec<Trade>,
}

fn apply_slippage(raw_price: f64, fill_side: Direction, slippage_bps: f64) -> f64 {
    let rate = slippage_bps.max(0.0) / 10_000.0;
    match fill_side {
        Direction::Buy => raw_price * (1.0 + rate),
        Direction::Sell => raw_price * (1.0 - rate),
    }
}

impl<'a> ExecutionEngine<'a> {
    /// Create an engine over the given knobs.
    pub fn new(
        execution: &'a ExecutionConfig,
        risk: &'a RiskConfig,
        aggregation: &'a AggregationConfig,
    ) -> Self {
        Self {
            execution,
            risk,
            aggregation,
        }
    }

    fn fee_rate(&self) -> f64 {
        self.execution.fee_bps.max(0.0) / 10_000.0
    }

    fn open_position(
        &self,
        state: &mut SimState,
        symbol: &str,
        side: Side,
        next_bar: &Bar,
        score: i64,
    ) {
        let entry_side = match side {
            Side::Long => Direction::Buy,
            Side::Short => Direction::Sell,
        };
        let entry_price =
            apply_slippage(next_bar.open, entry_side, self.execution.slippage_bps);

        let pos_pct = self.risk.position_size_pct.clamp(0.0, 1.0);
        let leverage = self.risk.leverage.max(1.0);
        let notional = state.cash.max(0.0) * pos_pct * leverage;
        if notional <= 0.0 || entry_price <= 0.0 {
            return;
        }

        let qty = notional / entry_price;
        let entry_fee = notional * self.fee_rate();
        state.cash -= entry_fee;
        state.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side,
                qty,
                entry_ts: next_bar.ts,
                entry_price,
                entry_fee,
                entry_score: score as i32,
            },
        );
        state.neutral_streak.insert(symbol.to_string(), 0);
        debug!(symbol, side = %side, entry_price, qty, "opened position");
    }

    fn close_position(
        &self,
        state: &mut SimState,
        symbol: &str,
        exit_ts: DateTime<Utc>,
        raw_exit_price: f64,
        score: i64,
        reason: TradeReason,
    ) {
        let Some(pos) = state.positions.remove(symbol) else {
            return;
        };

        let exit_side = match pos.side {
            Side::Long => Direction::Sell,
            Side::Short => Direction::Buy,
        };
        let exit_price = apply_slippage(raw_exit_price, exit_side, self.execution.slippage_bps);

        let pnl_gross = match pos.side {
            Side::Long => (exit_price - pos.entry_price) * pos.qty,
            Side::Short => (pos.entry_price - exit_price) * pos.qty,
        };
        let exit_fee = pos.qty * exit_price * self.fee_rate();
        let pnl_net = pnl_gross - pos.entry_fee - exit_fee;

        // The entry fee was deducted at open; settle gross minus exit fee.
        state.cash += pnl_gross - exit_fee;

        state.trades.push(Trade {
            symbol: symbol.to_string(),
            side: pos.side,
            entry_ts: pos.entry_ts,
            exit_ts,
            entry_price: pos.entry_price,
            exit_price,
            qty: pos.qty,
            entry_fee: pos.entry_fee,
            exit_fee,
            pnl_gross,
            pnl_net,
            entry_score: pos.entry_score,
            exit_score: score as i32,
            reason,
        });
        state.neutral_streak.insert(symbol.to_string(), 0);
        debug!(symbol, exit_price, ?reason, "closed position");
    }

    fn can_neutral_close(&self, state: &SimState, symbol: &str, next_ts: DateTime<Utc>) -> bool {
        if self.execution.min_hold_minutes == 0 {
            return true;
        }
        match state.positions.get(symbol) {
            Some(pos) => pos.held_minutes(next_ts) >= self.execution.min_hold_minutes as f64,
            None => false,
        }
    }

    /// Run the simulation over sorted per-symbol bars and aggregated scores.
    pub fn run(
        &self,
        bars_by_symbol: &HashMap<String, Vec<Bar>>,
        score_map: &ScoreMap,
    ) -> ExecutionResult {
        // Index bars and derive the global timeline.
        let mut bar_at: HashMap<&str, HashMap<DateTime<Utc>, &Bar>> = HashMap::new();
        let mut next_bar_at: HashMap<&str, HashMap<DateTime<Utc>, &Bar>> = HashMap::new();
        let mut timeline: BTreeSet<DateTime<Utc>> = BTreeSet::new();

        let mut symbols: Vec<&str> = Vec::new();
        for (symbol, bars) in bars_by_symbol {
            symbols.push(symbol.as_str());
            let mut sorted: Vec<&Bar> = bars.iter().collect();
            sorted.sort_by_key(|bar| bar.ts);

            let cur = bar_at.entry(symbol.as_str()).or_default();
            let next = next_bar_at.entry(symbol.as_str()).or_default();
            for (idx, bar) in sorted.iter().enumerate() {
                cur.insert(bar.ts, *bar);
                timeline.insert(bar.ts);
                if let Some(following) = sorted.get(idx + 1) {
                    next.insert(bar.ts, *following);
                }
            }
        }
        symbols.sort_unstable();

        let mut state = SimState {
            cash: self.risk.initial_equity,
            positions: HashMap::new(),
            neutral_streak: HashMap::new(),
            last_close: HashMap::new(),
            trades: Vec::new(),
        };
        let mut curve: Vec<EquityPoint> = Vec::new();

        let neutral_confirm = self.execution.neutral_confirm_minutes.max(1);
        let long_open = self.aggregation.long_open_threshold as i64;
        let short_open = self.aggregation.short_open_threshold as i64;
        let close_threshold = self.aggregation.close_threshold as i64;

        for &ts in &timeline {
            for &symbol in &symbols {
                let Some(current_bar) = bar_at.get(symbol).and_then(|m| m.get(&ts)) else {
                    continue;
                };
                state.last_close.insert(symbol.to_string(), current_bar.close);

                let next_bar = next_bar_at.get(symbol).and_then(|m| m.get(&ts)).copied();
                let score_raw = score_map.get(symbol).and_then(|m| m.get(&ts)).copied();
                let has_signal = score_raw.is_some();
                let score = score_raw.unwrap_or(0);

                if !state.positions.contains_key(symbol) {
                    // Event-driven: open only on a signal at this bucket.
                    let Some(next_bar) = next_bar else { continue };
                    if !has_signal {
                        continue;
                    }
                    if score >= long_open && self.execution.allow_long {
                        self.open_position(&mut state, symbol, Side::Long, next_bar, score);
                    } else if score <= -short_open && self.execution.allow_short {
                        self.open_position(&mut state, symbol, Side::Short, next_bar, score);
                    }
                    continue;
                }

                // React only on new signal buckets; otherwise hold.
                let Some(next_bar) = next_bar else { continue };
                if !has_signal {
                    continue;
                }

                let side = state.positions[symbol].side;
                let opposite_fires = match side {
                    Side::Long => score <= -short_open,
                    Side::Short => score >= long_open,
                };

                if opposite_fires {
                    let (reverse_allowed, reverse_side, reverse_reason) = match side {
                        Side::Long => (
                            self.execution.allow_short,
                            Side::Short,
                            TradeReason::ReverseToShort,
                        ),
                        Side::Short => (
                            self.execution.allow_long,
                            Side::Long,
                            TradeReason::ReverseToLong,
                        ),
                    };
                    if reverse_allowed {
                        self.close_position(
                            &mut state,
                            symbol,
                            next_bar.ts,
                            next_bar.open,
                            score,
                            reverse_reason,
                        );
                        self.open_position(&mut state, symbol, reverse_side, next_bar, score);
                    } else {
                        self.close_position(
                            &mut state,
                            symbol,
                            next_bar.ts,
                            next_bar.open,
                            score,
                            TradeReason::ExitOnOpposite,
                        );
                    }
                    state.neutral_streak.insert(symbol.to_string(), 0);
                } else if score.abs() < close_threshold {
                    if !self.can_neutral_close(&state, symbol, next_bar.ts) {
                        continue;
                    }
                    let streak = *state
                        .neutral_streak
                        .entry(symbol.to_string())
                        .and_modify(|s| *s += 1)
                        .or_insert(1);
                    if streak >= neutral_confirm {
                        self.close_position(
                            &mut state,
                            symbol,
                            next_bar.ts,
                            next_bar.open,
                            score,
                            TradeReason::NeutralClose,
                        );
                    }
                } else {
                    state.neutral_streak.insert(symbol.to_string(), 0);
                }
            }

            // Mark to market across open positions at the last known closes.
            let mut mark_equity = state.cash;
            for (symbol, pos) in &state.positions {
                if let Some(&mark) = state.last_close.get(symbol) {
                    mark_equity += pos.unrealized(mark);
                }
            }
            curve.push(EquityPoint {
                ts,
                equity: mark_equity,
            });
        }

        // Force-close remaining positions at each symbol's last close.
        let open_symbols: Vec<String> = state.positions.keys().cloned().collect();
        for symbol in open_symbols {
            let Some(last_bar) = bars_by_symbol
                .get(&symbol)
                .and_then(|bars| bars.iter().max_by_key(|bar| bar.ts))
            else {
                continue;
            };
            self.close_position(
                &mut state,
                &symbol,
                last_bar.ts,
                last_bar.close,
                0,
                TradeReason::EodClose,
            );
        }

        if let Some(&final_ts) = timeline.iter().next_back() {
            curve.push(EquityPoint {
                ts: final_ts,
                equity: state.cash,
            });
        }

        // Coalesce duplicate timestamps (last write wins) and sort.
        let mut dedup: HashMap<DateTime<Utc>, f64> = HashMap::new();
        for point in &curve {
            dedup.insert(point.ts, point.equity);
        }
        let mut equity_curve: Vec<EquityPoint> = dedup
            .into_iter()
            .map(|(ts, equity)| EquityPoint { ts, equity })
            .collect();
        equity_curve.sort_by_key(|point| point.ts);

        ExecutionResult {
            trades: state.trades,
            equity_curve,
            final_equity: state.cash,
        }
    }
}
