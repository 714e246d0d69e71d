//! Synthetic replay source: deterministic pseudo-signals from bars.
//!
//! Used to patch windows where history coverage is sparse. The rules are
//! intentionally simple and gap-controlled so long windows stay tradeable
//! without mimicking the full online rule set:
//!
//! - momentum jump up/down (`|Δclose| >= 0.12%`)
//! - close breakout above the previous high / breakdown below the previous
//!   low (`>= 0.05%`)
//! - volume-confirmed continuation (`vol ratio >= 2.8`, `|Δclose| >= 0.03%`)
//!
//! Among candidates at one bar the strongest wins. A same-direction event
//! must wait `min_signal_gap_bars`; an opposite-direction event may fire
//! after half the gap only when its strength is at least 80.

use std::collections::HashMap;

use tracing::info;

use crate::models::{Bar, Direction, SignalEvent};

/// Source tag assigned to every synthetic event.
pub const SOURCE_SYNTHETIC: &str = "offline_replay";

/// Default same-direction spacing in bars.
pub const DEFAULT_MIN_SIGNAL_GAP_BARS: usize = 3;

fn clamp_strength(value: f64, low: i32) -> i32 {
    (value.round() as i32).clamp(low.max(50), 95)
}

/// Generate pseudo signals from historical bars.
///
/// Bars are walked per symbol in timestamp order; symbols are visited in
/// sorted order so `event_id` assignment is deterministic.
pub fn replay_signals_from_bars(
    bars_by_symbol: &HashMap<String, Vec<Bar>>,
    timeframe: &str,
    start_event_id: i64,
    min_signal_gap_bars: usize,
) -> Vec<SignalEvent> {
    let tf = {
        let trimmed = timeframe.trim();
        if trimmed.is_empty() { "1m" } else { trimmed }
    };
    let gap = min_signal_gap_bars.max(1);
    let mut event_id = start_event_id.max(1);
    let mut events: Vec<SignalEvent> = Vec::new();

    let mut symbols: Vec<&String> = bars_by_symbol.keys().collect();
    symbols.sort();

    for symbol in symbols {
        let mut bars: Vec<&Bar> = bars_by_symbol[symbol].iter().collect();
        bars.sort_by_key(|bar| bar.ts);
        if bars.len() < 2 {
            continue;
        }

        let mut last_emit_idx: isize = isize::MIN / 2;
        let mut last_emit_direction: Option<Direction> = None;

        for i in 1..bars.len() {
            let prev = bars[i - 1];
            let curr = bars[i];
            if prev.close <= 0.0 || prev.high <= 0.0 || prev.low <= 0.0 {
                continue;
            }

            let change_pct = (curr.close - prev.close) / prev.close * 100.0;
            let breakout_pct = (curr.close - prev.high) / prev.high * 100.0;
            let breakdown_pct = (prev.low - curr.close) / prev.low * 100.0;

            let mut candidates: Vec<(Direction, i32, &'static str)> = Vec::new();

            if change_pct >= 0.12 {
                candidates.push((
                    Direction::Buy,
                    clamp_strength(55.0 + change_pct * 120.0, 55),
                    "replay_momentum_up",
                ));
            } else if change_pct <= -0.12 {
                candidates.push((
                    Direction::Sell,
                    clamp_strength(55.0 + change_pct.abs() * 120.0, 55),
                    "replay_momentum_down",
                ));
            }

            if breakout_pct >= 0.05 {
                candidates.push((
                    Direction::Buy,
                    clamp_strength(60.0 + breakout_pct * 180.0, 60),
                    "replay_breakout_up",
                ));
            } else if breakdown_pct >= 0.05 {
                candidates.push((
                    Direction::Sell,
                    clamp_strength(60.0 + breakdown_pct * 180.0, 60),
                    "replay_breakdown_down",
                ));
            }

            if prev.volume > 0.0 {
                let vol_ratio = curr.volume / prev.volume;
                if vol_ratio >= 2.8 && change_pct >= 0.03 {
                    candidates.push((
                        Direction::Buy,
                        clamp_strength(58.0 + vol_ratio * 8.0, 58),
                        "replay_volume_follow_up",
                    ));
                } else if vol_ratio >= 2.8 && change_pct <= -0.03 {
                    candidates.push((
                        Direction::Sell,
                        clamp_strength(58.0 + vol_ratio * 8.0, 58),
                        "replay_volume_follow_down",
                    ));
                }
            }

            // First maximum wins so ties resolve in declaration order
            // (momentum, breakout, volume).
            let mut best: Option<(Direction, i32, &'static str)> = None;
            for candidate in &candidates {
                if best.is_none_or(|b| candidate.1 > b.1) {
                    best = Some(*candidate);
                }
            }
            let Some((direction, strength, signal_type)) = best else {
                continue;
            };

            let bars_since_last = i as isize - last_emit_idx;
            if bars_since_last < gap as isize && last_emit_direction == Some(direction) {
                continue;
            }
            if bars_since_last < ((gap / 2).max(1)) as isize
                && last_emit_direction != Some(direction)
                && strength < 80
            {
                continue;
            }

            events.push(SignalEvent {
                event_id,
                ts: curr.ts,
                symbol: symbol.clone(),
                direction,
                strength,
                signal_type: signal_type.to_string(),
                timeframe: tf.to_string(),
                source: SOURCE_SYNTHETIC.to_string(),
                price: Some(curr.close),
            });
            event_id += 1;
            last_emit_idx = i as isize;
            last_emit_direction = Some(direction);
        }
    }

    super::sort_events(&mut events);
    info!(events = events.len(), "synthetic replay generated signals");
    events
}
