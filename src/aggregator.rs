//! Signal score aggregation: per-minute net scores with timeframe-aware
//! forward fill.
//!
//! BUY strengths add, SELL strengths subtract, bucketed to the minute. A
//! bucket's score is then held for `max(base_tf, event_tf)` minutes — but
//! never past the symbol's next scored minute — so an executor on 1m bars
//! does not misread the silence between coarser-timeframe events as
//! neutrality.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::models::{Direction, SignalEvent};
use crate::time::{floor_minute, timeframe_minutes};

/// `symbol → minute bucket → net score`, ordered by bucket per symbol.
pub type ScoreMap = HashMap<String, BTreeMap<DateTime<Utc>, i64>>;

/// Aggregate BUY/SELL strengths into net scores by minute.
pub fn aggregate_signal_scores(signals: &[SignalEvent], timeframe: &str) -> ScoreMap {
    let base_minutes = timeframe_minutes(timeframe);

    let mut scores: ScoreMap = HashMap::new();
    let mut hold_minutes: HashMap<String, HashMap<DateTime<Utc>, u32>> = HashMap::new();

    for event in signals {
        let symbol = event.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let bucket = floor_minute(event.ts);
        let delta = match event.direction {
            Direction::Buy => event.strength as i64,
            Direction::Sell => -(event.strength as i64),
        };
        *scores.entry(symbol.clone()).or_default().entry(bucket).or_insert(0) += delta;

        let event_minutes = timeframe_minutes(&event.timeframe);
        let hold = base_minutes.max(event_minutes).max(1);
        let slot = hold_minutes.entry(symbol).or_default().entry(bucket).or_insert(1);
        if hold > *slot {
            *slot = hold;
        }
    }

    let needs_expansion = base_minutes > 1
        || hold_minutes
            .values()
            .flat_map(|by_bucket| by_bucket.values())
            .any(|minutes| *minutes > 1);
    if !needs_expansion {
        return scores;
    }

    // Second pass: forward-fill each scored minute across its hold window,
    // clamped at the symbol's next scored minute.
    let mut expanded: ScoreMap = HashMap::new();
    for (symbol, buckets) in &scores {
        if buckets.is_empty() {
            continue;
        }
        let times: Vec<DateTime<Utc>> = buckets.keys().copied().collect();
        let mut filled: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();

        for (idx, &start) in times.iter().enumerate() {
            let score = buckets[&start];
            let minutes = hold_minutes
                .get(symbol)
                .and_then(|by_bucket| by_bucket.get(&start))
                .copied()
                .unwrap_or(base_minutes)
                .max(1);
            let mut end = start + Duration::minutes(minutes as i64);
            if let Some(&next) = times.get(idx + 1) {
                end = end.min(next);
            }

            let mut cursor = start;
            while cursor < end {
                filled.insert(cursor, score);
                cursor += Duration::minutes(1);
            }
        }
        expanded.insert(symbol.clone(), filled);
    }

    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn event(min: i64, symbol: &str, direction: Direction, strength: i32, tf: &str) -> SignalEvent {
        SignalEvent {
            event_id: min,
            ts: ts(min),
            symbol: symbol.to_string(),
            direction,
            strength,
            signal_type: "t".into(),
            timeframe: tf.to_string(),
            source: "test".into(),
            price: None,
        }
    }

    #[test]
    fn test_signed_sum_within_bucket() {
        let signals = vec![
            event(5, "BTCUSDT", Direction::Buy, 80, "1m"),
            event(5, "BTCUSDT", Direction::Sell, 30, "1m"),
            event(5, "BTCUSDT", Direction::Buy, 10, "1m"),
        ];
        let scores = aggregate_signal_scores(&signals, "1m");
        assert_eq!(scores["BTCUSDT"][&ts(5)], 60);
        assert_eq!(scores["BTCUSDT"].len(), 1);
    }

    #[test]
    fn test_no_expansion_on_pure_1m() {
        let signals = vec![
            event(1, "BTCUSDT", Direction::Buy, 70, "1m"),
            event(9, "BTCUSDT", Direction::Sell, 70, "1m"),
        ];
        let scores = aggregate_signal_scores(&signals, "1m");
        // No fill between the two events
        assert_eq!(scores["BTCUSDT"].len(), 2);
        assert!(!scores["BTCUSDT"].contains_key(&ts(2)));
    }

    #[test]
    fn test_base_timeframe_forward_fill() {
        // 5m base: a single event carries its score across five 1m buckets
        let signals = vec![event(10, "BTCUSDT", Direction::Buy, 80, "5m")];
        let scores = aggregate_signal_scores(&signals, "5m");
        let buckets = &scores["BTCUSDT"];
        for minute in 10..15 {
            assert_eq!(buckets.get(&ts(minute)), Some(&80), "minute {minute}");
        }
        assert!(!buckets.contains_key(&ts(15)));
    }

    #[test]
    fn test_event_timeframe_extends_hold() {
        // 1m base, but a 1h event holds for 60 minutes
        let signals = vec![event(0, "BTCUSDT", Direction::Sell, 90, "1h")];
        let scores = aggregate_signal_scores(&signals, "1m");
        let buckets = &scores["BTCUSDT"];
        assert_eq!(buckets.get(&ts(0)), Some(&-90));
        assert_eq!(buckets.get(&ts(59)), Some(&-90));
        assert!(!buckets.contains_key(&ts(60)));
    }

    #[test]
    fn test_fill_stops_at_next_scored_minute() {
        let signals = vec![
            event(0, "BTCUSDT", Direction::Buy, 80, "1h"),
            event(10, "BTCUSDT", Direction::Sell, 95, "1h"),
        ];
        let scores = aggregate_signal_scores(&signals, "1m");
        let buckets = &scores["BTCUSDT"];
        assert_eq!(buckets.get(&ts(9)), Some(&80));
        // The next scored minute truncates the first window
        assert_eq!(buckets.get(&ts(10)), Some(&-95));
        assert_eq!(buckets.get(&ts(69)), Some(&-95));
        assert!(!buckets.contains_key(&ts(70)));
    }

    #[test]
    fn test_fill_is_per_symbol() {
        let signals = vec![
            event(0, "BTCUSDT", Direction::Buy, 80, "5m"),
            event(2, "ETHUSDT", Direction::Sell, 70, "5m"),
        ];
        let scores = aggregate_signal_scores(&signals, "5m");
        // ETH's event must not truncate BTC's window
        assert_eq!(scores["BTCUSDT"].get(&ts(4)), Some(&80));
        assert_eq!(scores["ETHUSDT"].get(&ts(6)), Some(&-70));
    }

    #[test]
    fn test_sub_minute_events_bucket_together() {
        let mut first = event(3, "BTCUSDT", Direction::Buy, 40, "1m");
        first.ts = ts(3) + Duration::seconds(10);
        let mut second = event(3, "BTCUSDT", Direction::Buy, 35, "1m");
        second.ts = ts(3) + Duration::seconds(45);

        let scores = aggregate_signal_scores(&[first, second], "1m");
        assert_eq!(scores["BTCUSDT"][&ts(3)], 75);
    }

    #[test]
    fn test_empty_input() {
        let scores = aggregate_signal_scores(&[], "5m");
        assert!(scores.is_empty());
    }
}
