//! History signal source: replay of persisted signals.
//!
//! Rows come back raw from the [`SignalStore`](crate::store::SignalStore);
//! this module owns the coercion rules. Rows are dropped — never guessed —
//! when the symbol is out of scope, the timeframe mismatches, the direction
//! is not BUY/SELL, the timestamp is unparseable, or the strength is not an
//! integer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::normalize_symbols;
use crate::error::Result;
use crate::models::{Direction, SignalEvent, SignalRecord};
use crate::store::{RunContext, SignalStore};
use crate::time::parse_timestamp;

/// Source tag assigned to every replayed history event.
pub const SOURCE_HISTORY: &str = "history";

/// Coerce raw records into an ordered event stream.
///
/// `timeframe` filters rows whose stored timeframe is non-empty and
/// different; rows with a blank stored timeframe pass through (legacy
/// writers did not tag them).
pub fn events_from_records(
    records: &[SignalRecord],
    symbols: &[String],
    timeframe: &str,
) -> Vec<SignalEvent> {
    let symbol_set: HashSet<String> = normalize_symbols(symbols).into_iter().collect();
    let tf_norm = timeframe.trim().to_lowercase();

    let mut events: Vec<SignalEvent> = Vec::new();
    for record in records {
        let symbol = record.symbol.trim().to_uppercase();
        if !symbol_set.contains(&symbol) {
            continue;
        }
        let row_tf = record.timeframe.trim().to_lowercase();
        if !tf_norm.is_empty() && !row_tf.is_empty() && row_tf != tf_norm {
            continue;
        }
        let Some(ts) = parse_timestamp(&record.timestamp) else {
            continue;
        };
        let Some(direction) = Direction::parse(&record.direction) else {
            continue;
        };
        // Unparseable strength drops the event rather than defaulting;
        // a guessed strength would skew score aggregation.
        let Ok(strength) = record.strength.trim().parse::<i32>() else {
            continue;
        };

        events.push(SignalEvent {
            event_id: record.id,
            ts,
            symbol,
            direction,
            strength,
            signal_type: record.signal_type.clone(),
            timeframe: record.timeframe.clone(),
            source: SOURCE_HISTORY.to_string(),
            price: record.price,
        });
    }

    super::sort_events(&mut events);
    events
}

/// Load and coerce history signals for the window.
pub async fn load_history_signals(
    ctx: &RunContext,
    store: &dyn SignalStore,
    symbols: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeframe: &str,
) -> Result<Vec<SignalEvent>> {
    let records = store
        .load_signals(ctx, symbols, start, end, timeframe)
        .await?;
    let events = events_from_records(&records, symbols, timeframe);
    info!(
        rows = records.len(),
        events = events.len(),
        "loaded history signals"
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::is_canonically_ordered;

    fn record(id: i64, ts: &str, symbol: &str, direction: &str, strength: &str) -> SignalRecord {
        SignalRecord {
            id,
            timestamp: ts.to_string(),
            symbol: symbol.to_string(),
            direction: direction.to_string(),
            strength: strength.to_string(),
            signal_type: "MACD_golden_cross".into(),
            timeframe: "1m".into(),
            source: "engine".into(),
            price: Some(100.0),
        }
    }

    #[test]
    fn test_basic_coercion() {
        let records = vec![
            record(1, "2026-01-01 00:01:00", "btcusdt", "buy", "80"),
            record(2, "2026-01-01 00:02:00", "BTCUSDT", "SELL", "65"),
        ];
        let events = events_from_records(&records, &["BTCUSDT".to_string()], "1m");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, Direction::Buy);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert_eq!(events[0].source, SOURCE_HISTORY);
        assert_eq!(events[1].strength, 65);
    }

    #[test]
    fn test_drops_non_directional_rows() {
        let records = vec![
            record(1, "2026-01-01 00:01:00", "BTCUSDT", "ALERT", "80"),
            record(2, "2026-01-01 00:02:00", "BTCUSDT", "", "80"),
            record(3, "2026-01-01 00:03:00", "BTCUSDT", "BUY", "80"),
        ];
        let events = events_from_records(&records, &["BTCUSDT".to_string()], "1m");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 3);
    }

    #[test]
    fn test_drops_unparseable_strength() {
        let records = vec![
            record(1, "2026-01-01 00:01:00", "BTCUSDT", "BUY", ""),
            record(2, "2026-01-01 00:02:00", "BTCUSDT", "BUY", "strong"),
            record(3, "2026-01-01 00:03:00", "BTCUSDT", "BUY", "7.5"),
            record(4, "2026-01-01 00:04:00", "BTCUSDT", "BUY", "75"),
        ];
        let events = events_from_records(&records, &["BTCUSDT".to_string()], "1m");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 4);
    }

    #[test]
    fn test_symbol_and_timeframe_filters() {
        let mut other_tf = record(2, "2026-01-01 00:02:00", "BTCUSDT", "BUY", "70");
        other_tf.timeframe = "1h".into();
        let mut blank_tf = record(3, "2026-01-01 00:03:00", "BTCUSDT", "BUY", "70");
        blank_tf.timeframe = String::new();

        let records = vec![
            record(1, "2026-01-01 00:01:00", "DOGEUSDT", "BUY", "70"),
            other_tf,
            blank_tf,
        ];
        let events = events_from_records(&records, &["BTCUSDT".to_string()], "1m");
        // Foreign symbol dropped, 1h row filtered, blank timeframe passes
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 3);
    }

    #[test]
    fn test_drops_unparseable_timestamp() {
        let records = vec![record(1, "not a time", "BTCUSDT", "BUY", "70")];
        assert!(events_from_records(&records, &["BTCUSDT".to_string()], "1m").is_empty());
    }

    #[test]
    fn test_output_is_canonically_ordered() {
        let records = vec![
            record(9, "2026-01-01 00:05:00", "ETHUSDT", "BUY", "70"),
            record(5, "2026-01-01 00:05:00", "BTCUSDT", "SELL", "70"),
            record(2, "2026-01-01 00:01:00", "ETHUSDT", "BUY", "70"),
        ];
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let events = events_from_records(&records, &symbols, "1m");
        assert!(is_canonically_ordered(&events));
        assert_eq!(events[0].event_id, 2);
        assert_eq!(events[1].symbol, "BTCUSDT");
    }
}
