//! Signal sources.
//!
//! Every source produces the same contract: a [`SignalEvent`] stream sorted
//! by `(ts, symbol, event_id)` with `event_id` strictly increasing within
//! the stream. The aggregator and executor rely on that ordering; a source
//! that cannot guarantee it sorts before returning.

pub mod history;
pub mod rule_replay;
pub mod synthetic;

use crate::models::SignalEvent;

/// Sort a stream into canonical `(ts, symbol, event_id)` order.
pub fn sort_events(events: &mut [SignalEvent]) {
    events.sort_by(|a, b| {
        a.ts.cmp(&b.ts)
            .then_with(|| a.symbol.cmp(&b.symbol))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

/// Whether a stream satisfies the source ordering contract.
///
/// Used by property tests and debug assertions; not on the hot path.
pub fn is_canonically_ordered(events: &[SignalEvent]) -> bool {
    events.windows(2).all(|pair| {
        let key_a = (pair[0].ts, &pair[0].symbol, pair[0].event_id);
        let key_b = (pair[1].ts, &pair[1].symbol, pair[1].event_id);
        key_a <= key_b
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::{Duration, TimeZone, Utc};

    fn event(minute: i64, symbol: &str, event_id: i64) -> SignalEvent {
        SignalEvent {
            event_id,
            ts: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            symbol: symbol.to_string(),
            direction: Direction::Buy,
            strength: 70,
            signal_type: "t".into(),
            timeframe: "1m".into(),
            source: "test".into(),
            price: None,
        }
    }

    #[test]
    fn test_sort_events_canonical_order() {
        let mut events = vec![
            event(5, "ETHUSDT", 3),
            event(1, "BTCUSDT", 2),
            event(5, "BTCUSDT", 1),
            event(1, "BTCUSDT", 4),
        ];
        sort_events(&mut events);
        assert!(is_canonically_ordered(&events));
        assert_eq!(events[0].event_id, 2);
        assert_eq!(events[1].event_id, 4);
        assert_eq!(events[2].event_id, 1);
        assert_eq!(events[3].event_id, 3);
    }

    #[test]
    fn test_ordering_check_detects_violation() {
        let events = vec![event(5, "BTCUSDT", 1), event(1, "BTCUSDT", 2)];
        assert!(!is_canonically_ordered(&events));
        assert!(is_canonically_ordered(&[]));
        assert!(is_canonically_ordered(&[event(1, "BTCUSDT", 1)]));
    }
}
