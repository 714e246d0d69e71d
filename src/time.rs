//! Timestamp parsing, minute bucketing, and timeframe utilities.
//!
//! Every instant in the crate is a UTC [`DateTime`]. Naive inputs (no
//! offset) are interpreted as UTC at ingress so the same inputs always
//! produce the same buckets regardless of host timezone.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::config::DateRange;
use crate::error::{BacktestError, Result};

/// Canonical text form for persisted timestamps: `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a timestamp as emitted by signal history, candle stores, or config.
///
/// Accepts `YYYY-MM-DD HH:MM:SS[.ffffff]`, ISO-8601 with `T` separator,
/// trailing `Z`, or an explicit offset. Returns `None` when the text is not
/// a timestamp; callers decide whether that drops a row or is an error.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let text = text.replace('T', " ").replace('Z', "+00:00");

    // Offset-carrying forms first, then naive (treated as UTC).
    if let Ok(dt) = DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    // Date-only form: midnight UTC.
    if let Ok(date) = chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Align a timestamp to its minute bucket (seconds and subseconds zeroed).
pub fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Map a timeframe string to minutes.
///
/// `1m`/`5m`/`15m` → minutes, `1h`/`4h` → hours, `1d` → days. Blank or
/// unparseable input maps to 1 minute; this function never fails because
/// timeframe strings arrive from heterogeneous upstream tables.
pub fn timeframe_minutes(timeframe: &str) -> u32 {
    let tf = timeframe.trim().to_lowercase().replace(' ', "");
    if tf.is_empty() || !tf.is_ascii() {
        return 1;
    }
    let (digits, unit) = tf.split_at(tf.len() - 1);
    let value: u32 = match digits.parse() {
        Ok(v) => v,
        Err(_) => return 1,
    };
    match unit {
        "m" => value.max(1),
        "h" => value.saturating_mul(60).max(1),
        "d" => value.saturating_mul(60 * 24).max(1),
        _ => 1,
    }
}

/// Normalize a timeframe label, resolving common aliases.
///
/// Lowercases, strips spaces, and maps forms like `1min`, `60m`, `1hour`,
/// `24h` onto the canonical set (`1m`, `1h`, `1d`, …). An empty input falls
/// back to `fallback` (normalized the same way).
pub fn normalize_timeframe(raw: &str, fallback: &str) -> String {
    let mut text = raw.trim().to_lowercase().replace(' ', "");
    if text.is_empty() {
        text = fallback.trim().to_lowercase().replace(' ', "");
    }
    if text.is_empty() {
        return String::new();
    }
    match text.as_str() {
        "1min" => "1m",
        "5min" => "5m",
        "15min" => "15m",
        "30min" => "30m",
        "60m" | "1hour" => "1h",
        "120m" => "2h",
        "240m" => "4h",
        "1day" | "24h" | "1440m" => "1d",
        other => other,
    }
    .to_string()
}

/// Resolve a configured date range into concrete `(start, end)` instants.
///
/// A missing end defaults to `now`; a missing start defaults to
/// `end - default_days`. An inverted range is a configuration error.
pub fn resolve_range(
    range: &DateRange,
    default_days: i64,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let end = if range.end.trim().is_empty() {
        now
    } else {
        parse_timestamp(&range.end)
            .ok_or_else(|| BacktestError::invalid_param("date_range.end", "unparseable timestamp"))?
    };

    let start = if range.start.trim().is_empty() {
        end - Duration::days(default_days.max(1))
    } else {
        parse_timestamp(&range.start).ok_or_else(|| {
            BacktestError::invalid_param("date_range.start", "unparseable timestamp")
        })?
    };

    if start >= end {
        return Err(BacktestError::invalid_param(
            "date_range",
            format!("start ({}) >= end ({})", format_utc(start), format_utc(end)),
        ));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_naive_as_utc() {
        let ts = parse_timestamp("2026-01-02 03:04:05").unwrap();
        assert_eq!(ts, utc(2026, 1, 2, 3, 4, 5));
    }

    #[test]
    fn test_parse_iso_forms() {
        assert_eq!(
            parse_timestamp("2026-01-02T03:04:05Z").unwrap(),
            utc(2026, 1, 2, 3, 4, 5)
        );
        assert_eq!(
            parse_timestamp("2026-01-02T03:04:05+02:00").unwrap(),
            utc(2026, 1, 2, 1, 4, 5)
        );
        assert_eq!(
            parse_timestamp("2026-01-02 03:04:05.123456").unwrap(),
            utc(2026, 1, 2, 3, 4, 5) + Duration::microseconds(123456)
        );
        assert_eq!(
            parse_timestamp("2026-01-02").unwrap(),
            utc(2026, 1, 2, 0, 0, 0)
        );
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a time").is_none());
        assert!(parse_timestamp("2026-13-40 99:00:00").is_none());
    }

    #[test]
    fn test_floor_minute() {
        let ts = utc(2026, 1, 2, 3, 4, 59) + Duration::milliseconds(900);
        assert_eq!(floor_minute(ts), utc(2026, 1, 2, 3, 4, 0));
    }

    #[test]
    fn test_timeframe_minutes() {
        assert_eq!(timeframe_minutes("1m"), 1);
        assert_eq!(timeframe_minutes("5m"), 5);
        assert_eq!(timeframe_minutes("1h"), 60);
        assert_eq!(timeframe_minutes("4h"), 240);
        assert_eq!(timeframe_minutes("1d"), 1440);
        assert_eq!(timeframe_minutes(""), 1);
        assert_eq!(timeframe_minutes("weird"), 1);
        assert_eq!(timeframe_minutes(" 15M "), 15);
        assert_eq!(timeframe_minutes("周"), 1);
    }

    #[test]
    fn test_normalize_timeframe_aliases() {
        assert_eq!(normalize_timeframe("1min", ""), "1m");
        assert_eq!(normalize_timeframe("60m", ""), "1h");
        assert_eq!(normalize_timeframe("1Hour", ""), "1h");
        assert_eq!(normalize_timeframe("24h", ""), "1d");
        assert_eq!(normalize_timeframe("240m", ""), "4h");
        assert_eq!(normalize_timeframe("", "5m"), "5m");
        assert_eq!(normalize_timeframe("", ""), "");
        assert_eq!(normalize_timeframe("1m", "5m"), "1m");
    }

    #[test]
    fn test_resolve_range_defaults() {
        let now = utc(2026, 4, 1, 0, 0, 0);
        let range = DateRange::default();
        let (start, end) = resolve_range(&range, 90, now).unwrap();
        assert_eq!(end, now);
        assert_eq!(start, now - Duration::days(90));
    }

    #[test]
    fn test_resolve_range_explicit() {
        let now = utc(2026, 4, 1, 0, 0, 0);
        let range = DateRange {
            start: "2026-01-01 00:00:00".into(),
            end: "2026-02-01 00:00:00".into(),
        };
        let (start, end) = resolve_range(&range, 90, now).unwrap();
        assert_eq!(start, utc(2026, 1, 1, 0, 0, 0));
        assert_eq!(end, utc(2026, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_resolve_range_inverted_rejected() {
        let now = utc(2026, 4, 1, 0, 0, 0);
        let range = DateRange {
            start: "2026-03-01 00:00:00".into(),
            end: "2026-02-01 00:00:00".into(),
        };
        assert!(resolve_range(&range, 90, now).is_err());
    }

    #[test]
    fn test_format_utc_canonical() {
        assert_eq!(format_utc(utc(2026, 1, 2, 3, 4, 5)), "2026-01-02 03:04:05");
    }
}
