//! Rule-replay source: the declarative rule set evaluated over historical
//! indicator rows.
//!
//! Rules are grouped by table; rows load per table ordered
//! `(symbol, timeframe, ts, rowid)` and every rule is evaluated on
//! consecutive `(prev, curr)` pairs within a `(symbol, timeframe)` group.
//! Each evaluation lands in exactly one outcome bucket:
//!
//! ```text
//! evaluated → timeframe_filtered | volume_filtered | condition_failed
//!           | cooldown_blocked   | triggered
//! ```
//!
//! The per-rule buckets and a `(configured, observed, overlap)` timeframe
//! profile are emitted as diagnostics so a silent rule can be explained
//! after the fact.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::normalize_symbols;
use crate::cooldown::{CooldownLedger, cooldown_key};
use crate::error::{BacktestError, Result};
use crate::models::{Direction, SignalEvent};
use crate::rules::{EvalWarnLimiter, IndicatorRow, RuleDirection, SignalRule};
use crate::store::{IndicatorStore, RunContext};
use crate::time::normalize_timeframe;

/// Source tag assigned to every rule-replay event.
pub const SOURCE_RULE_REPLAY: &str = "offline_rule_replay";

/// The legacy default timeframe set; replaced by the caller's preferred
/// timeframe when a rule still carries exactly this set.
const DEFAULT_RULE_TIMEFRAMES: [&str; 3] = ["1h", "4h", "1d"];

/// Columns probed for a row's traded volume, in order.
const VOLUME_KEYS: [&str; 4] = ["volume", "amount", "turnover", "quote_volume"];

/// Columns probed for a row's reference price, in order.
const PRICE_KEYS: [&str; 3] = ["close", "price", "last_price"];

/// Per-rule evaluation outcome buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleReplayCounter {
    /// Pairs the rule was evaluated against
    pub evaluated: u64,
    /// Rejected by the timeframe filter
    pub timeframe_filtered: u64,
    /// Rejected by the minimum-volume filter
    pub volume_filtered: u64,
    /// Condition did not hold (includes suppressed evaluation failures)
    pub condition_failed: u64,
    /// Blocked by the cooldown ledger
    pub cooldown_blocked: u64,
    /// Signals emitted
    pub triggered: u64,
}

/// Configured vs observed timeframes for one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTimeframeProfile {
    /// Timeframes the rule was resolved to accept
    pub configured_timeframes: Vec<String>,
    /// Timeframes present in the rows the rule saw
    pub observed_timeframes: Vec<String>,
    /// Intersection (or observed when nothing is configured)
    pub overlap_timeframes: Vec<String>,
}

/// Aggregate rule-replay diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleReplayStats {
    /// Tables that had at least one active rule
    pub table_count: usize,
    /// Indicator rows visited
    pub row_count: usize,
    /// Signals emitted
    pub signal_count: usize,
    /// Per-rule outcome buckets, sorted `(-triggered, -evaluated, name)`
    pub rule_counters: IndexMap<String, RuleReplayCounter>,
    /// Per-rule timeframe profiles, sorted by rule name
    pub rule_timeframe_profiles: IndexMap<String, RuleTimeframeProfile>,
}

/// Resolve the timeframe set a rule accepts for this replay.
///
/// When the rule still carries the legacy default `{1h, 4h, 1d}` and the
/// caller passed a preferred timeframe, the set is substituted with
/// `{preferred}` so minute-first replays stay aligned with history runs.
/// The second return is that "locked" flag.
pub fn resolve_rule_timeframes(
    rule: &SignalRule,
    preferred_timeframe: &str,
) -> (BTreeSet<String>, bool) {
    let base: BTreeSet<String> = rule
        .timeframes
        .iter()
        .map(|tf| normalize_timeframe(tf, ""))
        .filter(|tf| !tf.is_empty())
        .collect();

    let preferred = normalize_timeframe(preferred_timeframe, "");
    let default_set: BTreeSet<String> =
        DEFAULT_RULE_TIMEFRAMES.iter().map(|s| s.to_string()).collect();
    if !preferred.is_empty() && base == default_set {
        return (BTreeSet::from([preferred]), true);
    }
    (base, false)
}

fn extract_volume(row: &IndicatorRow) -> Option<f64> {
    for key in VOLUME_KEYS {
        if row.has_field(key) {
            let value = row.numeric(key);
            return Some(if value.is_nan() { 0.0 } else { value });
        }
    }
    None
}

fn extract_price(row: &IndicatorRow) -> Option<f64> {
    for key in PRICE_KEYS {
        if row.has_field(key) {
            let value = row.numeric(key);
            if !value.is_nan() {
                return Some(value);
            }
        }
    }
    None
}

struct RuleRuntime<'a> {
    rule: &'a SignalRule,
    timeframes: BTreeSet<String>,
    locked: bool,
    direction: Direction,
}

/// Replay the rule set against indicator tables for `[start, end]`.
///
/// Cooldowns are honored through `ledger`; the durable write happens before
/// each emission, and a failed write suppresses that signal (the ledger
/// counts it). Store errors propagate.
#[allow(clippy::too_many_arguments)]
pub async fn replay_signals_from_rules(
    ctx: &RunContext,
    store: &dyn IndicatorStore,
    rules: &[SignalRule],
    ledger: &CooldownLedger,
    symbols: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    preferred_timeframe: &str,
    start_event_id: i64,
) -> Result<(Vec<SignalEvent>, RuleReplayStats)> {
    let symbol_list = normalize_symbols(symbols);
    if symbol_list.is_empty() {
        return Ok((Vec::new(), RuleReplayStats::default()));
    }
    let symbol_set: HashSet<&String> = symbol_list.iter().collect();
    let preferred = normalize_timeframe(preferred_timeframe, "");

    let mut by_table: BTreeMap<&str, Vec<RuleRuntime<'_>>> = BTreeMap::new();
    let mut profiles: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        let direction = match rule.direction {
            RuleDirection::Buy => Direction::Buy,
            RuleDirection::Sell => Direction::Sell,
            RuleDirection::Alert => continue,
        };
        let (timeframes, locked) = resolve_rule_timeframes(rule, &preferred);
        profiles.insert(rule.name.clone(), (timeframes.clone(), BTreeSet::new()));
        by_table.entry(rule.table.as_str()).or_default().push(RuleRuntime {
            rule,
            timeframes,
            locked,
            direction,
        });
    }

    let limiter = EvalWarnLimiter::default();
    let mut counters: HashMap<String, RuleReplayCounter> = HashMap::new();
    let mut events: Vec<SignalEvent> = Vec::new();
    let mut event_id = start_event_id.max(1);
    let mut row_total = 0usize;

    let available: HashSet<String> = store.tables(ctx).await?.into_iter().collect();

    for (table, table_rules) in &by_table {
        ctx.check("loading_indicator_tables")?;
        if !available.contains(*table) {
            continue;
        }

        let rows = store
            .load_rows(ctx, table, &symbol_list, start, end)
            .await?;
        if rows.is_empty() {
            continue;
        }
        row_total += rows.len();

        let observed: BTreeSet<String> = rows
            .iter()
            .map(|row| normalize_timeframe(&row.timeframe, &preferred))
            .filter(|tf| !tf.is_empty())
            .collect();
        for runtime in table_rules {
            if let Some((_, seen)) = profiles.get_mut(&runtime.rule.name) {
                seen.extend(observed.iter().cloned());
            }
        }

        let mut prev_by_key: HashMap<(String, String), &IndicatorRow> = HashMap::new();
        for row in &rows {
            let symbol = row.symbol.trim().to_uppercase();
            if symbol.is_empty() || !symbol_set.contains(&symbol) {
                continue;
            }
            let timeframe = normalize_timeframe(&row.timeframe, &preferred);
            let pair_key = (symbol.clone(), timeframe.clone());
            let Some(prev) = prev_by_key.insert(pair_key.clone(), row) else {
                continue;
            };

            let volume = extract_volume(row);

            for runtime in table_rules {
                let counter = counters.entry(runtime.rule.name.clone()).or_default();
                counter.evaluated += 1;

                if !runtime.timeframes.is_empty() {
                    if !timeframe.is_empty() {
                        if !runtime.timeframes.contains(&timeframe) {
                            counter.timeframe_filtered += 1;
                            continue;
                        }
                    } else if runtime.locked
                        && !preferred.is_empty()
                        && !runtime.timeframes.contains(&preferred)
                    {
                        counter.timeframe_filtered += 1;
                        continue;
                    }
                }

                // Tables without a volume column are not gated.
                if let Some(volume) = volume
                    && volume < runtime.rule.min_volume
                {
                    counter.volume_filtered += 1;
                    continue;
                }

                let fired = match runtime.rule.evaluate(Some(prev), row) {
                    Ok(fired) => fired,
                    Err(err) => {
                        limiter.note(&err);
                        false
                    }
                };
                if !fired {
                    counter.condition_failed += 1;
                    continue;
                }

                let key = cooldown_key(&runtime.rule.name, &symbol, &timeframe);
                if !ledger.ready(&key, row.ts, runtime.rule.cooldown_s) {
                    counter.cooldown_blocked += 1;
                    continue;
                }
                // Durable before emission: a failed write suppresses the
                // signal so at-most-once-per-cooldown survives restart.
                match ledger.commit(&key, row.ts) {
                    Ok(()) => {}
                    Err(BacktestError::CooldownPersist { .. }) => continue,
                    Err(err) => return Err(err),
                }

                counter.triggered += 1;
                events.push(SignalEvent {
                    event_id,
                    ts: row.ts,
                    symbol: symbol.clone(),
                    direction: runtime.direction,
                    strength: runtime.rule.strength,
                    signal_type: runtime.rule.name.clone(),
                    timeframe: if timeframe.is_empty() {
                        preferred.clone()
                    } else {
                        timeframe.clone()
                    },
                    source: SOURCE_RULE_REPLAY.to_string(),
                    price: extract_price(row),
                });
                event_id += 1;
            }
        }
    }

    super::sort_events(&mut events);

    // Counters sorted most-active first for stable diagnostics output.
    let mut counter_rows: Vec<(String, RuleReplayCounter)> = counters.into_iter().collect();
    counter_rows.sort_by(|a, b| {
        b.1.triggered
            .cmp(&a.1.triggered)
            .then_with(|| b.1.evaluated.cmp(&a.1.evaluated))
            .then_with(|| a.0.cmp(&b.0))
    });
    let rule_counters: IndexMap<String, RuleReplayCounter> = counter_rows.into_iter().collect();

    let mut rule_timeframe_profiles: IndexMap<String, RuleTimeframeProfile> = IndexMap::new();
    for (name, (configured, observed)) in profiles {
        let overlap: Vec<String> = if configured.is_empty() {
            observed.iter().cloned().collect()
        } else {
            configured.intersection(&observed).cloned().collect()
        };
        rule_timeframe_profiles.insert(
            name,
            RuleTimeframeProfile {
                configured_timeframes: configured.into_iter().collect(),
                observed_timeframes: observed.into_iter().collect(),
                overlap_timeframes: overlap,
            },
        );
    }

    let stats = RuleReplayStats {
        table_count: by_table.len(),
        row_count: row_total,
        signal_count: events.len(),
        rule_counters,
        rule_timeframe_profiles,
    };
    info!(
        signals = stats.signal_count,
        rows = stats.row_count,
        tables = stats.table_count,
        "rule replay generated signals"
    );
    Ok((events, stats))
}
