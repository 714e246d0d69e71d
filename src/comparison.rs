//! History vs rule-replay comparison.
//!
//! The comparator runs the identical window twice — once from persisted
//! history, once through rule replay — and diffs the two runs: headline
//! metrics, per-key signal profiles, rules missing on either side, and a
//! root-cause classification for each missing rule based on the replay's
//! diagnostic counters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::runner::{RunMode, RunnerEnv, RunnerResult, run_backtest};
use crate::sources::rule_replay::{RuleReplayCounter, RuleReplayStats, RuleTimeframeProfile};
use crate::store::{ArtifactFile, Clock};
use crate::time::format_utc;

/// Side-by-side summary of one history run and one rule-replay run.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    /// Base run id of the comparison
    pub run_id: String,
    /// History leg run id
    pub history_run_id: String,
    /// Rule-replay leg run id
    pub rule_run_id: String,
    /// History leg return percentage
    pub history_return_pct: f64,
    /// Rule leg return percentage
    pub rule_return_pct: f64,
    /// History leg max drawdown percentage
    pub history_max_drawdown_pct: f64,
    /// Rule leg max drawdown percentage
    pub rule_max_drawdown_pct: f64,
    /// History leg trade count
    pub history_trade_count: usize,
    /// Rule leg trade count
    pub rule_trade_count: usize,
    /// History leg excess return vs buy-and-hold
    pub history_excess_return_pct: f64,
    /// Rule leg excess return vs buy-and-hold
    pub rule_excess_return_pct: f64,
    /// History leg signal count
    pub history_signal_count: usize,
    /// Rule leg signal count
    pub rule_signal_count: usize,
    /// History leg bar count
    pub history_bar_count: usize,
    /// Rule leg bar count
    pub rule_bar_count: usize,
    /// History leg counts by signal type
    pub history_signal_type_counts: IndexMap<String, usize>,
    /// Rule leg counts by signal type
    pub rule_signal_type_counts: IndexMap<String, usize>,
    /// History leg counts by direction
    pub history_direction_counts: IndexMap<String, usize>,
    /// Rule leg counts by direction
    pub rule_direction_counts: IndexMap<String, usize>,
    /// History leg counts by timeframe
    pub history_timeframe_counts: IndexMap<String, usize>,
    /// Rule leg counts by timeframe
    pub rule_timeframe_counts: IndexMap<String, usize>,
}

/// One row of a per-key delta table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRow {
    /// Counter key (signal type, timeframe, or direction)
    pub key: String,
    /// Count on the history side
    pub history_count: usize,
    /// Count on the rule side
    pub rule_count: usize,
    /// `rule_count - history_count`
    pub delta: i64,
}

fn normalize_counter(raw: &IndexMap<String, usize>) -> IndexMap<String, usize> {
    let mut merged: IndexMap<String, usize> = IndexMap::new();
    for (key, count) in raw {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        *merged.entry(key.to_string()).or_insert(0) += count;
    }
    let mut rows: Vec<(String, usize)> = merged.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.into_iter().collect()
}

fn counter_delta(
    history: &IndexMap<String, usize>,
    rule: &IndexMap<String, usize>,
    top_n: usize,
) -> Vec<DeltaRow> {
    let mut keys: Vec<&String> = history.keys().chain(rule.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut rows: Vec<DeltaRow> = keys
        .into_iter()
        .map(|key| {
            let history_count = history.get(key).copied().unwrap_or(0);
            let rule_count = rule.get(key).copied().unwrap_or(0);
            DeltaRow {
                key: key.clone(),
                history_count,
                rule_count,
                delta: rule_count as i64 - history_count as i64,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.delta
            .abs()
            .cmp(&a.delta.abs())
            .then_with(|| a.key.cmp(&b.key))
    });
    rows.truncate(top_n);
    rows
}

/// Rules the history stream produced that rule replay never emitted.
fn top_missing_history_rules(
    history: &IndexMap<String, usize>,
    rule: &IndexMap<String, usize>,
    top_n: usize,
) -> Vec<DeltaRow> {
    let mut rows: Vec<DeltaRow> = history
        .iter()
        .filter(|(key, count)| **count > 0 && rule.get(*key).copied().unwrap_or(0) == 0)
        .map(|(key, count)| DeltaRow {
            key: key.clone(),
            history_count: *count,
            rule_count: 0,
            delta: -(*count as i64),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.history_count
            .cmp(&a.history_count)
            .then_with(|| a.key.cmp(&b.key))
    });
    rows.truncate(top_n);
    rows
}

/// Rules only rule replay produced.
fn top_new_rule_types(
    history: &IndexMap<String, usize>,
    rule: &IndexMap<String, usize>,
    top_n: usize,
) -> Vec<DeltaRow> {
    let mut rows: Vec<DeltaRow> = rule
        .iter()
        .filter(|(key, count)| **count > 0 && history.get(*key).copied().unwrap_or(0) == 0)
        .map(|(key, count)| DeltaRow {
            key: key.clone(),
            history_count: 0,
            rule_count: *count,
            delta: *count as i64,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.rule_count
            .cmp(&a.rule_count)
            .then_with(|| a.key.cmp(&b.key))
    });
    rows.truncate(top_n);
    rows
}

fn safe_pct(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}

/// BUY/SELL balance of one counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionMix {
    /// BUY count
    pub buy: usize,
    /// SELL count
    pub sell: usize,
    /// Everything else
    pub other: usize,
    /// Total events
    pub total: usize,
    /// `buy / (buy + sell)` as a percentage
    pub buy_ratio_pct: f64,
}

fn direction_mix(counter: &IndexMap<String, usize>) -> DirectionMix {
    let buy = counter.get("BUY").copied().unwrap_or(0);
    let sell = counter.get("SELL").copied().unwrap_or(0);
    let total: usize = counter.values().sum();
    DirectionMix {
        buy,
        sell,
        other: total.saturating_sub(buy + sell),
        total,
        buy_ratio_pct: safe_pct(buy, buy + sell),
    }
}

/// Jaccard overlap of the rule-name sets on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOverlap {
    /// Distinct rule types on the history side
    pub history_rule_types: usize,
    /// Distinct rule types on the rule side
    pub rule_rule_types: usize,
    /// Rule types present on both sides
    pub shared_rule_types: usize,
    /// `shared / union` as a percentage
    pub jaccard_pct: f64,
    /// `shared / history` as a percentage
    pub history_coverage_pct: f64,
    /// `shared / rule` as a percentage
    pub rule_overlap_pct: f64,
}

fn rule_overlap(
    history: &IndexMap<String, usize>,
    rule: &IndexMap<String, usize>,
) -> RuleOverlap {
    let history_set: Vec<&String> = history
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(key, _)| key)
        .collect();
    let rule_set: Vec<&String> = rule
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(key, _)| key)
        .collect();
    let shared = history_set.iter().filter(|key| rule_set.contains(key)).count();
    let union = history_set.len() + rule_set.len() - shared;

    RuleOverlap {
        history_rule_types: history_set.len(),
        rule_rule_types: rule_set.len(),
        shared_rule_types: shared,
        jaccard_pct: safe_pct(shared, union),
        history_coverage_pct: safe_pct(shared, history_set.len()),
        rule_overlap_pct: safe_pct(shared, rule_set.len()),
    }
}

/// Dominant-timeframe profile of one counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeDominance {
    /// Most frequent timeframe (`--` when empty)
    pub dominant: String,
    /// Its count
    pub dominant_count: usize,
    /// Its share of the total, as a percentage
    pub dominant_ratio_pct: f64,
    /// Total events
    pub total: usize,
    /// Distinct timeframes
    pub unique: usize,
}

fn timeframe_dominance(counter: &IndexMap<String, usize>) -> TimeframeDominance {
    let total: usize = counter.values().sum();
    if total == 0 || counter.is_empty() {
        return TimeframeDominance {
            dominant: "--".to_string(),
            dominant_count: 0,
            dominant_ratio_pct: 0.0,
            total: 0,
            unique: 0,
        };
    }
    let (dominant, dominant_count) = counter
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(key, count)| (key.clone(), *count))
        .unwrap_or_default();
    TimeframeDominance {
        dominant_ratio_pct: safe_pct(dominant_count, total),
        dominant,
        dominant_count,
        total,
        unique: counter.len(),
    }
}

/// Classify why a history rule stayed silent in rule replay.
///
/// `timeframe_no_data` wins when the rule was timeframe-filtered away and
/// its configured timeframes share nothing with what the tables contained;
/// otherwise the largest block counter names the reason.
pub fn primary_block_reason(
    counter: &RuleReplayCounter,
    profile: Option<&RuleTimeframeProfile>,
) -> &'static str {
    if counter.timeframe_filtered > 0
        && counter.triggered == 0
        && let Some(profile) = profile
        && !profile.configured_timeframes.is_empty()
        && !profile.observed_timeframes.is_empty()
        && profile.overlap_timeframes.is_empty()
    {
        return "timeframe_no_data";
    }

    let mut pairs = [
        ("condition_failed", counter.condition_failed),
        ("timeframe_filtered", counter.timeframe_filtered),
        ("volume_filtered", counter.volume_filtered),
        ("cooldown_blocked", counter.cooldown_blocked),
    ];
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let (top_reason, top_value) = pairs[0];
    if top_value == 0 {
        if counter.evaluated == 0 {
            "not_evaluated"
        } else {
            "unknown"
        }
    } else {
        top_reason
    }
}

fn missing_rule_diagnostics(
    missing: &[DeltaRow],
    stats: Option<&RuleReplayStats>,
) -> Vec<serde_json::Value> {
    let Some(stats) = stats else {
        return Vec::new();
    };
    missing
        .iter()
        .map(|row| {
            let counter = stats.rule_counters.get(&row.key).copied().unwrap_or_default();
            let profile = stats.rule_timeframe_profiles.get(&row.key);
            let empty = RuleTimeframeProfile::default();
            let profile_ref = profile.unwrap_or(&empty);
            json!({
                "key": &row.key,
                "history_count": row.history_count,
                "rule_count": row.rule_count,
                "evaluated": counter.evaluated,
                "timeframe_filtered": counter.timeframe_filtered,
                "volume_filtered": counter.volume_filtered,
                "condition_failed": counter.condition_failed,
                "cooldown_blocked": counter.cooldown_blocked,
                "triggered": counter.triggered,
                "configured_timeframes": &profile_ref.configured_timeframes,
                "observed_timeframes": &profile_ref.observed_timeframes,
                "overlap_timeframes": &profile_ref.overlap_timeframes,
                "trigger_rate_pct": if counter.evaluated > 0 {
                    counter.triggered as f64 / counter.evaluated as f64 * 100.0
                } else {
                    0.0
                },
                "primary_block_reason": primary_block_reason(&counter, profile),
            })
        })
        .collect()
}

/// Build the side-by-side summary from two completed runs.
pub fn build_comparison_summary(
    run_id: &str,
    history: &RunnerResult,
    rule_replay: &RunnerResult,
) -> ComparisonSummary {
    ComparisonSummary {
        run_id: run_id.to_string(),
        history_run_id: history.run_id.clone(),
        rule_run_id: rule_replay.run_id.clone(),
        history_return_pct: history.metrics.total_return_pct,
        rule_return_pct: rule_replay.metrics.total_return_pct,
        history_max_drawdown_pct: history.metrics.max_drawdown_pct,
        rule_max_drawdown_pct: rule_replay.metrics.max_drawdown_pct,
        history_trade_count: history.metrics.trade_count,
        rule_trade_count: rule_replay.metrics.trade_count,
        history_excess_return_pct: history.metrics.excess_return_pct,
        rule_excess_return_pct: rule_replay.metrics.excess_return_pct,
        history_signal_count: history.metrics.signal_count,
        rule_signal_count: rule_replay.metrics.signal_count,
        history_bar_count: history.metrics.bar_count,
        rule_bar_count: rule_replay.metrics.bar_count,
        history_signal_type_counts: normalize_counter(&history.metrics.signal_type_counts),
        rule_signal_type_counts: normalize_counter(&rule_replay.metrics.signal_type_counts),
        history_direction_counts: normalize_counter(&history.metrics.direction_counts),
        rule_direction_counts: normalize_counter(&rule_replay.metrics.direction_counts),
        history_timeframe_counts: normalize_counter(&history.metrics.timeframe_counts),
        rule_timeframe_counts: normalize_counter(&rule_replay.metrics.timeframe_counts),
    }
}

/// Render `comparison.json` for the summary plus replay diagnostics.
pub fn render_comparison_json(
    summary: &ComparisonSummary,
    rule_stats: Option<&RuleReplayStats>,
    generated_at: &str,
) -> Result<String> {
    let signal_type_delta_top = counter_delta(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        12,
    );
    let timeframe_delta_top = counter_delta(
        &summary.history_timeframe_counts,
        &summary.rule_timeframe_counts,
        8,
    );
    let direction_delta = counter_delta(
        &summary.history_direction_counts,
        &summary.rule_direction_counts,
        8,
    );
    let missing_top = top_missing_history_rules(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        8,
    );
    let new_top = top_new_rule_types(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        8,
    );
    let history_mix = direction_mix(&summary.history_direction_counts);
    let rule_mix = direction_mix(&summary.rule_direction_counts);
    let overlap = rule_overlap(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
    );
    let mut timeframe_overlap: Vec<&String> = summary
        .history_timeframe_counts
        .keys()
        .filter(|key| summary.rule_timeframe_counts.contains_key(*key))
        .collect();
    timeframe_overlap.sort();

    let mut payload = serde_json::to_value(summary)?;
    let map = payload
        .as_object_mut()
        .ok_or_else(|| BacktestError::store_fatal("render_comparison", "summary not an object"))?;
    map.insert("generated_at".into(), json!(generated_at));
    map.insert(
        "delta_return_pct".into(),
        json!(summary.rule_return_pct - summary.history_return_pct),
    );
    map.insert(
        "delta_max_drawdown_pct".into(),
        json!(summary.rule_max_drawdown_pct - summary.history_max_drawdown_pct),
    );
    map.insert(
        "delta_trade_count".into(),
        json!(summary.rule_trade_count as i64 - summary.history_trade_count as i64),
    );
    map.insert(
        "delta_excess_return_pct".into(),
        json!(summary.rule_excess_return_pct - summary.history_excess_return_pct),
    );
    map.insert(
        "delta_signal_count".into(),
        json!(summary.rule_signal_count as i64 - summary.history_signal_count as i64),
    );
    map.insert("history_direction_mix".into(), serde_json::to_value(&history_mix)?);
    map.insert("rule_direction_mix".into(), serde_json::to_value(&rule_mix)?);
    map.insert(
        "delta_buy_ratio_pct".into(),
        json!(rule_mix.buy_ratio_pct - history_mix.buy_ratio_pct),
    );
    map.insert("direction_delta".into(), serde_json::to_value(&direction_delta)?);
    map.insert(
        "timeframe_delta_top".into(),
        serde_json::to_value(&timeframe_delta_top)?,
    );
    map.insert(
        "signal_type_delta_top".into(),
        serde_json::to_value(&signal_type_delta_top)?,
    );
    map.insert("rule_overlap".into(), serde_json::to_value(&overlap)?);
    map.insert(
        "history_timeframe_profile".into(),
        serde_json::to_value(timeframe_dominance(&summary.history_timeframe_counts))?,
    );
    map.insert(
        "rule_timeframe_profile".into(),
        serde_json::to_value(timeframe_dominance(&summary.rule_timeframe_counts))?,
    );
    map.insert("timeframe_overlap".into(), serde_json::to_value(&timeframe_overlap)?);
    map.insert("missing_history_rules_top".into(), serde_json::to_value(&missing_top)?);
    map.insert("new_rule_types_top".into(), serde_json::to_value(&new_top)?);
    map.insert(
        "missing_history_rules_diagnostics".into(),
        json!(missing_rule_diagnostics(&missing_top, rule_stats)),
    );

    Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?))
}

fn delta_table(lines: &mut Vec<String>, header: &str, rows: &[DeltaRow]) {
    lines.push(format!("| {header} | history | rule | delta |"));
    lines.push("|---|---:|---:|---:|".to_string());
    if rows.is_empty() {
        lines.push("| -- | -- | -- | -- |".to_string());
    } else {
        for row in rows {
            lines.push(format!(
                "| {} | {} | {} | {:+} |",
                row.key, row.history_count, row.rule_count, row.delta
            ));
        }
    }
}

/// Render `comparison.md` for human review.
pub fn render_comparison_md(
    summary: &ComparisonSummary,
    rule_stats: Option<&RuleReplayStats>,
    generated_at: &str,
) -> String {
    let missing_top = top_missing_history_rules(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        8,
    );
    let new_top = top_new_rule_types(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        8,
    );
    let signal_type_delta_top = counter_delta(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
        12,
    );
    let timeframe_delta_top = counter_delta(
        &summary.history_timeframe_counts,
        &summary.rule_timeframe_counts,
        8,
    );
    let direction_delta = counter_delta(
        &summary.history_direction_counts,
        &summary.rule_direction_counts,
        8,
    );
    let history_mix = direction_mix(&summary.history_direction_counts);
    let rule_mix = direction_mix(&summary.rule_direction_counts);
    let overlap = rule_overlap(
        &summary.history_signal_type_counts,
        &summary.rule_signal_type_counts,
    );
    let history_dom = timeframe_dominance(&summary.history_timeframe_counts);
    let rule_dom = timeframe_dominance(&summary.rule_timeframe_counts);
    let mut timeframe_overlap: Vec<&String> = summary
        .history_timeframe_counts
        .keys()
        .filter(|key| summary.rule_timeframe_counts.contains_key(*key))
        .collect();
    timeframe_overlap.sort();
    let overlap_txt = if timeframe_overlap.is_empty() {
        "--".to_string()
    } else {
        timeframe_overlap
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let diagnostics = missing_rule_diagnostics(&missing_top, rule_stats);

    let mut lines: Vec<String> = vec![
        "# Backtest Mode Comparison".into(),
        String::new(),
        format!("- run_id: `{}`", summary.run_id),
        format!("- generated_at: `{generated_at}`"),
        format!("- history_run: `{}`", summary.history_run_id),
        format!("- rule_replay_run: `{}`", summary.rule_run_id),
        String::new(),
        "## Metrics".into(),
        String::new(),
        format!(
            "- Return: history `{:+.2}%` vs rule `{:+.2}%`",
            summary.history_return_pct, summary.rule_return_pct
        ),
        format!(
            "- Max Drawdown: history `{:.2}%` vs rule `{:.2}%`",
            summary.history_max_drawdown_pct, summary.rule_max_drawdown_pct
        ),
        format!(
            "- Trades: history `{}` vs rule `{}`",
            summary.history_trade_count, summary.rule_trade_count
        ),
        format!(
            "- Excess Return(BH): history `{:+.2}%` vs rule `{:+.2}%`",
            summary.history_excess_return_pct, summary.rule_excess_return_pct
        ),
        format!(
            "- Signal Count: history `{}` vs rule `{}`",
            summary.history_signal_count, summary.rule_signal_count
        ),
        format!(
            "- Bar Count: history `{}` vs rule `{}`",
            summary.history_bar_count, summary.rule_bar_count
        ),
        String::new(),
        "## Delta (rule - history)".into(),
        String::new(),
        format!(
            "- Return Delta: `{:+.2}%`",
            summary.rule_return_pct - summary.history_return_pct
        ),
        format!(
            "- Max Drawdown Delta: `{:+.2}%`",
            summary.rule_max_drawdown_pct - summary.history_max_drawdown_pct
        ),
        format!(
            "- Trade Count Delta: `{:+}`",
            summary.rule_trade_count as i64 - summary.history_trade_count as i64
        ),
        format!(
            "- Excess Return Delta: `{:+.2}%`",
            summary.rule_excess_return_pct - summary.history_excess_return_pct
        ),
        format!(
            "- Signal Count Delta: `{:+}`",
            summary.rule_signal_count as i64 - summary.history_signal_count as i64
        ),
        String::new(),
        "## Rule Alignment".into(),
        String::new(),
        format!(
            "- Rule Type Overlap: shared `{}` / history `{}` / rule `{}`",
            overlap.shared_rule_types, overlap.history_rule_types, overlap.rule_rule_types
        ),
        format!(
            "- Jaccard: `{:.2}%` | history coverage: `{:.2}%`",
            overlap.jaccard_pct, overlap.history_coverage_pct
        ),
        format!(
            "- rule overlap in history: `{:.2}%` | timeframe overlap: `{overlap_txt}`",
            overlap.rule_overlap_pct
        ),
        String::new(),
        "### Missing in Rule Replay (history>0, rule=0)".into(),
        String::new(),
    ];
    delta_table(&mut lines, "signal_type", &missing_top);

    if !diagnostics.is_empty() {
        lines.extend([
            String::new(),
            "### Missing Rule Diagnostics".into(),
            String::new(),
            "| signal_type | evaluated | condition_fail | tf_filter | volume_filter | cooldown | reason |".into(),
            "|---|---:|---:|---:|---:|---:|---|".into(),
        ]);
        for row in &diagnostics {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                row["key"].as_str().unwrap_or("--"),
                row["evaluated"],
                row["condition_failed"],
                row["timeframe_filtered"],
                row["volume_filtered"],
                row["cooldown_blocked"],
                row["primary_block_reason"].as_str().unwrap_or("--"),
            ));
        }
    }

    lines.extend([
        String::new(),
        "### New in Rule Replay (history=0, rule>0)".into(),
        String::new(),
    ]);
    delta_table(&mut lines, "signal_type", &new_top);

    lines.extend([
        String::new(),
        "## Signal Profile".into(),
        String::new(),
        format!(
            "- Direction Mix (history): BUY={} SELL={} OTHER={} BUY_RATIO={:.2}%",
            history_mix.buy, history_mix.sell, history_mix.other, history_mix.buy_ratio_pct
        ),
        format!(
            "- Direction Mix (rule): BUY={} SELL={} OTHER={} BUY_RATIO={:.2}%",
            rule_mix.buy, rule_mix.sell, rule_mix.other, rule_mix.buy_ratio_pct
        ),
        format!(
            "- Buy Ratio Delta: `{:+.2}%`",
            rule_mix.buy_ratio_pct - history_mix.buy_ratio_pct
        ),
        format!(
            "- Timeframe dominant: history={} ({:.2}%), rule={} ({:.2}%)",
            history_dom.dominant,
            history_dom.dominant_ratio_pct,
            rule_dom.dominant,
            rule_dom.dominant_ratio_pct
        ),
        String::new(),
        "### Top Signal-Type Delta".into(),
        String::new(),
    ]);
    delta_table(&mut lines, "signal_type", &signal_type_delta_top);

    lines.extend([String::new(), "### Timeframe Delta".into(), String::new()]);
    delta_table(&mut lines, "timeframe", &timeframe_delta_top);

    lines.extend([String::new(), "### Direction Delta".into(), String::new()]);
    delta_table(&mut lines, "direction", &direction_delta);

    lines.extend([
        String::new(),
        "## Notes".into(),
        String::new(),
        "- `history` = backtest over the persisted signal stream".into(),
        "- `rule` = backtest over the offline rule-replay stream".into(),
        String::new(),
    ]);

    lines.join("\n")
}

/// Output of one comparison: both leg results plus the summary.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ComparisonOutcome {
    /// Side-by-side summary
    pub summary: ComparisonSummary,
    /// History leg result
    pub history: RunnerResult,
    /// Rule-replay leg result
    pub rule_replay: RunnerResult,
    /// Directory of the comparison artifacts, relative to the sink root
    pub compare_dir: String,
}

/// Run both modes on the identical window and write comparison artifacts.
///
/// Leg run directories are `{session}/{base}-history` and
/// `{session}/{base}-rules`; the comparison lands in
/// `{session}/{base}-compare`. A failing leg aborts the comparison.
pub async fn run_comparison(
    env: &RunnerEnv,
    config: &BacktestConfig,
    base_run_id: &str,
    session_dir: &str,
) -> Result<ComparisonOutcome> {
    let history = run_backtest(
        env,
        config,
        RunMode::HistorySignal,
        Some(&format!("{base_run_id}-history")),
        Some(&format!("{session_dir}/{base_run_id}-history")),
    )
    .await?;

    let rule_replay = run_backtest(
        env,
        config,
        RunMode::OfflineRuleReplay,
        Some(&format!("{base_run_id}-rules")),
        Some(&format!("{session_dir}/{base_run_id}-rules")),
    )
    .await?;

    let summary = build_comparison_summary(base_run_id, &history, &rule_replay);
    let generated_at = format_utc(env.clock.now());
    let compare_dir = format!("{session_dir}/{base_run_id}-compare");
    let files = vec![
        ArtifactFile {
            name: "comparison.json".to_string(),
            contents: render_comparison_json(
                &summary,
                rule_replay.rule_replay_stats.as_ref(),
                &generated_at,
            )?,
        },
        ArtifactFile {
            name: "comparison.md".to_string(),
            contents: render_comparison_md(
                &summary,
                rule_replay.rule_replay_stats.as_ref(),
                &generated_at,
            ),
        },
    ];
    env.artifact_sink
        .write_run_artifacts(&env.ctx, &compare_dir, &files)
        .await?;

    info!(
        history_return = summary.history_return_pct,
        rule_return = summary.rule_return_pct,
        "comparison completed"
    );
    Ok(ComparisonOutcome {
        summary,
        history,
        rule_replay,
        compare_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(entries: &[(&str, usize)]) -> IndexMap<String, usize> {
        entries
            .iter()
            .map(|(key, count)| (key.to_string(), *count))
            .collect()
    }

    #[test]
    fn test_counter_delta_sorted_by_abs() {
        let history = counter(&[("a", 10), ("b", 3), ("c", 1)]);
        let rule = counter(&[("a", 2), ("b", 3), ("d", 5)]);
        let rows = counter_delta(&history, &rule, 10);

        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[0].delta, -8);
        assert_eq!(rows[1].key, "d");
        assert_eq!(rows[1].delta, 5);
        // Zero-delta keys sort last, ties alphabetical
        assert_eq!(rows.last().unwrap().key, "b");
    }

    #[test]
    fn test_missing_and_new_rules() {
        let history = counter(&[("MACD_dead_cross", 10), ("shared", 2)]);
        let rule = counter(&[("shared", 4), ("RSI_new", 3)]);

        let missing = top_missing_history_rules(&history, &rule, 8);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].key, "MACD_dead_cross");
        assert_eq!(missing[0].delta, -10);

        let new = top_new_rule_types(&history, &rule, 8);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].key, "RSI_new");
        assert_eq!(new[0].delta, 3);
    }

    #[test]
    fn test_direction_mix() {
        let mix = direction_mix(&counter(&[("BUY", 6), ("SELL", 2), ("ALERT", 1)]));
        assert_eq!(mix.buy, 6);
        assert_eq!(mix.sell, 2);
        assert_eq!(mix.other, 1);
        assert_eq!(mix.total, 9);
        assert!((mix.buy_ratio_pct - 75.0).abs() < 1e-9);

        let empty = direction_mix(&IndexMap::new());
        assert_eq!(empty.buy_ratio_pct, 0.0);
    }

    #[test]
    fn test_rule_overlap_jaccard() {
        let history = counter(&[("a", 1), ("b", 1), ("c", 1)]);
        let rule = counter(&[("b", 1), ("c", 1), ("d", 1)]);
        let overlap = rule_overlap(&history, &rule);

        assert_eq!(overlap.shared_rule_types, 2);
        assert!((overlap.jaccard_pct - 50.0).abs() < 1e-9);
        assert!((overlap.history_coverage_pct - 2.0 / 3.0 * 100.0).abs() < 1e-9);
        assert!((overlap.rule_overlap_pct - 2.0 / 3.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeframe_dominance() {
        let dom = timeframe_dominance(&counter(&[("1m", 8), ("1h", 2)]));
        assert_eq!(dom.dominant, "1m");
        assert_eq!(dom.dominant_count, 8);
        assert!((dom.dominant_ratio_pct - 80.0).abs() < 1e-9);
        assert_eq!(dom.unique, 2);

        let empty = timeframe_dominance(&IndexMap::new());
        assert_eq!(empty.dominant, "--");
    }

    #[test]
    fn test_primary_block_reason_condition_failed() {
        // S6: history emitted the rule, replay evaluated 12 pairs and the
        // condition never held.
        let counter = RuleReplayCounter {
            evaluated: 12,
            condition_failed: 12,
            ..Default::default()
        };
        assert_eq!(primary_block_reason(&counter, None), "condition_failed");
    }

    #[test]
    fn test_primary_block_reason_timeframe_no_data() {
        let counter = RuleReplayCounter {
            evaluated: 20,
            timeframe_filtered: 20,
            ..Default::default()
        };
        let profile = RuleTimeframeProfile {
            configured_timeframes: vec!["4h".into()],
            observed_timeframes: vec!["1m".into()],
            overlap_timeframes: vec![],
        };
        assert_eq!(
            primary_block_reason(&counter, Some(&profile)),
            "timeframe_no_data"
        );

        // With overlap, fall through to the largest bucket
        let profile_with_overlap = RuleTimeframeProfile {
            configured_timeframes: vec!["1m".into()],
            observed_timeframes: vec!["1m".into()],
            overlap_timeframes: vec!["1m".into()],
        };
        assert_eq!(
            primary_block_reason(&counter, Some(&profile_with_overlap)),
            "timeframe_filtered"
        );
    }

    #[test]
    fn test_primary_block_reason_edge_cases() {
        let not_evaluated = RuleReplayCounter::default();
        assert_eq!(primary_block_reason(&not_evaluated, None), "not_evaluated");

        let unknown = RuleReplayCounter {
            evaluated: 5,
            ..Default::default()
        };
        assert_eq!(primary_block_reason(&unknown, None), "unknown");
    }

    #[test]
    fn test_missing_rule_diagnostics_payload() {
        let mut stats = RuleReplayStats::default();
        stats.rule_counters.insert(
            "MACD_dead_cross".into(),
            RuleReplayCounter {
                evaluated: 12,
                condition_failed: 12,
                ..Default::default()
            },
        );
        let missing = vec![DeltaRow {
            key: "MACD_dead_cross".into(),
            history_count: 10,
            rule_count: 0,
            delta: -10,
        }];

        let rows = missing_rule_diagnostics(&missing, Some(&stats));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["primary_block_reason"], "condition_failed");
        assert_eq!(rows[0]["history_count"], 10);
        assert_eq!(rows[0]["trigger_rate_pct"], 0.0);
    }

    fn summary_fixture() -> ComparisonSummary {
        ComparisonSummary {
            run_id: "cmp-1".into(),
            history_run_id: "cmp-1-history".into(),
            rule_run_id: "cmp-1-rules".into(),
            history_return_pct: 2.0,
            rule_return_pct: 1.0,
            history_max_drawdown_pct: 3.0,
            rule_max_drawdown_pct: 2.0,
            history_trade_count: 10,
            rule_trade_count: 8,
            history_excess_return_pct: 0.5,
            rule_excess_return_pct: -0.5,
            history_signal_count: 100,
            rule_signal_count: 80,
            history_bar_count: 1000,
            rule_bar_count: 1000,
            history_signal_type_counts: counter(&[("MACD_dead_cross", 10), ("shared", 5)]),
            rule_signal_type_counts: counter(&[("shared", 7)]),
            history_direction_counts: counter(&[("BUY", 60), ("SELL", 40)]),
            rule_direction_counts: counter(&[("BUY", 50), ("SELL", 30)]),
            history_timeframe_counts: counter(&[("1m", 100)]),
            rule_timeframe_counts: counter(&[("1m", 80)]),
        }
    }

    #[test]
    fn test_render_comparison_json() {
        let mut stats = RuleReplayStats::default();
        stats.rule_counters.insert(
            "MACD_dead_cross".into(),
            RuleReplayCounter {
                evaluated: 12,
                condition_failed: 12,
                ..Default::default()
            },
        );
        let text =
            render_comparison_json(&summary_fixture(), Some(&stats), "2026-01-01 00:00:00")
                .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["delta_return_pct"], -1.0);
        assert_eq!(value["delta_trade_count"], -2);
        assert_eq!(value["missing_history_rules_top"][0]["key"], "MACD_dead_cross");
        assert_eq!(
            value["missing_history_rules_diagnostics"][0]["primary_block_reason"],
            "condition_failed"
        );
        assert_eq!(value["timeframe_overlap"][0], "1m");
        assert!(value["rule_overlap"]["jaccard_pct"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_render_comparison_md_sections() {
        let text = render_comparison_md(&summary_fixture(), None, "2026-01-01 00:00:00");
        assert!(text.contains("# Backtest Mode Comparison"));
        assert!(text.contains("## Delta (rule - history)"));
        assert!(text.contains("### Missing in Rule Replay"));
        assert!(text.contains("MACD_dead_cross"));
        assert!(text.contains("### New in Rule Replay"));
        assert!(text.contains("## Signal Profile"));
        // No diagnostics section without replay stats
        assert!(!text.contains("### Missing Rule Diagnostics"));
    }
}
