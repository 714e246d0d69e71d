//! Declarative signal rules and their evaluator.
//!
//! A rule is data: a condition kind plus its parameters, evaluated against
//! consecutive `(prev, curr)` indicator-row pairs. Adding a condition kind
//! means adding a variant to [`ConditionKind`] and an arm to the evaluator —
//! there is no trait hierarchy to extend.
//!
//! # Example
//!
//! ```
//! use signal_bench::rules::{ConditionKind, RuleDirection, SignalRule};
//!
//! let rule = SignalRule::new(
//!     "MACD_golden_cross",
//!     "trend_indicators",
//!     RuleDirection::Buy,
//!     72,
//!     ConditionKind::CrossUp {
//!         field_a: "macd".into(),
//!         field_b: "macd_signal".into(),
//!     },
//! );
//! assert!(rule.enabled);
//! ```

mod row;

pub use row::{IndicatorRow, parse_numeric_text};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Rule direction; `Alert` rules are informational and never traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleDirection {
    /// Long intent
    Buy,
    /// Short intent
    Sell,
    /// Informational only; excluded from replay
    Alert,
}

/// User-supplied predicate for [`ConditionKind::Custom`].
///
/// Returns `Err` for evaluation failures; the caller logs with rate
/// limiting and treats the result as "did not fire".
#[derive(Clone)]
pub struct CustomPredicate(
    /// The predicate itself
    pub Arc<dyn Fn(Option<&IndicatorRow>, &IndicatorRow) -> Result<bool, String> + Send + Sync>,
);

impl std::fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomPredicate")
    }
}

fn default_match_any() -> bool {
    true
}

/// The condition grammar: eight generic kinds plus custom predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionKind {
    /// `prev[field] ∈ from_values ∧ curr[field] ∈ to_values`
    StateChange {
        /// Column holding the state label
        field: String,
        /// Accepted previous states
        from_values: Vec<String>,
        /// Accepted current states
        to_values: Vec<String>,
    },
    /// `prev ≤ threshold < curr`
    ThresholdCrossUp {
        /// Numeric column
        field: String,
        /// Crossing level
        threshold: f64,
    },
    /// `prev ≥ threshold > curr`
    ThresholdCrossDown {
        /// Numeric column
        field: String,
        /// Crossing level
        threshold: f64,
    },
    /// `prev_a ≤ prev_b ∧ curr_a > curr_b`
    CrossUp {
        /// Fast line column
        field_a: String,
        /// Slow line column
        field_b: String,
    },
    /// `prev_a ≥ prev_b ∧ curr_a < curr_b`
    CrossDown {
        /// Fast line column
        field_a: String,
        /// Slow line column
        field_b: String,
    },
    /// Substring containment over `curr[field]`; the only kind that does not
    /// require a previous row.
    Contains {
        /// Text column
        field: String,
        /// Patterns to look for
        patterns: Vec<String>,
        /// `true`: any pattern matches; `false`: all must match
        #[serde(default = "default_match_any")]
        match_any: bool,
    },
    /// `prev ∉ [min,max] ∧ curr ∈ [min,max]`
    RangeEnter {
        /// Numeric column
        field: String,
        /// Inclusive lower bound
        min_value: f64,
        /// Inclusive upper bound
        max_value: f64,
    },
    /// `prev ∈ [min,max] ∧ curr ∉ [min,max]`
    RangeExit {
        /// Numeric column
        field: String,
        /// Inclusive lower bound
        min_value: f64,
        /// Inclusive upper bound
        max_value: f64,
    },
    /// User-supplied pure predicate over `(prev, curr)`. Not serializable.
    #[serde(skip)]
    Custom(CustomPredicate),
}

/// Declarative signal rule. Pure data; no mutation after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRule {
    /// Unique rule name; doubles as the emitted `signal_type`
    pub name: String,
    /// Indicator table the rule reads
    pub table: String,
    /// Category label (momentum/trend/volatility/volume/…)
    pub category: String,
    /// Subcategory label (rsi/macd/kdj/…)
    pub subcategory: String,
    /// BUY, SELL, or ALERT
    pub direction: RuleDirection,
    /// Signal strength in `[1..100]`
    pub strength: i32,
    /// Priority label (reporting only)
    pub priority: String,
    /// Timeframes the rule applies to
    pub timeframes: Vec<String>,
    /// Minimum spacing between firings per `(rule, symbol, timeframe)`
    pub cooldown_s: u64,
    /// Minimum row volume; rows below are skipped when the column exists
    pub min_volume: f64,
    /// The condition to evaluate
    pub condition: ConditionKind,
    /// Disabled rules never fire
    pub enabled: bool,
}

impl Default for SignalRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            table: String::new(),
            category: "misc".into(),
            subcategory: String::new(),
            direction: RuleDirection::Alert,
            strength: 50,
            priority: "medium".into(),
            timeframes: vec!["1h".into(), "4h".into(), "1d".into()],
            cooldown_s: 3600,
            min_volume: 100_000.0,
            condition: ConditionKind::Contains {
                field: String::new(),
                patterns: vec![],
                match_any: true,
            },
            enabled: true,
        }
    }
}

/// Evaluation failure inside a rule; suppressed, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEvalError {
    /// Rule that failed
    pub rule: String,
    /// Failure description
    pub message: String,
}

impl SignalRule {
    /// Create a rule with the given essentials and defaults elsewhere.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        direction: RuleDirection,
        strength: i32,
        condition: ConditionKind,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            direction,
            strength,
            condition,
            ..Default::default()
        }
    }

    /// Evaluate the condition over a `(prev, curr)` row pair.
    ///
    /// Numeric comparisons against `NaN` are false, so missing or garbage
    /// cells silently fail the predicate rather than erroring. `Err` is
    /// reserved for custom predicates that report a failure.
    pub fn evaluate(
        &self,
        prev: Option<&IndicatorRow>,
        curr: &IndicatorRow,
    ) -> Result<bool, RuleEvalError> {
        if !self.enabled {
            return Ok(false);
        }

        let fired = match &self.condition {
            ConditionKind::StateChange {
                field,
                from_values,
                to_values,
            } => match prev {
                None => false,
                Some(prev) => {
                    from_values.contains(&prev.text(field)) && to_values.contains(&curr.text(field))
                }
            },
            ConditionKind::ThresholdCrossUp { field, threshold } => match prev {
                None => false,
                Some(prev) => {
                    let prev_val = prev.numeric(field);
                    let curr_val = curr.numeric(field);
                    prev_val <= *threshold && *threshold < curr_val
                }
            },
            ConditionKind::ThresholdCrossDown { field, threshold } => match prev {
                None => false,
                Some(prev) => {
                    let prev_val = prev.numeric(field);
                    let curr_val = curr.numeric(field);
                    prev_val >= *threshold && *threshold > curr_val
                }
            },
            ConditionKind::CrossUp { field_a, field_b } => match prev {
                None => false,
                Some(prev) => {
                    prev.numeric(field_a) <= prev.numeric(field_b)
                        && curr.numeric(field_a) > curr.numeric(field_b)
                }
            },
            ConditionKind::CrossDown { field_a, field_b } => match prev {
                None => false,
                Some(prev) => {
                    prev.numeric(field_a) >= prev.numeric(field_b)
                        && curr.numeric(field_a) < curr.numeric(field_b)
                }
            },
            ConditionKind::Contains {
                field,
                patterns,
                match_any,
            } => {
                let value = curr.text(field);
                if patterns.is_empty() {
                    false
                } else if *match_any {
                    patterns.iter().any(|p| value.contains(p.as_str()))
                } else {
                    patterns.iter().all(|p| value.contains(p.as_str()))
                }
            }
            ConditionKind::RangeEnter {
                field,
                min_value,
                max_value,
            } => match prev {
                None => false,
                Some(prev) => {
                    let prev_val = prev.numeric(field);
                    let curr_val = curr.numeric(field);
                    let prev_in = *min_value <= prev_val && prev_val <= *max_value;
                    let curr_in = *min_value <= curr_val && curr_val <= *max_value;
                    // NaN fails both membership tests, so a garbage prev
                    // cell reads as "outside the range".
                    !prev_in && curr_in && !prev_val.is_nan()
                }
            },
            ConditionKind::RangeExit {
                field,
                min_value,
                max_value,
            } => match prev {
                None => false,
                Some(prev) => {
                    let prev_val = prev.numeric(field);
                    let curr_val = curr.numeric(field);
                    let prev_in = *min_value <= prev_val && prev_val <= *max_value;
                    let curr_in = *min_value <= curr_val && curr_val <= *max_value;
                    prev_in && !curr_in && !curr_val.is_nan()
                }
            },
            ConditionKind::Custom(pred) => {
                (pred.0)(prev, curr).map_err(|message| RuleEvalError {
                    rule: self.name.clone(),
                    message,
                })?
            }
        };
        Ok(fired)
    }

    /// [`evaluate`](Self::evaluate) with failures coerced to `false`.
    pub fn check_condition(&self, prev: Option<&IndicatorRow>, curr: &IndicatorRow) -> bool {
        self.evaluate(prev, curr).unwrap_or(false)
    }
}

/// Rate-limited warning log for rule evaluation failures.
///
/// Logs the first `first_n` occurrences of each `(rule, message)` pair, then
/// every `every_n`-th when `every_n > 0`. Keeps noisy rules from flooding a
/// replay over millions of rows.
#[derive(Debug)]
pub struct EvalWarnLimiter {
    first_n: u64,
    every_n: u64,
    counts: Mutex<HashMap<(String, String), u64>>,
}

impl Default for EvalWarnLimiter {
    fn default() -> Self {
        Self::new(3, 0)
    }
}

impl EvalWarnLimiter {
    /// Create a limiter logging the first `first_n` then every `every_n`-th.
    pub fn new(first_n: u64, every_n: u64) -> Self {
        Self {
            first_n,
            every_n,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and emit a `warn!` when within the log budget.
    pub fn note(&self, err: &RuleEvalError) {
        let mut counts = self.counts.lock().expect("eval limiter poisoned");
        let count = counts
            .entry((err.rule.clone(), err.message.clone()))
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;
        drop(counts);

        let should_log =
            count <= self.first_n || (self.every_n > 0 && count % self.every_n == 0);
        if !should_log {
            return;
        }
        if count == 1 {
            warn!(rule = %err.rule, "rule evaluation failed: {}", err.message);
        } else {
            warn!(
                rule = %err.rule,
                same_error_count = count,
                "rule evaluation failed: {}",
                err.message
            );
        }
    }
}

/// Built-in rule catalog used by tests and the default CLI config.
///
/// Production deployments load their full rule set from JSON; these cover
/// the common momentum/trend tables with one rule per condition family.
pub fn builtin_rules() -> Vec<SignalRule> {
    vec![
        SignalRule {
            category: "momentum".into(),
            subcategory: "rsi".into(),
            cooldown_s: 1800,
            ..SignalRule::new(
                "RSI_oversold_rebound",
                "momentum_indicators",
                RuleDirection::Buy,
                74,
                ConditionKind::ThresholdCrossUp {
                    field: "rsi".into(),
                    threshold: 30.0,
                },
            )
        },
        SignalRule {
            category: "momentum".into(),
            subcategory: "rsi".into(),
            cooldown_s: 1800,
            ..SignalRule::new(
                "RSI_overbought_fade",
                "momentum_indicators",
                RuleDirection::Sell,
                74,
                ConditionKind::ThresholdCrossDown {
                    field: "rsi".into(),
                    threshold: 70.0,
                },
            )
        },
        SignalRule {
            category: "trend".into(),
            subcategory: "macd".into(),
            ..SignalRule::new(
                "MACD_golden_cross",
                "trend_indicators",
                RuleDirection::Buy,
                78,
                ConditionKind::CrossUp {
                    field_a: "macd".into(),
                    field_b: "macd_signal".into(),
                },
            )
        },
        SignalRule {
            category: "trend".into(),
            subcategory: "macd".into(),
            ..SignalRule::new(
                "MACD_dead_cross",
                "trend_indicators",
                RuleDirection::Sell,
                78,
                ConditionKind::CrossDown {
                    field_a: "macd".into(),
                    field_b: "macd_signal".into(),
                },
            )
        },
        SignalRule {
            category: "momentum".into(),
            subcategory: "kdj".into(),
            ..SignalRule::new(
                "KDJ_bull_flip",
                "momentum_indicators",
                RuleDirection::Buy,
                66,
                ConditionKind::StateChange {
                    field: "kdj_state".into(),
                    from_values: vec!["bear".into(), "neutral".into()],
                    to_values: vec!["bull".into()],
                },
            )
        },
        SignalRule {
            category: "volatility".into(),
            subcategory: "boll".into(),
            ..SignalRule::new(
                "BOLL_band_reentry",
                "volatility_indicators",
                RuleDirection::Buy,
                62,
                ConditionKind::RangeEnter {
                    field: "percent_b".into(),
                    min_value: 0.0,
                    max_value: 1.0,
                },
            )
        },
        SignalRule {
            category: "pattern".into(),
            subcategory: "candle".into(),
            min_volume: 0.0,
            ..SignalRule::new(
                "Pattern_bullish_engulfing",
                "pattern_signals",
                RuleDirection::Buy,
                58,
                ConditionKind::Contains {
                    field: "pattern".into(),
                    patterns: vec!["bullish_engulfing".into()],
                    match_any: true,
                },
            )
        },
    ]
}
