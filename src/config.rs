//! Backtest configuration: nested config model, file loading with
//! `_moved_to` redirects, CLI overrides, and validation.
//!
//! Config files are nested JSON maps. Unknown keys are merged through and
//! ignored so older configs keep loading; a top-level `_moved_to` key
//! redirects to another file (old template paths stay valid as stubs).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BacktestError, Result};

/// Backtest date range, canonical UTC text or empty for defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    /// Window start (empty: end − 90 days)
    #[serde(default)]
    pub start: String,
    /// Window end (empty: now)
    #[serde(default)]
    pub end: String,
}

/// Trade execution knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Slippage in basis points applied to every fill
    pub slippage_bps: f64,
    /// Fee in basis points per side
    pub fee_bps: f64,
    /// Enable long entries
    pub allow_long: bool,
    /// Enable short entries
    pub allow_short: bool,
    /// Do not neutral-close before holding at least this many minutes
    pub min_hold_minutes: u32,
    /// Consecutive neutral buckets required before a neutral close
    pub neutral_confirm_minutes: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 3.0,
            // Aligned to Binance USD-M futures VIP0 taker (0.04% per side).
            fee_bps: 4.0,
            allow_long: true,
            allow_short: true,
            min_hold_minutes: 0,
            neutral_confirm_minutes: 1,
        }
    }
}

/// Risk model knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Leverage multiplier (>= 1)
    pub leverage: f64,
    /// Starting equity
    pub initial_equity: f64,
    /// Fraction of equity committed per entry, in `(0, 1]`
    pub position_size_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            leverage: 2.0,
            initial_equity: 10_000.0,
            position_size_pct: 0.25,
        }
    }
}

/// Signal-score aggregation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Open a long when the net score reaches this value
    pub long_open_threshold: i32,
    /// Open a short when the net score reaches minus this value
    pub short_open_threshold: i32,
    /// Scores below this magnitude count as neutral
    pub close_threshold: i32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            long_open_threshold: 70,
            short_open_threshold: 70,
            close_threshold: 20,
        }
    }
}

/// Walk-forward window spans in days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    /// Train region length (reserved for future parameter tuning)
    pub train_days: u32,
    /// Test region length
    pub test_days: u32,
    /// Slide between folds
    pub step_days: u32,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_days: 45,
            test_days: 15,
            step_days: 15,
        }
    }
}

/// Run retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Number of newest run directories to keep
    pub keep_runs: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep_runs: 30 }
    }
}

/// Top-level config passed into the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Market label (reporting only)
    pub market: String,
    /// Symbols in scope (uppercase, alphanumeric)
    pub symbols: Vec<String>,
    /// Base timeframe label
    pub timeframe: String,
    /// Optional strategy label for reporting
    pub strategy_label: String,
    /// Optional source path of the strategy config
    pub strategy_config_path: String,
    /// Backtest window
    pub date_range: DateRange,
    /// Execution knobs
    pub execution: ExecutionConfig,
    /// Risk knobs
    pub risk: RiskConfig,
    /// Aggregation thresholds
    pub aggregation: AggregationConfig,
    /// Walk-forward spans
    pub walk_forward: WalkForwardConfig,
    /// Retention policy
    pub retention: RetentionConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            market: "crypto".into(),
            symbols: vec![
                "BTCUSDT".into(),
                "ETHUSDT".into(),
                "SOLUSDT".into(),
                "BNBUSDT".into(),
            ],
            timeframe: "1m".into(),
            strategy_label: String::new(),
            strategy_config_path: String::new(),
            date_range: DateRange::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            aggregation: AggregationConfig::default(),
            walk_forward: WalkForwardConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl BacktestConfig {
    /// Validate parameter ranges. Fails fast before any work.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(BacktestError::invalid_param(
                "symbols",
                "at least one symbol is required",
            ));
        }
        if self.risk.initial_equity <= 0.0 {
            return Err(BacktestError::invalid_param(
                "risk.initial_equity",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.position_size_pct) || self.risk.position_size_pct == 0.0
        {
            return Err(BacktestError::invalid_param(
                "risk.position_size_pct",
                "must be in (0, 1]",
            ));
        }
        if self.risk.leverage < 1.0 {
            return Err(BacktestError::invalid_param(
                "risk.leverage",
                "must be >= 1",
            ));
        }
        if self.execution.fee_bps < 0.0 || self.execution.slippage_bps < 0.0 {
            return Err(BacktestError::invalid_param(
                "execution",
                "fee_bps and slippage_bps must be >= 0",
            ));
        }
        if self.aggregation.long_open_threshold <= 0 || self.aggregation.short_open_threshold <= 0 {
            return Err(BacktestError::invalid_param(
                "aggregation",
                "open thresholds must be > 0",
            ));
        }
        if self.aggregation.close_threshold < 0 {
            return Err(BacktestError::invalid_param(
                "aggregation.close_threshold",
                "must be >= 0",
            ));
        }
        if self.retention.keep_runs < 1 {
            return Err(BacktestError::invalid_param(
                "retention.keep_runs",
                "must be >= 1",
            ));
        }
        let wf = &self.walk_forward;
        if wf.train_days < 1 || wf.test_days < 1 || wf.step_days < 1 {
            return Err(BacktestError::invalid_param(
                "walk_forward",
                "train/test/step days must be >= 1",
            ));
        }
        Ok(())
    }

    /// One-line strategy summary for reports (sides, thresholds, costs).
    pub fn strategy_summary(&self) -> String {
        let side = match (self.execution.allow_long, self.execution.allow_short) {
            (true, true) => "long_short",
            (false, true) => "short_only",
            (true, false) => "long_only",
            (false, false) => "disabled",
        };
        format!(
            "side={side} L/S/C={}/{}/{} fee={:.1}bps slip={:.1}bps hold>={}m neutral={}m",
            self.aggregation.long_open_threshold,
            self.aggregation.short_open_threshold,
            self.aggregation.close_threshold,
            self.execution.fee_bps,
            self.execution.slippage_bps,
            self.execution.min_hold_minutes,
            self.execution.neutral_confirm_minutes,
        )
    }
}

/// CLI overrides applied on top of the loaded config file.
///
/// Every field is optional; `None` leaves the file/default value in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Override `date_range.start`
    pub start: Option<String>,
    /// Override `date_range.end`
    pub end: Option<String>,
    /// Override `symbols` (comma-separated)
    pub symbols: Option<String>,
    /// Override `execution.fee_bps`
    pub fee_bps: Option<f64>,
    /// Override `execution.slippage_bps`
    pub slippage_bps: Option<f64>,
    /// Override `execution.allow_long`
    pub allow_long: Option<bool>,
    /// Override `execution.allow_short`
    pub allow_short: Option<bool>,
    /// Override `execution.min_hold_minutes`
    pub min_hold_minutes: Option<u32>,
    /// Override `execution.neutral_confirm_minutes`
    pub neutral_confirm_minutes: Option<u32>,
    /// Override `risk.initial_equity`
    pub initial_equity: Option<f64>,
    /// Override `risk.leverage`
    pub leverage: Option<f64>,
    /// Override `risk.position_size_pct`
    pub position_size_pct: Option<f64>,
    /// Override `walk_forward.train_days`
    pub wf_train_days: Option<u32>,
    /// Override `walk_forward.test_days`
    pub wf_test_days: Option<u32>,
    /// Override `walk_forward.step_days`
    pub wf_step_days: Option<u32>,
    /// Override `aggregation.long_open_threshold`
    pub long_open_threshold: Option<i32>,
    /// Override `aggregation.short_open_threshold`
    pub short_open_threshold: Option<i32>,
    /// Override `aggregation.close_threshold`
    pub close_threshold: Option<i32>,
}

/// Normalize a symbol list: uppercase, alphanumeric only, deduplicated.
pub fn normalize_symbols<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let norm: String = item
            .as_ref()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        if !norm.is_empty() && seen.insert(norm.clone()) {
            out.push(norm);
        }
    }
    out
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, val) in src_map {
                match dst_map.get_mut(&key) {
                    Some(slot) if slot.is_object() && val.is_object() => deep_merge(slot, val),
                    _ => {
                        dst_map.insert(key, val);
                    }
                }
            }
        }
        (dst_slot, src_val) => *dst_slot = src_val,
    }
}

/// Load a config payload, following `_moved_to` redirects up to `max_hops`.
fn load_payload_with_redirect(cfg_path: &Path, max_hops: usize) -> Result<Value> {
    let mut cur = cfg_path.to_path_buf();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    for _ in 0..max_hops.max(1) {
        let resolved = cur.canonicalize().unwrap_or_else(|_| cur.clone());
        if !visited.insert(resolved.clone()) {
            return Err(BacktestError::invalid_param(
                "config",
                format!("redirect loop detected at {}", resolved.display()),
            ));
        }

        let text = std::fs::read_to_string(&resolved)?;
        let mut payload: Value = serde_json::from_str(&text)?;
        let map = payload.as_object_mut().ok_or_else(|| {
            BacktestError::invalid_param(
                "config",
                format!("root must be an object: {}", resolved.display()),
            )
        })?;

        if let Some(Value::String(target)) = map.get("_moved_to") {
            let target = target.trim().to_string();
            if !target.is_empty() {
                let parent = resolved.parent().unwrap_or_else(|| Path::new("."));
                cur = parent.join(target);
                continue;
            }
        }
        map.remove("_moved_to");
        return Ok(payload);
    }

    Err(BacktestError::invalid_param(
        "config",
        format!("redirect too deep (> {max_hops}): {}", cfg_path.display()),
    ))
}

/// Load configuration from an optional file and apply CLI overrides.
///
/// Merge order: built-in defaults ← file payload ← overrides. Unknown file
/// keys are ignored. The result is validated before it is returned.
pub fn load_config(path: Option<&Path>, overrides: &CliOverrides) -> Result<BacktestConfig> {
    let mut merged = serde_json::to_value(BacktestConfig::default())?;

    let mut cfg_path: Option<PathBuf> = None;
    if let Some(path) = path {
        let payload = load_payload_with_redirect(path, 5)?;
        deep_merge(&mut merged, payload);
        cfg_path = Some(path.to_path_buf());
    }

    let mut cfg: BacktestConfig = serde_json::from_value(merged)?;
    cfg.symbols = normalize_symbols(&cfg.symbols);

    if let Some(symbols) = &overrides.symbols {
        let parsed = normalize_symbols(symbols.split(','));
        if !parsed.is_empty() {
            cfg.symbols = parsed;
        }
    }
    if let Some(start) = &overrides.start {
        cfg.date_range.start = start.trim().to_string();
    }
    if let Some(end) = &overrides.end {
        cfg.date_range.end = end.trim().to_string();
    }
    if let Some(v) = overrides.fee_bps {
        cfg.execution.fee_bps = v;
    }
    if let Some(v) = overrides.slippage_bps {
        cfg.execution.slippage_bps = v;
    }
    if let Some(v) = overrides.allow_long {
        cfg.execution.allow_long = v;
    }
    if let Some(v) = overrides.allow_short {
        cfg.execution.allow_short = v;
    }
    if let Some(v) = overrides.min_hold_minutes {
        cfg.execution.min_hold_minutes = v;
    }
    if let Some(v) = overrides.neutral_confirm_minutes {
        cfg.execution.neutral_confirm_minutes = v.max(1);
    }
    if let Some(v) = overrides.initial_equity {
        cfg.risk.initial_equity = v;
    }
    if let Some(v) = overrides.leverage {
        cfg.risk.leverage = v;
    }
    if let Some(v) = overrides.position_size_pct {
        cfg.risk.position_size_pct = v;
    }
    if let Some(v) = overrides.wf_train_days {
        cfg.walk_forward.train_days = v;
    }
    if let Some(v) = overrides.wf_test_days {
        cfg.walk_forward.test_days = v;
    }
    if let Some(v) = overrides.wf_step_days {
        cfg.walk_forward.step_days = v;
    }
    if let Some(v) = overrides.long_open_threshold {
        cfg.aggregation.long_open_threshold = v;
    }
    if let Some(v) = overrides.short_open_threshold {
        cfg.aggregation.short_open_threshold = v;
    }
    if let Some(v) = overrides.close_threshold {
        cfg.aggregation.close_threshold = v;
    }

    if let Some(cfg_path) = cfg_path {
        if cfg.strategy_config_path.is_empty() {
            cfg.strategy_config_path = cfg_path.display().to_string();
        }
        if cfg.strategy_label.is_empty() {
            cfg.strategy_label = cfg_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = BacktestConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.aggregation.long_open_threshold, 70);
        assert_eq!(cfg.execution.fee_bps, 4.0);
    }

    #[test]
    fn test_normalize_symbols() {
        let out = normalize_symbols(["btcusdt", " eth-usdt ", "BTCUSDT", ""]);
        assert_eq!(out, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = BacktestConfig::default();
        cfg.risk.position_size_pct = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = BacktestConfig::default();
        cfg.retention.keep_runs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BacktestConfig::default();
        cfg.aggregation.long_open_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_strategy_summary() {
        let mut cfg = BacktestConfig::default();
        cfg.execution.allow_short = false;
        let summary = cfg.strategy_summary();
        assert!(summary.contains("side=long_only"));
        assert!(summary.contains("L/S/C=70/70/20"));
    }

    #[test]
    fn test_load_config_merges_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.crypto.json");
        std::fs::write(
            &path,
            r#"{
                "symbols": ["btcusdt", "ethusdt"],
                "execution": {"fee_bps": 2.0, "unknown_key": true},
                "future_section": {"ignored": 1}
            }"#,
        )
        .unwrap();

        let overrides = CliOverrides {
            slippage_bps: Some(1.5),
            ..Default::default()
        };
        let cfg = load_config(Some(&path), &overrides).unwrap();

        assert_eq!(cfg.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(cfg.execution.fee_bps, 2.0); // from file
        assert_eq!(cfg.execution.slippage_bps, 1.5); // from CLI
        assert_eq!(cfg.risk.leverage, 2.0); // default preserved
        assert_eq!(cfg.strategy_label, "default.crypto");
    }

    #[test]
    fn test_moved_to_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("strategies");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(
            real.join("crypto.json"),
            r#"{"timeframe": "5m"}"#,
        )
        .unwrap();
        let stub = dir.path().join("old.json");
        std::fs::write(&stub, r#"{"_moved_to": "strategies/crypto.json"}"#).unwrap();

        let cfg = load_config(Some(&stub), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.timeframe, "5m");
    }

    #[test]
    fn test_moved_to_loop_detected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"_moved_to": "b.json"}"#).unwrap();
        std::fs::write(&b, r#"{"_moved_to": "a.json"}"#).unwrap();

        assert!(load_config(Some(&a), &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_symbol_override_wins() {
        let overrides = CliOverrides {
            symbols: Some("solusdt, bnbusdt".into()),
            ..Default::default()
        };
        let cfg = load_config(None, &overrides).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT".to_string(), "BNBUSDT".to_string()]);
    }
}
