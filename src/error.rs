//! Error types for backtest operations.

use thiserror::Error;

/// Main error type for the backtest core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BacktestError {
    /// Invalid configuration parameter. Fails fast before any work.
    #[error("Invalid parameter '{param}': {reason}")]
    InvalidParameter {
        /// Parameter name
        param: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Input coverage below configured thresholds.
    ///
    /// Blocks the run unless forced. Maps to exit code 2 at the CLI.
    #[error("Precheck failed: {}", failures.join("; "))]
    PrecheckFailed {
        /// Individual guard failures, human readable
        failures: Vec<String>,
    },

    /// Insufficient data for the requested operation
    #[error("Insufficient data: need at least {need} bars, got {got}")]
    InsufficientData {
        /// Minimum required bars
        need: usize,
        /// Actual bars provided
        got: usize,
    },

    /// Store I/O failure.
    ///
    /// `retryable` distinguishes transient faults (connect/timeout/429/5xx)
    /// from permanent ones; the retry policy only re-attempts the former.
    #[error("Store error ({op}): {message}")]
    Store {
        /// Operation that failed (e.g. `load_bars`)
        op: String,
        /// Underlying error text
        message: String,
        /// Whether a retry may succeed
        retryable: bool,
    },

    /// Durable cooldown write failed; the pending signal was suppressed.
    #[error("Cooldown persist failed for '{key}': {message}")]
    CooldownPersist {
        /// Cooldown key `rule|symbol|timeframe`
        key: String,
        /// Underlying error text
        message: String,
    },

    /// A runner stage failed; carries the stage for run-state reporting.
    #[error("Run aborted in stage '{stage}': {message}")]
    Aborted {
        /// Stage that was executing when the error surfaced
        stage: String,
        /// Error description
        message: String,
    },

    /// I/O error while writing artifacts or state
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for backtest operations
pub type Result<T> = std::result::Result<T, BacktestError>;

impl BacktestError {
    /// Create an invalid parameter error
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Create a precheck failure from collected guard messages
    pub fn precheck(failures: Vec<String>) -> Self {
        Self::PrecheckFailed { failures }
    }

    /// Create an insufficient data error
    pub fn insufficient_data(need: usize, got: usize) -> Self {
        Self::InsufficientData { need, got }
    }

    /// Create a retryable store error
    pub fn store_retryable(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            op: op.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable store error
    pub fn store_fatal(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            op: op.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Create an aborted-run error tagged with the failing stage
    pub fn aborted(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Aborted {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether a retry of the failing operation may succeed.
    ///
    /// Only [`BacktestError::Store`] can be retryable; everything else is
    /// deterministic and retrying would just repeat the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { retryable: true, .. })
    }

    /// Process exit code for the CLI: 2 for precheck failures, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PrecheckFailed { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_param_error() {
        let err = BacktestError::invalid_param("initial_equity", "must be positive");
        assert!(err.to_string().contains("initial_equity"));
        assert!(err.to_string().contains("must be positive"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_precheck_exit_code() {
        let err = BacktestError::precheck(vec!["signal count too low: 3 < 200".into()]);
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("signal count too low"));
    }

    #[test]
    fn test_store_retryability() {
        assert!(BacktestError::store_retryable("load_bars", "connect timeout").is_retryable());
        assert!(!BacktestError::store_fatal("load_bars", "table missing").is_retryable());
        assert!(!BacktestError::invalid_param("x", "y").is_retryable());
    }

    #[test]
    fn test_aborted_carries_stage() {
        let err = BacktestError::aborted("executing", "boom");
        assert!(err.to_string().contains("executing"));
        assert!(err.to_string().contains("boom"));
    }
}
