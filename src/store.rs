//! External storage interfaces, run context, retry policy, and rate limiting.
//!
//! The core never opens a database or a socket. Candles, signals, indicator
//! rows, artifacts, and run state all flow through the traits in this
//! module; the CLI (or a service embedding the crate) supplies concrete
//! implementations. Every store call takes a [`RunContext`] so long
//! operations honor deadlines and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{BacktestError, Result};
use crate::models::{Bar, SignalRecord};
use crate::rules::IndicatorRow;
use crate::state::RunState;

// ── Run context ──────────────────────────────────────────────────────────────

/// Deadline and cancellation scope for one run.
///
/// Cheap to clone; all clones share the cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RunContext {
    /// Context with no deadline.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Context that expires `budget` from now.
    pub fn with_timeout(budget: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + budget),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation; observed at the next [`check`](Self::check).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Remaining budget, if a deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Error when the context is done; stages call this between steps.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(BacktestError::aborted(stage, "cancelled"));
        }
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            return Err(BacktestError::aborted(stage, "deadline exceeded"));
        }
        Ok(())
    }
}

// ── Store traits ─────────────────────────────────────────────────────────────

/// OHLCV bar storage.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Load bars grouped by symbol for `[start, end]` at `timeframe`.
    /// Implementations return bars sorted by timestamp per symbol.
    async fn load_bars(
        &self,
        ctx: &RunContext,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: &str,
    ) -> Result<HashMap<String, Vec<Bar>>>;
}

/// Persisted signal-history storage.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Load raw signal rows in `[start, end]`, ordered `(timestamp, id)`.
    ///
    /// Symbol/timeframe filtering and direction/strength coercion happen in
    /// the history source, not here; implementations may pre-filter by
    /// symbol as an optimization but must not reorder.
    async fn load_signals(
        &self,
        ctx: &RunContext,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: &str,
    ) -> Result<Vec<SignalRecord>>;
}

/// Indicator-table storage for rule replay.
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    /// Load rows of `table` in `[start, end]`, ordered
    /// `(symbol, timeframe, ts, rowid)`.
    async fn load_rows(
        &self,
        ctx: &RunContext,
        table: &str,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IndicatorRow>>;

    /// Tables this store can serve; rule replay skips the rest.
    async fn tables(&self, ctx: &RunContext) -> Result<Vec<String>>;
}

/// One rendered artifact file (name relative to the run directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// File name, e.g. `metrics.json`
    pub name: String,
    /// Rendered contents
    pub contents: String,
}

/// Destination for run artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Write the rendered files under `run_dir` (relative to the sink root).
    async fn write_run_artifacts(
        &self,
        ctx: &RunContext,
        run_dir: &str,
        files: &[ArtifactFile],
    ) -> Result<()>;
}

/// Destination for the externally visible run state.
#[async_trait]
pub trait RunStateSink: Send + Sync {
    /// Current state; defaults when nothing was written yet.
    async fn read(&self) -> RunState;
    /// Persist `state` atomically — a reader never sees a torn document.
    async fn write(&self, state: &RunState) -> Result<()>;
}

/// Time source; injectable so runs are reproducible in tests.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(
    /// The instant every `now()` call returns
    pub DateTime<Utc>,
);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────────

/// Whether an HTTP-ish status code marks a transient fault.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || (500..=599).contains(&status)
}

/// Bounded retry with exponential backoff, applied only to retryable
/// store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts (>= 1)
    pub attempts: u32,
    /// Base delay; doubled per attempt
    pub backoff_base: Duration,
    /// Delay ceiling
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based):
    /// `min(backoff_max, backoff_base * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Run `op`, retrying transient failures up to the attempt budget.
    ///
    /// Non-retryable errors and context expiry surface immediately.
    pub async fn run<T, F, Fut>(&self, ctx: &RunContext, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            ctx.check(op_name)?;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient store error: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| BacktestError::store_fatal(op_name, "retry budget empty")))
    }
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

struct TokenState {
    available: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

/// Token-bucket rate limiter for provider fan-out.
///
/// Tokens refill at `rate_per_s` up to `burst`; one token is consumed per
/// request. [`acquire`](Self::acquire) sleeps until a token is available;
/// [`acquire_within`](Self::acquire_within) gives up after a wait budget.
pub struct RateLimiter {
    state: Mutex<TokenState>,
}

impl RateLimiter {
    /// Create a limiter allowing `rate_per_s` sustained with `burst` capacity.
    ///
    /// The bucket holds at least one token so acquisition always makes
    /// progress, even for sub-1/sec rates.
    pub fn new(rate_per_s: f64, burst: f64) -> Self {
        let max_tokens = burst.max(1.0);
        Self {
            state: Mutex::new(TokenState {
                available: max_tokens,
                last_refill: Instant::now(),
                max_tokens,
                refill_rate: rate_per_s.max(f64::MIN_POSITIVE),
            }),
        }
    }

    async fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * state.refill_rate).min(state.max_tokens);
        state.last_refill = now;

        if state.available >= 1.0 {
            state.available -= 1.0;
            return None;
        }
        let deficit = 1.0 - state.available;
        Some(Duration::from_secs_f64(deficit / state.refill_rate))
    }

    /// Acquire a token, sleeping as long as necessary.
    pub async fn acquire(&self) {
        loop {
            match self.try_take().await {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Acquire a token, waiting at most `budget`.
    ///
    /// Fails with a retryable store error when the budget is exhausted —
    /// the caller's retry policy decides whether to try again later.
    pub async fn acquire_within(&self, budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            match self.try_take().await {
                None => return Ok(()),
                Some(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(BacktestError::store_retryable(
                            "rate_limiter.acquire",
                            format!("token wait exceeds budget of {budget:?}"),
                        ));
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
