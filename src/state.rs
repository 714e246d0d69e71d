//! Externally visible run-state lifecycle.
//!
//! Dashboards poll `run_state.json` while a backtest runs, so writes go
//! through a tmpfile + rename and a reader can never observe a torn
//! document. A missing or corrupt file reads as the idle default.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::RunStateSink;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run has started
    #[default]
    Idle,
    /// A run is executing; `stage` names the step
    Running,
    /// The last run completed
    Done,
    /// The last run failed; `error` carries the reason
    Error,
}

/// Current backtest run state persisted to `run_state.json`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    /// Lifecycle status
    pub status: RunStatus,
    /// Current (or failing) stage name
    pub stage: String,
    /// Run identifier
    pub run_id: String,
    /// Run mode label
    pub mode: String,
    /// First write instant for this run_id, canonical UTC text
    pub started_at: String,
    /// Last write instant, canonical UTC text
    pub updated_at: String,
    /// Completion instant; `None` while running
    pub finished_at: Option<String>,
    /// Most recent successfully completed run
    pub latest_run_id: Option<String>,
    /// Human-readable progress message
    pub message: String,
    /// Error text when `status == Error`
    pub error: Option<String>,
}

fn carry_started_at(prev: &RunState, run_id: &str, now_txt: &str) -> String {
    if prev.run_id == run_id && !prev.started_at.is_empty() {
        prev.started_at.clone()
    } else {
        now_txt.to_string()
    }
}

/// Build the running-state document for a stage transition.
pub fn running_state(
    prev: &RunState,
    run_id: &str,
    mode: &str,
    stage: &str,
    message: &str,
    now_txt: &str,
) -> RunState {
    RunState {
        status: RunStatus::Running,
        stage: stage.to_string(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        started_at: carry_started_at(prev, run_id, now_txt),
        updated_at: now_txt.to_string(),
        finished_at: None,
        latest_run_id: prev.latest_run_id.clone(),
        message: message.to_string(),
        error: None,
    }
}

/// Build the done-state document.
pub fn done_state(
    prev: &RunState,
    run_id: &str,
    mode: &str,
    latest_run_id: &str,
    message: &str,
    now_txt: &str,
) -> RunState {
    RunState {
        status: RunStatus::Done,
        stage: "done".to_string(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        started_at: carry_started_at(prev, run_id, now_txt),
        updated_at: now_txt.to_string(),
        finished_at: Some(now_txt.to_string()),
        latest_run_id: Some(latest_run_id.to_string()),
        message: message.to_string(),
        error: None,
    }
}

/// Build the error-state document, preserving the failing stage.
pub fn error_state(
    prev: &RunState,
    run_id: &str,
    mode: &str,
    stage: &str,
    error: &str,
    message: &str,
    now_txt: &str,
) -> RunState {
    RunState {
        status: RunStatus::Error,
        stage: stage.to_string(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        started_at: carry_started_at(prev, run_id, now_txt),
        updated_at: now_txt.to_string(),
        finished_at: Some(now_txt.to_string()),
        latest_run_id: prev.latest_run_id.clone(),
        message: message.to_string(),
        error: Some(if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error.to_string()
        }),
    }
}

/// Filesystem-backed run-state sink with atomic replace.
#[derive(Debug, Clone)]
pub struct FsRunStateSink {
    path: PathBuf,
}

impl FsRunStateSink {
    /// Sink writing to `path` (conventionally
    /// `artifacts/backtest/run_state.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_sync(&self) -> RunState {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return RunState::default();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    fn write_sync(&self, state: &RunState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run_state.json".to_string());
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl RunStateSink for FsRunStateSink {
    async fn read(&self) -> RunState {
        self.read_sync()
    }

    async fn write(&self, state: &RunState) -> Result<()> {
        self.write_sync(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(dir: &tempfile::TempDir) -> FsRunStateSink {
        FsRunStateSink::new(dir.path().join("run_state.json"))
    }

    #[tokio::test]
    async fn test_missing_file_reads_idle() {
        let dir = tempfile::tempdir().unwrap();
        let state = sink(&dir).read().await;
        assert_eq!(state.status, RunStatus::Idle);
        assert!(state.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_idle() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(&dir);
        std::fs::write(dir.path().join("run_state.json"), "{ not json").unwrap();
        assert_eq!(s.read().await.status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(&dir);
        let prev = s.read().await;
        let state = running_state(
            &prev,
            "run-1",
            "history_signal",
            "loading_candles",
            "loading candles",
            "2026-01-01 00:00:00",
        );
        s.write(&state).await.unwrap();

        let back = s.read().await;
        assert_eq!(back.status, RunStatus::Running);
        assert_eq!(back.stage, "loading_candles");
        assert_eq!(back.started_at, "2026-01-01 00:00:00");
    }

    #[tokio::test]
    async fn test_started_at_preserved_across_stages() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(&dir);

        let first = running_state(
            &s.read().await,
            "run-1",
            "history_signal",
            "loading_signals",
            "",
            "2026-01-01 00:00:00",
        );
        s.write(&first).await.unwrap();

        let second = running_state(
            &s.read().await,
            "run-1",
            "history_signal",
            "executing",
            "",
            "2026-01-01 00:05:00",
        );
        s.write(&second).await.unwrap();

        let state = s.read().await;
        assert_eq!(state.started_at, "2026-01-01 00:00:00");
        assert_eq!(state.updated_at, "2026-01-01 00:05:00");

        // A different run restarts the clock
        let other = running_state(
            &s.read().await,
            "run-2",
            "history_signal",
            "loading_signals",
            "",
            "2026-01-01 01:00:00",
        );
        assert_eq!(other.started_at, "2026-01-01 01:00:00");
    }

    #[tokio::test]
    async fn test_done_and_error_states() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(&dir);

        let done = done_state(
            &s.read().await,
            "run-1",
            "offline_replay",
            "run-1",
            "completed trades=4",
            "2026-01-01 00:10:00",
        );
        s.write(&done).await.unwrap();
        let state = s.read().await;
        assert_eq!(state.status, RunStatus::Done);
        assert_eq!(state.latest_run_id.as_deref(), Some("run-1"));
        assert!(state.error.is_none());

        // Error on a later run keeps latest_run_id pointing at the last success
        let err = error_state(
            &s.read().await,
            "run-2",
            "offline_replay",
            "executing",
            "RuntimeError: boom",
            "backtest failed",
            "2026-01-01 00:20:00",
        );
        s.write(&err).await.unwrap();
        let state = s.read().await;
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.stage, "executing");
        assert_eq!(state.latest_run_id.as_deref(), Some("run-1"));
        assert_eq!(state.error.as_deref(), Some("RuntimeError: boom"));
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(&dir);
        s.write(&RunState::default()).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
