//! Run-directory retention and the `latest` pointer.
//!
//! `latest` is re-pointed only after a run's artifacts are fully written,
//! and the cleanup pass never touches it. Failed or cancelled runs leave
//! their partial directories in place; they age out through this pass after
//! a later successful run.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::Result;

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(_) => Ok(()),
        Ok(meta) => {
            if meta.file_type().is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            }
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Point `latest` at `run_dir` (relative symlink preferred, copy fallback).
///
/// A relative link keeps the artifact tree movable; on filesystems without
/// symlink support the run directory is copied instead.
pub fn update_latest(backtest_root: &Path, run_dir: &Path) -> Result<PathBuf> {
    let latest = backtest_root.join("latest");
    remove_path(&latest)?;

    let target = pathdiff(run_dir, backtest_root);
    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(&target, &latest).is_ok();
    #[cfg(not(unix))]
    let linked = false;

    if !linked {
        warn!("symlink unavailable; copying run directory to latest");
        copy_dir_recursive(run_dir, &latest)?;
    }
    debug!(latest = %latest.display(), target = %target.display(), "updated latest pointer");
    Ok(latest)
}

/// Relative path from `base` to `path`, falling back to `path` as-is.
fn pathdiff(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Keep the newest `keep_runs` run directories under `backtest_root`.
///
/// Run directory names are UTC timestamps, so the primary order is the
/// lexicographic name (newest last); the filesystem mtime breaks ties.
/// `latest` is never a candidate. Returns the removed names.
pub fn cleanup_old_runs(backtest_root: &Path, keep_runs: usize) -> Result<Vec<String>> {
    let keep = keep_runs.max(1);
    let Ok(entries) = std::fs::read_dir(backtest_root) else {
        return Ok(Vec::new());
    };

    let mut runs: Vec<(String, SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "latest" {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        runs.push((name, mtime));
    }

    // Newest first: name desc, mtime desc as tiebreak.
    runs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = Vec::new();
    for (name, _) in runs.into_iter().skip(keep) {
        let path = backtest_root.join(&name);
        if let Err(err) = remove_path(&path) {
            warn!(run = %name, "retention removal failed: {err}");
            continue;
        }
        removed.push(name);
    }
    if !removed.is_empty() {
        debug!(removed = removed.len(), "retention removed old runs");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_run(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metrics.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_update_latest_symlink_points_at_run() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let run = make_run(root, "20260101-000000");

        let latest = update_latest(root, &run).unwrap();
        assert!(latest.join("metrics.json").exists());

        // Re-pointing replaces the previous link
        let run2 = make_run(root, "20260102-000000");
        std::fs::write(run2.join("metrics.json"), r#"{"v":2}"#).unwrap();
        let latest = update_latest(root, &run2).unwrap();
        assert_eq!(
            std::fs::read_to_string(latest.join("metrics.json")).unwrap(),
            r#"{"v":2}"#
        );
    }

    #[test]
    fn test_cleanup_keeps_newest_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for name in [
            "20260101-000000",
            "20260102-000000",
            "20260103-000000",
            "20260104-000000",
        ] {
            make_run(root, name);
        }

        let removed = cleanup_old_runs(root, 2).unwrap();
        assert_eq!(removed, vec!["20260102-000000", "20260101-000000"]);
        assert!(root.join("20260104-000000").exists());
        assert!(root.join("20260103-000000").exists());
        assert!(!root.join("20260101-000000").exists());
    }

    #[test]
    fn test_cleanup_never_touches_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let run = make_run(root, "20260101-000000");
        make_run(root, "20260102-000000");
        update_latest(root, &run).unwrap();

        let removed = cleanup_old_runs(root, 1).unwrap();
        assert_eq!(removed, vec!["20260101-000000"]);
        // latest survives even though its target was removed; it is only
        // ever re-pointed by a successful run.
        assert!(std::fs::symlink_metadata(root.join("latest")).is_ok());
        assert!(root.join("20260102-000000").exists());
    }

    #[test]
    fn test_cleanup_missing_root_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(cleanup_old_runs(&missing, 3).unwrap().is_empty());
    }

    #[test]
    fn test_keep_at_least_one() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_run(root, "20260101-000000");
        let removed = cleanup_old_runs(root, 0).unwrap();
        assert!(removed.is_empty());
        assert!(root.join("20260101-000000").exists());
    }
}
